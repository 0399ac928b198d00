//! Walrus object-store clients.
//!
//! Writes go through [`publisher::PublisherClient`] (one shot per attempt)
//! under [`coordinator::PublishCoordinator`], which owns concurrency,
//! admission pacing, retries and outcome metrics. Reads come from
//! [`aggregator::AggregatorPool`], which serves bounded sub-range fetches
//! with failover across an ordered endpoint list.

pub mod aggregator;
pub mod coordinator;
pub mod publisher;

pub use aggregator::{AggregatorPool, FetchError, SegmentFetch, SegmentSource};
pub use coordinator::{PublishCoordinator, PublishOutcome};
pub use publisher::{BlobPublisher, PublishError, PublishRequest, PublisherClient};
