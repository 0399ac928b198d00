//! Process-wide publish queue.
//!
//! Three knobs: max in-flight publishes, max admissions per interval
//! (sliding window, admissions count against the window whether or not the
//! job has finished), and a bounded per-job retry loop with linear backoff.
//! Every attempt and the final outcome emit a structured metric event.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::publisher::{BlobPublisher, PublishError, PublishRequest, PublishResult};

/// Classified result of a publish attempt, used for metrics and to decide
/// whether another attempt is worth making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Ok,
    AuthFailed,
    RateLimited,
    ClientError,
    ServerError,
    Timeout,
    NetworkError,
    InvalidResponse,
    UnknownError,
}

impl PublishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AuthFailed => "auth_failed",
            Self::RateLimited => "rate_limited",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::InvalidResponse => "invalid_response",
            Self::UnknownError => "unknown_error",
        }
    }

    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ServerError
                | Self::Timeout
                | Self::NetworkError
                | Self::UnknownError
        )
    }
}

const NETWORK_MARKERS: [&str; 6] = [
    "ENOTFOUND",
    "EAI_AGAIN",
    "ETIMEDOUT",
    "ECONNRESET",
    "NETWORK",
    "FETCH",
];

pub fn classify(err: &PublishError) -> PublishOutcome {
    match err {
        PublishError::Failed { status, .. } => match status {
            401 | 403 => PublishOutcome::AuthFailed,
            429 => PublishOutcome::RateLimited,
            400..=499 => PublishOutcome::ClientError,
            500..=599 => PublishOutcome::ServerError,
            _ => PublishOutcome::UnknownError,
        },
        PublishError::Timeout | PublishError::Aborted => PublishOutcome::Timeout,
        PublishError::Network(message) => {
            let upper = message.to_uppercase();
            if NETWORK_MARKERS.iter().any(|m| upper.contains(m))
                || upper.contains("CONNECT")
                || upper.contains("TIMED OUT")
                || upper.contains("SENDING REQUEST")
            {
                PublishOutcome::NetworkError
            } else {
                PublishOutcome::UnknownError
            }
        }
        PublishError::MissingBlobId => PublishOutcome::InvalidResponse,
        PublishError::InvalidEpochs
        | PublishError::InsufficientBalance { .. }
        | PublishError::BalanceCheck(_) => PublishOutcome::ClientError,
        PublishError::Io(_) => PublishOutcome::UnknownError,
    }
}

fn http_status(err: &PublishError) -> Option<u16> {
    match err {
        PublishError::Failed { status, .. } => Some(*status),
        _ => None,
    }
}

/// Sliding-window admission: at most `cap` admissions within any trailing
/// `interval`.
struct IntervalWindow {
    cap: u32,
    interval: Duration,
    admissions: VecDeque<Instant>,
}

impl IntervalWindow {
    fn new(cap: u32, interval: Duration) -> Self {
        Self {
            cap,
            interval,
            admissions: VecDeque::new(),
        }
    }

    /// Time to wait before the next admission fits, or `None` if it fits now
    /// (in which case the admission is recorded).
    fn try_admit(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while let Some(front) = self.admissions.front() {
            if now.duration_since(*front) >= self.interval {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
        if (self.admissions.len() as u32) < self.cap {
            self.admissions.push_back(now);
            return None;
        }
        let oldest = *self.admissions.front().expect("window is non-empty");
        Some(self.interval.saturating_sub(now.duration_since(oldest)))
    }
}

pub struct PublishCoordinator {
    publisher: Arc<dyn BlobPublisher>,
    permits: Arc<Semaphore>,
    window: Mutex<IntervalWindow>,
    max_retries: u32,
    base_delay: Duration,
}

impl PublishCoordinator {
    pub fn new(
        publisher: Arc<dyn BlobPublisher>,
        concurrency: usize,
        interval_cap: u32,
        interval: Duration,
        max_retries: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            publisher,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            window: Mutex::new(IntervalWindow::new(interval_cap.max(1), interval)),
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    async fn admit(&self, cancel: &CancellationToken) -> PublishResult<()> {
        loop {
            let wait = self.window.lock().await.try_admit();
            match wait {
                None => return Ok(()),
                Some(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PublishError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run `req` through the publisher with admission control and bounded
    /// retries. Returns the blob id.
    pub async fn submit(
        &self,
        req: PublishRequest,
        cancel: &CancellationToken,
    ) -> PublishResult<String> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PublishError::Aborted)?;
        self.admit(cancel).await?;

        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            let started = Instant::now();
            let result = self.publisher.publish(&req, cancel).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(blob_id) => {
                    info!(
                        target: "floe::publish_metrics",
                        upload_id = %req.upload_id,
                        size_bytes = req.size_bytes,
                        epochs = req.epochs,
                        attempt,
                        duration_ms,
                        outcome = PublishOutcome::Ok.as_str(),
                        "publish attempt finished"
                    );
                    return Ok(blob_id);
                }
                Err(err) => {
                    let outcome = classify(&err);
                    warn!(
                        target: "floe::publish_metrics",
                        upload_id = %req.upload_id,
                        size_bytes = req.size_bytes,
                        epochs = req.epochs,
                        attempt,
                        duration_ms,
                        outcome = outcome.as_str(),
                        http_status = http_status(&err),
                        error = %err,
                        "publish attempt failed"
                    );
                    let abort = matches!(err, PublishError::Aborted) || cancel.is_cancelled();
                    let retryable = outcome.is_retryable() && !abort;
                    last_err = Some(err);
                    if !retryable || attempt == self.max_retries {
                        break;
                    }
                    let backoff = self.base_delay * attempt;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        Err(last_err.unwrap_or(PublishError::Aborted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[test]
    fn classification_matches_the_taxonomy() {
        let cases = [
            (
                PublishError::Failed {
                    status: 401,
                    body: String::new(),
                },
                PublishOutcome::AuthFailed,
            ),
            (
                PublishError::Failed {
                    status: 403,
                    body: String::new(),
                },
                PublishOutcome::AuthFailed,
            ),
            (
                PublishError::Failed {
                    status: 429,
                    body: String::new(),
                },
                PublishOutcome::RateLimited,
            ),
            (
                PublishError::Failed {
                    status: 404,
                    body: String::new(),
                },
                PublishOutcome::ClientError,
            ),
            (
                PublishError::Failed {
                    status: 503,
                    body: String::new(),
                },
                PublishOutcome::ServerError,
            ),
            (PublishError::Timeout, PublishOutcome::Timeout),
            (
                PublishError::Network("ECONNRESET while sending body".into()),
                PublishOutcome::NetworkError,
            ),
            (PublishError::MissingBlobId, PublishOutcome::InvalidResponse),
        ];
        for (err, expected) in cases {
            assert_eq!(classify(&err), expected, "classifying {err:?}");
        }
    }

    #[test]
    fn retryability_per_outcome() {
        assert!(PublishOutcome::RateLimited.is_retryable());
        assert!(PublishOutcome::ServerError.is_retryable());
        assert!(PublishOutcome::NetworkError.is_retryable());
        assert!(!PublishOutcome::AuthFailed.is_retryable());
        assert!(!PublishOutcome::ClientError.is_retryable());
        assert!(!PublishOutcome::InvalidResponse.is_retryable());
    }

    struct FlakyPublisher {
        calls: AtomicU32,
        fail_first: u32,
        error_status: u16,
    }

    #[async_trait]
    impl BlobPublisher for FlakyPublisher {
        async fn publish(
            &self,
            _req: &PublishRequest,
            _cancel: &CancellationToken,
        ) -> PublishResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(PublishError::Failed {
                    status: self.error_status,
                    body: "boom".into(),
                })
            } else {
                Ok("blob-ok".into())
            }
        }
    }

    fn request() -> PublishRequest {
        PublishRequest {
            upload_id: Uuid::new_v4(),
            file_path: PathBuf::from("/nonexistent"),
            size_bytes: 1,
            epochs: 1,
        }
    }

    fn coordinator(publisher: Arc<dyn BlobPublisher>) -> PublishCoordinator {
        PublishCoordinator::new(
            publisher,
            2,
            10,
            Duration::from_millis(100),
            3,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let publisher = Arc::new(FlakyPublisher {
            calls: AtomicU32::new(0),
            fail_first: 2,
            error_status: 503,
        });
        let coord = coordinator(publisher.clone());
        let blob = coord
            .submit(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(blob, "blob-ok");
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_auth_failures() {
        let publisher = Arc::new(FlakyPublisher {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error_status: 403,
        });
        let coord = coordinator(publisher.clone());
        let err = coord
            .submit(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Failed { status: 403, .. }));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let publisher = Arc::new(FlakyPublisher {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error_status: 502,
        });
        let coord = coordinator(publisher.clone());
        let err = coord
            .submit(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Failed { status: 502, .. }));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_window_caps_admissions() {
        let mut window = IntervalWindow::new(2, Duration::from_secs(1));
        assert!(window.try_admit().is_none());
        assert!(window.try_admit().is_none());
        let wait = window.try_admit().expect("third admission must wait");
        assert!(wait <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(window.try_admit().is_none());
    }
}
