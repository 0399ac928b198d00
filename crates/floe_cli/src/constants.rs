pub const NAME: &str = "Floe";
pub const BIN_NAME: &str = "floe";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Ingestion and read gateway for Walrus-backed assets";
