//! Shared setup for the demo binaries.
use std::time::{Duration, UNIX_EPOCH};

use segaro::{Config, ConnectionBinding, DecoyRanges};
use tracing_subscriber::EnvFilter;

/// Address the echo server listens on.
pub const ADDRESS: &str = "127.0.0.1:9092";

/// Installs a `tracing` subscriber honoring `RUST_LOG`, `info` by default.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// The configuration both demo endpoints use.
pub fn config() -> Config {
    Config::builder_with_padding(16, 64)
        .expect("valid padding")
        .with_split_size("200-400".parse().expect("valid range"))
        .expect("valid split size")
        .with_decoys(
            DecoyRanges::parse("50-100", "1-3").expect("valid ranges"),
            DecoyRanges::parse("30-60", "1-2").expect("valid ranges"),
        )
}

/// Stands in for the binding a real secure channel would negotiate.
pub fn demo_binding() -> ConnectionBinding {
    ConnectionBinding::new([0x24u8; 32], UNIX_EPOCH + Duration::from_secs(1_700_000_000))
}

/// Builds a record that looks like a TLS record of content type `kind`.
pub fn record(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut record = vec![kind, 0x03, 0x03];
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(body);
    record
}
