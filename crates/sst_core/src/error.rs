//! Error taxonomy for the shared state table.

use thiserror::Error;

/// Errors surfaced by table construction and replication.
///
/// Configuration problems fail fast at construction. Transport and bootstrap
/// failures are fatal to the local node: mirrors may already be inconsistent,
/// so no recovery is attempted here. Programmer errors (slot type confusion,
/// out-of-range offsets) panic instead of returning a variant.
#[derive(Debug, Error)]
pub enum SstError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("fatal transport failure: {0}")]
    FatalTransport(String),

    #[error("shared state table is draining")]
    ShuttingDown,
}

impl SstError {
    pub fn fatal(err: impl std::fmt::Display) -> SstError {
        SstError::FatalTransport(err.to_string())
    }
}
