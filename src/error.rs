use thiserror::Error;

use crate::routing::Route;

/// Terminal failure of a single message's processing.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("{kind} processing timed out after {secs}s")]
    Timeout { kind: Route, secs: u64 },

    #[error("failed to download {kind}: {reason}")]
    Download { kind: Route, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

