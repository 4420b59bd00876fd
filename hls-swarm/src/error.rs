//! Error taxonomy for the harness.
//!
//! Per the propagation policy: a single client's failures must never stop
//! other clients or the orchestrator. Only the variants below are allowed
//! to escape to `main` (fatal, or shutdown-path).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("failed to build command for client {client_id}: {source}")]
    ClientBuild {
        client_id: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to spawn client {client_id}: {source}")]
    Spawn {
        client_id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("shutdown timed out with {remaining} client(s) still running")]
    ShutdownTimeout { remaining: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
