//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller passed arguments the provider contract rejects.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote call failed as a whole.
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] datashare_proto::Error),

    /// The client was closed.
    #[error("client is closed")]
    Closed,
}
