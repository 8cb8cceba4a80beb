//! Error types for native-host
//!
//! Provides error types used throughout the native-host crate.

use thiserror::Error;

/// Native host error type
#[derive(Error, Debug)]
pub enum NativeError {
    #[error("pool has been destroyed")]
    PoolDestroyed,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("chunked request body without content length")]
    LengthRequired,

    #[error("client read error: {0}")]
    ClientRead(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type for native operations
pub type NativeResult<T> = Result<T, NativeError>;
