//! Error types for script-bridge
//!
//! Provides structured error handling across all wrapper components.

use http::StatusCode;
use native_host::NativeError;
use thiserror::Error;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Wrong argument type; nothing was mutated
    #[error("Type error: {message}")]
    Type { message: String },

    /// Missing table key, distinct from an empty value
    #[error("Key not found: {key}")]
    NotFound { key: String },

    /// Transport read/write/flush failure
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<NativeError>,
    },

    /// Read or write on a closed resource
    #[error("{resource} is closed")]
    Closed { resource: String },

    /// Phase name outside the closed set
    #[error("Invalid phase: {name}")]
    InvalidPhase { name: String },

    /// Advancing a handler list with no entries left
    #[error("Handler list is exhausted")]
    Exhausted,

    /// Table size changed while an iterator was walking it
    #[error("Table changed size during iteration")]
    ConcurrentModification,

    /// Argument has the right type but an unusable value
    #[error("Value error: {message}")]
    Value { message: String },

    /// Operation not allowed in the current state
    #[error("State error: {message}")]
    State { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A script handler failed
    #[error("Handler {name} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Error raised by the native host
    #[error(transparent)]
    Native(#[from] NativeError),
}

impl BridgeError {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    pub fn io_with_source(message: impl Into<String>, source: NativeError) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn closed(resource: impl Into<String>) -> Self {
        Self::Closed {
            resource: resource.into(),
        }
    }

    pub fn invalid_phase(name: impl Into<String>) -> Self {
        Self::InvalidPhase { name: name.into() }
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::Value {
            message: message.into(),
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn handler(name: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Handler {
            name: name.into(),
            source,
        }
    }

    /// Status the host should answer with when this error ends a phase
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::Native(NativeError::LengthRequired) => StatusCode::LENGTH_REQUIRED,
            BridgeError::Io {
                source: Some(NativeError::LengthRequired),
                ..
            } => StatusCode::LENGTH_REQUIRED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
