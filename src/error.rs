//! Unified error type for the streaming engine

use std::error::Error;
use std::fmt;

/// Errors surfaced by the engine components.
///
/// Config and model-load errors abort pipeline startup; the remaining kinds
/// are handled locally by the component that raised them.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Invalid or inconsistent configuration
    Config(String),

    /// Audio device or source failure
    Audio(String),

    /// Model could not be loaded or initialized
    ModelLoad(String),

    /// Transient decode failure (logged and swallowed by the decoder)
    Decode(String),

    /// Translation request failure (drives the router's failover state)
    Translation(String),

    /// Control-plane transport failure
    Server(String),

    /// I/O error (model files, downloads)
    Io(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            EngineError::Audio(msg) => write!(f, "Audio error: {}", msg),
            EngineError::ModelLoad(msg) => write!(f, "Model load error: {}", msg),
            EngineError::Decode(msg) => write!(f, "Decode error: {}", msg),
            EngineError::Translation(msg) => write!(f, "Translation error: {}", msg),
            EngineError::Server(msg) => write!(f, "Server error: {}", msg),
            EngineError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
