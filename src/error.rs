use thiserror::Error;

/// fatal engine failures. Nothing is retried at this level: transient
/// faults are hidden by the I/O layer before it reports success.
#[derive(Debug, Error)]
pub enum EngineError {
    /// invalid configuration, detected at startup
    #[error("configuration error: {0}")]
    Config(String),
    /// a request failed in the underlying I/O layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// malformed graph header, index or vertex record
    #[error("format error: {0}")]
    Format(String),
    /// a message reached the wrong partition or a queue overflowed its cap
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// buffer or pool expansion failed
    #[error("resource exhausted: {0}")]
    Resource(String),
    /// frontier queue re-initialized while a fetch was in progress
    #[error("frontier queue busy")]
    FrontierBusy,
}
