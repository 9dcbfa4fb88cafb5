use std::io;

use thiserror::Error;

use crate::StreamIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy of the pump. Every variant is fatal for the process;
/// queue saturation is reported separately as [`Backpressure`].
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid topology, format or descriptor. Raised before any device streams.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Capture dequeue/queue or display commit failure.
    #[error("device I/O error on {device}: {source}")]
    DeviceIo {
        device: String,
        #[source]
        source: io::Error,
    },

    /// An internal ownership or sequencing invariant was broken.
    #[error("assertion violation: {0}")]
    Assertion(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn device(device: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Error::DeviceIo {
            device: device.into(),
            source: source.into(),
        }
    }

    pub fn assertion(msg: impl Into<String>) -> Self {
        Error::Assertion(msg.into())
    }

    pub fn is_assertion(&self) -> bool {
        matches!(self, Error::Assertion(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

/// A pending-commit queue reached its bound: the display is slower than
/// the capture device feeding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backpressure {
    pub stream: StreamIndex,
    pub depth: usize,
    pub bound: usize,
}
