use std::io;

use thiserror::Error;

use super::frame::CodecError;

/// Errors surfaced by a worker session.
///
/// Only [`WorkerError::StreamStopped`] is recoverable; it is absorbed at the
/// producer boundary and never reaches the top-level loop. Everything else is
/// reported once through an Error frame before the process exits.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] CodecError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("stream stopped")]
    StreamStopped,

    #[error("producer fault: {0}")]
    ProducerFault(String),

    #[error("worker IO error: {0}")]
    Io(#[from] io::Error),
}

impl WorkerError {
    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        WorkerError::ProtocolViolation(reason.into())
    }

    /// Whether the error can still be reported to the peer. A failed write
    /// means the outbound stream is gone.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, WorkerError::Io(_))
    }
}
