//! Worker configuration.
//!
//! Library defaults live in [`WorkerConfig::default`]; the `duplex_worker` binary
//! overrides them from its command line.
use thiserror::Error;

use crate::protocol::frame::{DEFAULT_MAX_PAYLOAD, FrameCodec};

/// Default size of a single StreamChunk frame: 64 KiB.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 << 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid '{name}' setting, {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Largest frame payload accepted or produced.
    pub max_frame_payload: usize,
    /// Streamed chunks larger than this are split across several frames.
    pub max_chunk_size: usize,
    /// Streams are closed once this many body bytes have been sent.
    pub max_stream_bytes: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_stream_bytes: None,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_payload == 0 || self.max_frame_payload > u32::MAX as usize {
            return Err(ConfigError::Invalid {
                name: "max_frame_payload",
                reason: format!("must be between 1 and {}", u32::MAX),
            });
        }
        if self.max_chunk_size == 0 || self.max_chunk_size > self.max_frame_payload {
            return Err(ConfigError::Invalid {
                name: "max_chunk_size",
                reason: format!(
                    "must be between 1 and the frame payload limit ({})",
                    self.max_frame_payload
                ),
            });
        }
        Ok(())
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_frame_payload)
    }
}
