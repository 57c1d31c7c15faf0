mod codec;
mod envelope;

pub use codec::BodyCodec;
pub use envelope::{Body, Content, Envelope, ResultEnvelope, TaskEnvelope};

use thiserror::Error;

/// Envelope format version written by this crate
pub const ENVELOPE_VERSION: u32 = 1;

/// Largest message body the queue provider accepts inline (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u32),

    #[error("Expected a {expected} envelope")]
    UnexpectedContent { expected: &'static str },

    #[error("Malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
