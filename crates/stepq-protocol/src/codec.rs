use crate::{
    Content, Envelope, ProtocolError, ResultEnvelope, Result, TaskEnvelope, ENVELOPE_VERSION,
    MAX_MESSAGE_SIZE,
};

/// Encodes envelopes into queue message bodies and back.
///
/// Bodies are JSON text. The size limit applies to the exact encoded string,
/// since that is what the queue provider measures.
#[derive(Debug, Clone, Copy)]
pub struct BodyCodec {
    max_message_size: usize,
}

impl Default for BodyCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl BodyCodec {
    pub fn new(max_message_size: usize) -> Self {
        BodyCodec { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode without enforcing the size limit. Callers use `fits` to decide
    /// whether to offload.
    pub fn encode(&self, envelope: &Envelope) -> Result<String> {
        Ok(serde_json::to_string(envelope)?)
    }

    /// Length of the exact string `encode` would produce.
    pub fn encoded_len(&self, envelope: &Envelope) -> Result<usize> {
        Ok(self.encode(envelope)?.len())
    }

    pub fn fits(&self, body: &str) -> bool {
        body.len() <= self.max_message_size
    }

    /// Encode and fail with `MessageTooLarge` when the body is over the limit.
    pub fn encode_checked(&self, envelope: &Envelope) -> Result<String> {
        let body = self.encode(envelope)?;
        if !self.fits(&body) {
            return Err(ProtocolError::MessageTooLarge {
                size: body.len(),
                max: self.max_message_size,
            });
        }
        Ok(body)
    }

    pub fn decode(&self, body: &str) -> Result<Envelope> {
        let envelope: Envelope = serde_json::from_str(body)?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(envelope.v));
        }
        Ok(envelope)
    }

    pub fn decode_task(&self, body: &str) -> Result<TaskEnvelope> {
        match self.decode(body)?.content {
            Content::Task(task) => Ok(task),
            Content::Result(_) => Err(ProtocolError::UnexpectedContent { expected: "task" }),
        }
    }

    pub fn decode_result(&self, body: &str) -> Result<ResultEnvelope> {
        match self.decode(body)?.content {
            Content::Result(result) => Ok(result),
            Content::Task(_) => Err(ProtocolError::UnexpectedContent { expected: "result" }),
        }
    }
}
