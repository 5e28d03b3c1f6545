use crate::CompressionType;

/// Failure to decode or encode a frame's fields.
///
/// Every variant is fatal to the single frame being processed; the connection keeps going.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("field {field}: {message}")]
    Field { field: usize, message: String },

    #[error("wrong message length: declared {declared} fields, need at least {minimum}, found {present}")]
    WrongMessageLength {
        declared: usize,
        minimum: usize,
        present: usize,
    },

    #[error("invalid message type tag {tag}")]
    InvalidMessageType { tag: i64 },

    #[error("failed to encode field: {message}")]
    Encode { message: String },

    #[error("{ctype} compression failed: {message}")]
    Compression {
        ctype: CompressionType,
        message: String,
    },

    #[error("decompressed payload too large: {len} bytes (max {max})")]
    DecompressedTooLarge { len: usize, max: usize },
}

impl CodecError {
    pub(crate) fn field(field: usize, err: impl std::fmt::Display) -> Self {
        CodecError::Field {
            field,
            message: err.to_string(),
        }
    }

    pub(crate) fn encode(err: impl std::fmt::Display) -> Self {
        CodecError::Encode {
            message: err.to_string(),
        }
    }
}

/// Failure to resolve a decoded method identity to a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("protocol {protocol:?} not found")]
    ProtocolNotFound { protocol: String },

    #[error("method {method:?} not found in protocol {protocol:?}")]
    MethodNotFound { protocol: String, method: String },

    #[error("protocol with unique id {id:#018x} not found")]
    ProtocolV2NotFound { id: u64 },

    #[error("method at position {position} not found in protocol {protocol:?} ({id:#018x})")]
    MethodV2NotFound {
        id: u64,
        position: u64,
        protocol: String,
    },

    #[error("invalid method name {name:?}: expected \"<protocol>.<method>\"")]
    InvalidName { name: String },
}
