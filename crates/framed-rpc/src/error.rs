use std::fmt;

use framed_rpc_proto::{CodecError, CompressionType, MessageType, ResolveError, SeqNumber};

use crate::unwrap::UnwrapError;

/// Application-level failure produced by a handler or surfaced from a remote peer.
pub type AppError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("allocation failed: {message}")]
    AllocationFailed { message: String },

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("encode error: {message}")]
    Encode { message: String },

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => TransportError::ConnectionClosed,
            _ => TransportError::Io {
                message: err.to_string(),
            },
        }
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        TransportError::Encode {
            message: err.to_string(),
        }
    }
}

/// Why a single inbound frame could not be processed.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("no pending call with seqno {seqno}")]
    CallNotFound { seqno: SeqNumber },
}

/// A frame-level decode failure together with whatever was learned about the frame before it.
#[derive(Debug)]
pub struct DecodeError {
    pub typ: Option<MessageType>,
    pub method: Option<String>,
    pub len: usize,
    pub compression: CompressionType,
    pub seqno: Option<SeqNumber>,
    pub source: MessageError,
}

impl DecodeError {
    pub(crate) fn new(source: impl Into<MessageError>) -> Self {
        Self {
            typ: None,
            method: None,
            len: 0,
            compression: CompressionType::None,
            seqno: None,
            source: source.into(),
        }
    }

    pub fn is_call_not_found(&self) -> bool {
        matches!(self.source, MessageError::CallNotFound { .. })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.typ {
            Some(typ) => write!(f, "failed to decode {typ}")?,
            None => f.write_str("failed to decode frame")?,
        }
        if let Some(method) = &self.method {
            write!(f, " {method}")?;
        }
        write!(f, " (len {}", self.len)?;
        if !self.compression.is_none() {
            write!(f, ", compression {}", self.compression)?;
        }
        write!(f, "): {}", self.source)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote error: {0}")]
    Remote(AppError),

    #[error("error unwrapper failed: {0}")]
    Dispatch(#[source] UnwrapError),

    #[error("failed to decode response: {0}")]
    Decode(#[source] CodecError),

    #[error("call canceled")]
    Canceled,

    #[error("call timed out")]
    Timeout,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("protocol {protocol:?} already registered")]
    AlreadyRegistered { protocol: String },

    #[error("protocol {protocol:?}: unique id {id:#018x} already registered to {existing:?}")]
    AlreadyRegisteredV2 {
        protocol: String,
        id: u64,
        existing: String,
    },

    #[error("protocol {protocol:?} declares method {method:?} twice")]
    DuplicateMethod { protocol: String, method: String },
}
