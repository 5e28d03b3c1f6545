//! Tokio-based runtime for framed-rpc connections.
//!
//! This crate implements:
//! - u32 length-prefixed framing with strict size checks before allocation
//! - a single writer per connection, so concurrent replies never interleave mid-frame
//! - multiplexed concurrent calls in both directions, matched by sequence number
//! - one spawned task per inbound call, with cooperative cancellation by seqno
//! - optional per-call compression of arguments and results (`gzip`, `zlib`, `zstd`)
//! - pluggable wire-error wrapping/unwrapping and per-message instrumentation
//!
//! The wire layer itself lives in `framed-rpc-proto`.

mod call;
mod client;
mod config;
mod connection;
mod context;
mod error;
mod instrument;
mod log;
mod message;
mod registry;
mod request;
mod transport;
mod unwrap;

pub use client::{CallOptions, Client};
pub use config::{ConnectionConfig, DEFAULT_MAX_FRAME_LEN, DEFAULT_WRITE_QUEUE_LEN};
pub use connection::{Connection, ConnectionBuilder};
pub use context::RequestContext;
pub use error::{AppError, CallError, DecodeError, MessageError, RegistryError, TransportError};
pub use instrument::{
    InstrumentationSnapshot, InstrumentationStorage, MemoryInstrumentationStorage,
    NetworkInstrumenter, NoopInstrumentationStorage, Record, TagSnapshot,
};
pub use registry::{MethodHandler, Protocol, Registry};
pub use unwrap::{
    default_wrap_error, ErrorUnwrapper, RemoteError, StringErrorUnwrapper, UnwrapError,
    WrapErrorFn,
};

pub use framed_rpc_proto::{
    CodecError, CompressionType, Compressor, LogTags, MessageType, Method, Position,
    ProtocolUniqueId, ResolveError, SeqNumber, UniqueIdRegistry,
};
pub use tokio_util::sync::CancellationToken;
