//! Wire layer for framed-rpc.
//!
//! This crate implements:
//! - the frame field codec (`FieldDecoder`/`FieldEncoder`) over CBOR, with a non-allocating
//!   structural preflight before any field is interpreted
//! - the stable message-type and compression-type tags shared by both ends of a connection
//! - method identities (by name, or by protocol unique id + position) and the lookup contract
//!   used to resolve them to handlers
//! - pluggable payload compression (`gzip`, `zlib`, and optionally `zstd`)
//! - an explicit registry of 64-bit unique ids for collision checking
//!
//! Nothing here depends on an async runtime; `framed-rpc` builds the connection on top.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

mod cbor;
pub mod codec;
pub mod compression;
mod error;
pub mod method;
pub mod unique;

pub use codec::{prototype, DynValue, FieldDecoder, FieldEncoder, Prototype, WireBytes};
pub use compression::{CompressorCache, Compressor};
pub use error::{CodecError, ResolveError};
pub use method::{Method, MethodLookup, MethodV1, MethodV2, MethodVersion};
pub use unique::{Position, ProtocolUniqueId, TypeUniqueId, UniqueIdCollision, UniqueIdRegistry};

/// Caller-assigned number correlating a call with its response.
pub type SeqNumber = i64;

/// Log tags carried in the optional trailing field of call and notify frames.
pub type LogTags = std::collections::BTreeMap<String, String>;

/// Upper bound on a single frame payload, used when no tighter limit is configured.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// Message-type tag: the first field of every frame.
///
/// The numeric values are part of the wire format; changing them breaks interoperability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call,
    Response,
    Notify,
    Cancel,
    CallCompressed,
    CallV2,
    NotifyV2,
    CancelV2,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::Call,
        MessageType::Response,
        MessageType::Notify,
        MessageType::Cancel,
        MessageType::CallCompressed,
        MessageType::CallV2,
        MessageType::NotifyV2,
        MessageType::CancelV2,
    ];

    pub fn tag(self) -> i64 {
        match self {
            MessageType::Call => 0,
            MessageType::Response => 1,
            MessageType::Notify => 2,
            MessageType::Cancel => 3,
            MessageType::CallCompressed => 4,
            MessageType::CallV2 => 5,
            MessageType::NotifyV2 => 6,
            MessageType::CancelV2 => 7,
        }
    }

    pub fn from_tag(tag: i64) -> Option<MessageType> {
        Self::ALL.into_iter().find(|typ| typ.tag() == tag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Call => "Call",
            MessageType::Response => "Response",
            MessageType::Notify => "Notify",
            MessageType::Cancel => "Cancel",
            MessageType::CallCompressed => "CallCompressed",
            MessageType::CallV2 => "CallV2",
            MessageType::NotifyV2 => "NotifyV2",
            MessageType::CancelV2 => "CancelV2",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.tag())
    }
}

/// Compression applied to an argument or result payload.
///
/// Tags outside the known set decode to `Unknown` instead of failing: a peer that does not
/// recognize a compression type simply treats the payload as uncompressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompressionType {
    None,
    Gzip,
    Zlib,
    Zstd,
    Unknown(i64),
}

impl CompressionType {
    pub fn tag(self) -> i64 {
        match self {
            CompressionType::None => 0,
            CompressionType::Gzip => 1,
            CompressionType::Zlib => 2,
            CompressionType::Zstd => 3,
            CompressionType::Unknown(tag) => tag,
        }
    }

    pub fn from_tag(tag: i64) -> CompressionType {
        match tag {
            0 => CompressionType::None,
            1 => CompressionType::Gzip,
            2 => CompressionType::Zlib,
            3 => CompressionType::Zstd,
            other => CompressionType::Unknown(other),
        }
    }

    pub fn from_name(name: &str) -> Option<CompressionType> {
        match name {
            "none" => Some(CompressionType::None),
            "gzip" => Some(CompressionType::Gzip),
            "zlib" => Some(CompressionType::Zlib),
            "zstd" => Some(CompressionType::Zstd),
            _ => None,
        }
    }

    pub fn is_none(self) -> bool {
        self == CompressionType::None
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        CompressionType::None
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionType::None => f.write_str("none"),
            CompressionType::Gzip => f.write_str("gzip"),
            CompressionType::Zlib => f.write_str("zlib"),
            CompressionType::Zstd => f.write_str("zstd"),
            CompressionType::Unknown(tag) => write!(f, "unknown({tag})"),
        }
    }
}

impl Serialize for CompressionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.tag())
    }
}

// The wire always carries the integer tag. Configuration files may also spell the name.
impl<'de> Deserialize<'de> for CompressionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CompressionVisitor;

        impl<'de> de::Visitor<'de> for CompressionVisitor {
            type Value = CompressionType;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a compression type tag or name")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(CompressionType::from_tag(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                let tag = i64::try_from(v).map_err(|_| E::custom("compression tag out of range"))?;
                Ok(CompressionType::from_tag(tag))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                CompressionType::from_name(v)
                    .ok_or_else(|| E::custom(format!("unknown compression type {v:?}")))
            }
        }

        deserializer.deserialize_any(CompressionVisitor)
    }
}
