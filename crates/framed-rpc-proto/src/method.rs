//! Method identities as they appear on the wire.
//!
//! A V1 identity is the text `"<protocol>.<method>"`. A V2 identity is the pair
//! `[protocol unique id, method position]`, which survives renames and needs no string parsing.

use std::fmt;

use crate::unique::{Position, ProtocolUniqueId};
use crate::{CodecError, FieldDecoder, FieldEncoder, ResolveError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MethodVersion {
    V1,
    V2,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodV1 {
    pub name: String,
}

impl MethodV1 {
    /// Splits the name at its last `.` into protocol and method.
    pub fn split(&self) -> Result<(&str, &str), ResolveError> {
        match self.name.rsplit_once('.') {
            Some((protocol, method)) if !protocol.is_empty() && !method.is_empty() => {
                Ok((protocol, method))
            }
            _ => Err(ResolveError::InvalidName {
                name: self.name.clone(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodV2 {
    pub protocol: ProtocolUniqueId,
    pub position: Position,
    /// Filled in by a successful [`Method::resolve`]; used for logs.
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    V1(MethodV1),
    V2(MethodV2),
}

/// The lookup a [`Method`] needs in order to resolve itself to a handler.
pub trait MethodLookup {
    type Handler;

    fn lookup_by_name(&self, protocol: &str, method: &str) -> Result<Self::Handler, ResolveError>;

    /// Returns the handler together with its `"<protocol>.<method>"` name.
    fn lookup_by_id(
        &self,
        protocol: ProtocolUniqueId,
        position: Position,
    ) -> Result<(String, Self::Handler), ResolveError>;
}

impl Method {
    pub fn v1(protocol: &str, method: &str) -> Method {
        Method::V1(MethodV1 {
            name: format!("{protocol}.{method}"),
        })
    }

    pub fn v2(protocol: ProtocolUniqueId, position: Position) -> Method {
        Method::V2(MethodV2 {
            protocol,
            position,
            name: None,
        })
    }

    pub fn version(&self) -> MethodVersion {
        match self {
            Method::V1(_) => MethodVersion::V1,
            Method::V2(_) => MethodVersion::V2,
        }
    }

    /// Fields this identity occupies in a frame.
    pub fn num_fields(version: MethodVersion) -> usize {
        match version {
            MethodVersion::V1 | MethodVersion::V2 => 1,
        }
    }

    pub fn decode(version: MethodVersion, d: &mut FieldDecoder<'_>) -> Result<Method, CodecError> {
        match version {
            MethodVersion::V1 => Ok(Method::V1(MethodV1 { name: d.decode()? })),
            MethodVersion::V2 => {
                let (protocol, position): (u64, u64) = d.decode()?;
                Ok(Method::v2(ProtocolUniqueId(protocol), Position(position)))
            }
        }
    }

    pub fn encode(&self, e: &mut FieldEncoder) -> Result<(), CodecError> {
        match self {
            Method::V1(m) => e.push(&m.name),
            Method::V2(m) => e.push(&(m.protocol.0, m.position.0)),
        }
    }

    /// Resolves this identity to a handler. A V2 identity learns its name on success.
    pub fn resolve<L: MethodLookup>(&mut self, lookup: &L) -> Result<L::Handler, ResolveError> {
        match self {
            Method::V1(m) => {
                let (protocol, method) = m.split()?;
                lookup.lookup_by_name(protocol, method)
            }
            Method::V2(m) => {
                let (name, handler) = lookup.lookup_by_id(m.protocol, m.position)?;
                m.name = Some(name);
                Ok(handler)
            }
        }
    }
}

impl From<&str> for Method {
    fn from(name: &str) -> Self {
        Method::V1(MethodV1 {
            name: name.to_string(),
        })
    }
}

impl From<String> for Method {
    fn from(name: String) -> Self {
        Method::V1(MethodV1 { name })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::V1(m) => f.write_str(&m.name),
            Method::V2(MethodV2 {
                name: Some(name), ..
            }) => f.write_str(name),
            Method::V2(m) => write!(f, "{}/{}", m.protocol, m.position.0),
        }
    }
}
