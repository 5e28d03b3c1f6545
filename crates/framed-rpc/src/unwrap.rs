//! Translation between wire errors and application errors.
//!
//! The server side turns a handler's [`AppError`] into a CBOR value with a [`WrapErrorFn`]. The
//! client side turns that value back into an [`AppError`] with an [`ErrorUnwrapper`]. Without a
//! custom pair, errors travel as their display string and `null` (or `""`) means success.

use std::sync::Arc;

use framed_rpc_proto::{prototype, DynValue, Prototype};
use serde::de::DeserializeOwned;

use crate::AppError;

/// Converts a handler error into the value placed in a response's error field.
pub type WrapErrorFn = Arc<dyn Fn(&AppError) -> serde_cbor::Value + Send + Sync + 'static>;

pub fn default_wrap_error() -> WrapErrorFn {
    Arc::new(|err| serde_cbor::Value::Text(err.to_string()))
}

/// The unwrapper itself could not make sense of the wire error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct UnwrapError {
    pub message: String,
}

impl UnwrapError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub trait ErrorUnwrapper: Send + Sync + 'static {
    /// Shape of the error field on the wire.
    type WireError: DeserializeOwned + Send + 'static;

    /// `Ok(None)` means the response carries no error.
    fn unwrap_error(&self, wire: Self::WireError) -> Result<Option<AppError>, UnwrapError>;
}

pub(crate) trait DynErrorUnwrapper: Send + Sync {
    fn prototype(&self) -> Prototype;

    fn unwrap_dyn(&self, wire: DynValue) -> Result<Option<AppError>, UnwrapError>;
}

impl<U: ErrorUnwrapper> DynErrorUnwrapper for U {
    fn prototype(&self) -> Prototype {
        prototype::<U::WireError>()
    }

    fn unwrap_dyn(&self, wire: DynValue) -> Result<Option<AppError>, UnwrapError> {
        let wire = wire
            .downcast::<U::WireError>()
            .map_err(|_| UnwrapError::new("wire error decoded into an unexpected type"))?;
        self.unwrap_error(*wire)
    }
}

/// A non-empty string error received from the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
}

/// Reads the error field as an optional string; `null` and `""` mean success.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringErrorUnwrapper;

impl ErrorUnwrapper for StringErrorUnwrapper {
    type WireError = Option<String>;

    fn unwrap_error(&self, wire: Option<String>) -> Result<Option<AppError>, UnwrapError> {
        Ok(wire
            .filter(|message| !message.is_empty())
            .map(|message| -> AppError { Box::new(RemoteError { message }) }))
    }
}
