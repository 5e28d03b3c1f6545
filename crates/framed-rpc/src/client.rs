use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use framed_rpc_proto::{
    prototype, CodecError, CompressionType, DynValue, LogTags, Method, MethodVersion, Prototype,
    SeqNumber,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::call::PendingCall;
use crate::connection::Inner;
use crate::instrument::NetworkInstrumenter;
use crate::message::{call_type, encode_call, encode_cancel, encode_notify};
use crate::unwrap::{DynErrorUnwrapper, ErrorUnwrapper};
use crate::{log, CallError, TransportError};

/// Per-call settings for [`Client::call_with`].
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Requested argument and result compression. Only V1 method identities can be compressed,
    /// and only with a compressor this side has; otherwise the call goes out uncompressed.
    pub compression: CompressionType,
    pub tags: LogTags,
    pub cancel: Option<CancellationToken>,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Issues calls and notifications over a [`crate::Connection`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
    unwrapper: Option<Arc<dyn DynErrorUnwrapper>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("custom_unwrapper", &self.unwrapper.is_some())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            unwrapper: None,
        }
    }

    /// Reads the error field of this client's responses with `unwrapper`.
    pub fn with_error_unwrapper<U: ErrorUnwrapper>(mut self, unwrapper: U) -> Self {
        self.unwrapper = Some(Arc::new(unwrapper));
        self
    }

    pub async fn call<A, R>(&self, method: impl Into<Method>, arg: &A) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.call_with(method, arg, CallOptions::default()).await
    }

    pub async fn call_with<A, R>(
        &self,
        method: impl Into<Method>,
        arg: &A,
        options: CallOptions,
    ) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let value = self
            .invoke(method.into(), arg, Some(prototype::<R>()), options)
            .await?;
        let Some(value) = value else {
            return Err(result_error("response carried no result"));
        };
        value
            .downcast::<R>()
            .map(|value| *value)
            .map_err(|_| result_error("result decoded into an unexpected type"))
    }

    /// Calls `method` and waits for completion without reading the result.
    pub async fn call_discard<A>(
        &self,
        method: impl Into<Method>,
        arg: &A,
        options: CallOptions,
    ) -> Result<(), CallError>
    where
        A: Serialize + ?Sized,
    {
        self.invoke(method.into(), arg, None, options).await.map(|_| ())
    }

    pub async fn notify<A>(&self, method: impl Into<Method>, arg: &A) -> Result<(), TransportError>
    where
        A: Serialize + ?Sized,
    {
        self.notify_with(method, arg, &LogTags::new()).await
    }

    pub async fn notify_with<A>(
        &self,
        method: impl Into<Method>,
        arg: &A,
        tags: &LogTags,
    ) -> Result<(), TransportError>
    where
        A: Serialize + ?Sized,
    {
        if self.inner.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = encode_notify(&method.into(), arg, tags)?;
        self.inner.writer.send(frame).await
    }

    async fn invoke<A>(
        &self,
        method: Method,
        arg: &A,
        result: Option<Prototype>,
        options: CallOptions,
    ) -> Result<Option<DynValue>, CallError>
    where
        A: Serialize + ?Sized,
    {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(TransportError::ConnectionClosed.into());
        }

        let seqno = inner.next_seqno();
        let compression = if method.version() == MethodVersion::V1
            && inner.compressors.supports(options.compression)
        {
            options.compression
        } else {
            CompressionType::None
        };
        let frame = encode_call(
            seqno,
            &method,
            compression,
            &inner.compressors,
            arg,
            &options.tags,
        )
        .map_err(TransportError::from)?;

        let name = method.to_string();
        let unwrapper = self
            .unwrapper
            .clone()
            .unwrap_or_else(|| inner.unwrapper.clone());
        let mut instrumenter = NetworkInstrumenter::new(
            inner.instrumentation.clone(),
            call_type(&method, compression),
            &name,
        );
        instrumenter.increment_size(frame.len());
        let (call, mut rx) =
            PendingCall::new(seqno, name.clone(), result, unwrapper, compression, instrumenter);
        inner.calls.register(call)?;
        let mut guard = CallGuard {
            inner: inner.as_ref(),
            seqno,
            method: &method,
            armed: true,
        };
        log::client_call(seqno, &name);

        if let Err(err) = inner.writer.send(frame).await {
            if let Some(call) = guard.release() {
                call.abandon();
            }
            log::client_reply(seqno, &name, Some(&err));
            return Err(err.into());
        }

        let cancel = options.cancel.unwrap_or_default();
        let timeout = options.timeout;
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let abandoned = tokio::select! {
            res = &mut rx => {
                guard.armed = false;
                return finish(seqno, &name, res.unwrap_or(Err(TransportError::ConnectionClosed.into())));
            }
            _ = cancel.cancelled() => CallError::Canceled,
            _ = deadline => CallError::Timeout,
        };

        let Some(call) = guard.release() else {
            // The response is being delivered right now.
            let res = rx.await.unwrap_or(Err(TransportError::ConnectionClosed.into()));
            return finish(seqno, &name, res);
        };
        call.abandon();

        if let Ok(frame) = encode_cancel(seqno, &method) {
            let _ = inner.writer.send(frame).await;
        }
        finish(seqno, &name, Err(abandoned))
    }
}

/// Unregisters a call whose caller stopped waiting and tells the peer to cancel it.
struct CallGuard<'a> {
    inner: &'a Inner,
    seqno: SeqNumber,
    method: &'a Method,
    armed: bool,
}

impl CallGuard<'_> {
    /// Takes the call back from the container. `None` once a response has claimed it.
    fn release(&mut self) -> Option<PendingCall> {
        self.armed = false;
        self.inner.calls.retrieve_and_remove(self.seqno)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(call) = self.inner.calls.retrieve_and_remove(self.seqno) else {
            return;
        };
        log::client_reply(self.seqno, &call.method, Some(&"call future dropped"));
        call.abandon();
        if let Ok(frame) = encode_cancel(self.seqno, self.method) {
            // Drop cannot wait for queue room.
            let _ = self.inner.writer.try_send(frame);
        }
    }
}

fn finish(
    seqno: SeqNumber,
    method: &str,
    res: Result<Option<DynValue>, CallError>,
) -> Result<Option<DynValue>, CallError> {
    log::client_reply(seqno, method, res.as_ref().err().map(|err| err as &dyn Display));
    res
}

fn result_error(message: &str) -> CallError {
    CallError::Decode(CodecError::Field {
        field: 3,
        message: message.to_string(),
    })
}
