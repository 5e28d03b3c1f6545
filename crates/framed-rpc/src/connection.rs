use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use framed_rpc_proto::{CompressionType, Compressor, CompressorCache, MessageType, SeqNumber};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::call::CallContainer;
use crate::instrument::{InstrumentationStorage, NoopInstrumentationStorage};
use crate::message::{decode_rpc, DecodeEnv, Message};
use crate::request::{self, InFlightRequests};
use crate::transport::{read_frame, write_loop, FrameWriter};
use crate::unwrap::{default_wrap_error, DynErrorUnwrapper, ErrorUnwrapper, StringErrorUnwrapper};
use crate::{
    log, AppError, Client, ConnectionConfig, DecodeError, MessageError, Registry, TransportError,
    WrapErrorFn,
};

pub(crate) struct Inner {
    pub(crate) config: ConnectionConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) compressors: CompressorCache,
    pub(crate) calls: CallContainer,
    pub(crate) in_flight: InFlightRequests,
    pub(crate) writer: FrameWriter,
    pub(crate) wrap_error: WrapErrorFn,
    pub(crate) unwrapper: Arc<dyn DynErrorUnwrapper>,
    pub(crate) instrumentation: Arc<dyn InstrumentationStorage>,
    /// Parent of every request token. Cancelled on teardown.
    pub(crate) shutdown: CancellationToken,
    next_seqno: AtomicI64,
    closed: CancellationToken,
    close_reason: Mutex<Option<TransportError>>,
}

impl Inner {
    pub(crate) fn next_seqno(&self) -> SeqNumber {
        self.next_seqno.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_reason.lock().is_some()
    }

    /// Tears the connection down. Only the first call has any effect.
    pub(crate) fn close(&self, reason: TransportError) {
        {
            let mut guard = self.close_reason.lock();
            if guard.is_some() {
                return;
            }
            *guard = Some(reason.clone());
        }

        log::connection_closed(&reason);
        self.shutdown.cancel();
        self.calls.drain_all(TransportError::ConnectionClosed);
        self.closed.cancel();
    }

    fn decode_env(&self) -> DecodeEnv<'_> {
        DecodeEnv {
            registry: &self.registry,
            compressors: &self.compressors,
            calls: &self.calls,
            instrumentation: &self.instrumentation,
        }
    }
}

/// Configures and starts a [`Connection`].
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    registry: Arc<Registry>,
    wrap_error: WrapErrorFn,
    unwrapper: Arc<dyn DynErrorUnwrapper>,
    instrumentation: Arc<dyn InstrumentationStorage>,
    compressors: Vec<(CompressionType, Arc<dyn Compressor>)>,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self {
            config: ConnectionConfig::default(),
            registry: Arc::new(Registry::new()),
            wrap_error: default_wrap_error(),
            unwrapper: Arc::new(StringErrorUnwrapper),
            instrumentation: Arc::new(NoopInstrumentationStorage),
            compressors: Vec::new(),
        }
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Protocols served to the peer. Defaults to none.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// How handler errors are put on the wire. Defaults to their display string.
    pub fn wrap_error<F>(mut self, wrap: F) -> Self
    where
        F: Fn(&AppError) -> serde_cbor::Value + Send + Sync + 'static,
    {
        self.wrap_error = Arc::new(wrap);
        self
    }

    /// How error fields of responses are read back. [`Client::with_error_unwrapper`] overrides
    /// this per client.
    pub fn error_unwrapper<U: ErrorUnwrapper>(mut self, unwrapper: U) -> Self {
        self.unwrapper = Arc::new(unwrapper);
        self
    }

    pub fn instrumentation(mut self, storage: Arc<dyn InstrumentationStorage>) -> Self {
        self.instrumentation = storage;
        self
    }

    /// Installs a compressor for `ctype`, replacing any built-in one.
    pub fn compressor(mut self, ctype: CompressionType, compressor: Arc<dyn Compressor>) -> Self {
        self.compressors.push((ctype, compressor));
        self
    }

    /// Spawns the read and write loops on the current tokio runtime.
    pub fn start<S>(self, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut config = self.config;
        config.sanitize();

        let compressors =
            CompressorCache::new(config.compression.clone(), config.max_decompressed_len);
        for (ctype, compressor) in self.compressors {
            compressors.register(ctype, compressor);
        }
        let (writer, rx) = FrameWriter::new(config.write_queue_len, config.max_frame_len);

        let inner = Arc::new(Inner {
            config,
            registry: self.registry,
            compressors,
            calls: CallContainer::default(),
            in_flight: InFlightRequests::default(),
            writer,
            wrap_error: self.wrap_error,
            unwrapper: self.unwrapper,
            instrumentation: self.instrumentation,
            shutdown: CancellationToken::new(),
            next_seqno: AtomicI64::new(0),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(read_loop(read_half, inner.clone()));

        let writer_inner = inner.clone();
        tokio::spawn(async move {
            let max_frame_len = writer_inner.config.max_frame_len;
            let shutdown = writer_inner.shutdown.clone();
            if let Err(err) = write_loop(write_half, rx, max_frame_len, shutdown).await {
                writer_inner.close(err);
            }
        });

        Connection { inner }
    }
}

/// One bidirectional connection. Both ends may call, notify and serve.
///
/// Cloning is cheap; all clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.inner.is_closed())
            .field("pending_calls", &self.inner.calls.len())
            .field("in_flight_requests", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Starts a connection serving `registry` with default settings.
    pub fn start<S>(stream: S, registry: Arc<Registry>) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        ConnectionBuilder::new().registry(registry).start(stream)
    }

    pub fn client(&self) -> Client {
        Client::new(self.inner.clone())
    }

    /// Tears the connection down and waits until teardown has completed.
    ///
    /// Pending calls fail with [`TransportError::ConnectionClosed`]. Running handlers see their
    /// context cancelled but are not awaited.
    pub async fn shutdown(&self) {
        self.inner.close(TransportError::ConnectionClosed);
        self.inner.closed.cancelled().await;
    }

    /// Resolves once the connection has been torn down, for whatever reason.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// What ended the connection, once it has ended.
    pub fn close_reason(&self) -> Option<TransportError> {
        self.inner.close_reason.lock().clone()
    }

    /// Outbound calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Inbound calls whose handler is still running.
    pub fn in_flight_requests(&self) -> usize {
        self.inner.in_flight.len()
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut r: R, inner: Arc<Inner>) {
    let max_frame_len = inner.config.max_frame_len;
    loop {
        let res = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = read_frame(&mut r, max_frame_len) => res,
        };
        match res {
            Ok(frame) => dispatch_frame(&inner, &frame),
            Err(err) => {
                inner.close(err);
                break;
            }
        }
    }
}

fn dispatch_frame(inner: &Arc<Inner>, frame: &[u8]) {
    match decode_rpc(frame, &inner.decode_env()) {
        Ok(Message::Call(inbound) | Message::Notify(inbound)) => request::start(inner, inbound),
        Ok(Message::Cancel { seqno, method }) => {
            let found = inner.in_flight.cancel(seqno);
            log::cancel_received(seqno, &method.to_string(), found);
        }
        Ok(Message::Response) => {}
        Err(err) => handle_decode_error(inner, err),
    }
}

/// Logs a bad frame. A call whose seqno is known still gets an error response.
fn handle_decode_error(inner: &Arc<Inner>, err: DecodeError) {
    if let MessageError::CallNotFound { seqno } = err.source {
        log::call_not_found(seqno);
        return;
    }
    log::decode_error(&err);

    let (Some(typ), Some(seqno)) = (err.typ, err.seqno) else {
        return;
    };
    if !matches!(
        typ,
        MessageType::Call | MessageType::CallV2 | MessageType::CallCompressed
    ) {
        return;
    }

    let method = err.method.clone().unwrap_or_default();
    let compression = err.compression;
    let inner = inner.clone();
    tokio::spawn(async move {
        let err: AppError = Box::new(err);
        request::reply(&inner, seqno, &method, compression, Err(err), None).await;
    });
}
