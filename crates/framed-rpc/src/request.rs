//! Server side of a call: the in-flight table and one task per inbound request.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use framed_rpc_proto::{CompressionType, DynValue, SeqNumber};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_cbor::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::connection::Inner;
use crate::message::{encode_response, Inbound};
use crate::registry::MethodHandler;
use crate::transport::wait_ack;
use crate::{log, AppError, RequestContext, TransportError};

/// Cancellation tokens of requests whose handler is still running, keyed by seqno.
///
/// Each entry carries the id handed out by [`InFlightRequests::insert`], so a finished request
/// never removes a newer one that reused its seqno.
#[derive(Debug, Default)]
pub(crate) struct InFlightRequests {
    next_id: AtomicU64,
    tokens: Mutex<HashMap<SeqNumber, (u64, CancellationToken)>>,
}

impl InFlightRequests {
    pub(crate) fn insert(&self, seqno: SeqNumber, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tokens.lock().insert(seqno, (id, token));
        id
    }

    /// Removes the entry for `seqno` if it is still the one registered as `id`.
    pub(crate) fn remove(&self, seqno: SeqNumber, id: u64) {
        let mut tokens = self.tokens.lock();
        if tokens.get(&seqno).is_some_and(|(current, _)| *current == id) {
            tokens.remove(&seqno);
        }
    }

    /// Cancels the request with `seqno`. Returns `false` if it already completed.
    pub(crate) fn cancel(&self, seqno: SeqNumber) -> bool {
        let token = self.tokens.lock().get(&seqno).map(|(_, token)| token.clone());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tokens.lock().len()
    }
}

/// A request's in-flight entry. Removed on drop, so a task that ends early cannot leak it.
struct InFlightEntry {
    inner: Arc<Inner>,
    seqno: SeqNumber,
    id: u64,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.inner.in_flight.remove(self.seqno, self.id);
    }
}

/// Spawns the handler for `inbound`. Returns without waiting for it.
pub(crate) fn start(inner: &Arc<Inner>, inbound: Inbound) {
    let token = inner.shutdown.child_token();
    // Registered before the task exists so a Cancel that follows immediately finds it.
    let entry = inbound.seqno.map(|seqno| InFlightEntry {
        inner: inner.clone(),
        seqno,
        id: inner.in_flight.insert(seqno, token.clone()),
    });

    let method = inbound.method.to_string();
    let span = log::serve_span(inbound.seqno, &method);
    let ctx = RequestContext::new(inbound.seqno, method, inbound.tags.clone(), token);
    tokio::spawn(serve(inner.clone(), ctx, inbound, entry).instrument(span));
}

async fn serve(
    inner: Arc<Inner>,
    ctx: RequestContext,
    inbound: Inbound,
    entry: Option<InFlightEntry>,
) {
    let Inbound {
        seqno,
        handler,
        arg,
        compression,
        mut instrumenter,
        ..
    } = inbound;
    let method = ctx.method().to_string();

    let Some(seqno) = seqno else {
        log::notify_call(&method);
        let result = run_handler(handler, ctx, arg, &method).await;
        log::notify_complete(&method, result.as_ref().err().map(|err| err as &dyn Display));
        instrumenter.record_and_finish(0);
        return;
    };

    log::server_call(seqno, &method);
    let token = ctx.token().clone();
    let result = run_handler(handler, ctx, arg, &method).await;
    drop(entry);

    let written = reply(&inner, seqno, &method, compression, result, Some(&token)).await;
    instrumenter.record_and_finish(written);
}

/// Runs `handler`, turning a panic into an error result.
async fn run_handler(
    handler: Arc<MethodHandler>,
    ctx: RequestContext,
    arg: DynValue,
    method: &str,
) -> Result<Value, AppError> {
    // Deferred into the async block so a panic while building the future is caught too.
    let serve = AssertUnwindSafe(async move { handler.serve(ctx, arg).await });
    match serve.catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            log::handler_panicked(method, &message);
            Err(format!("handler panicked: {message}").into())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

/// Sends the Response for `seqno` and returns the number of bytes written.
///
/// A reply that cannot be encoded, or that exceeds the frame limit, is replaced by an error
/// reply saying so.
pub(crate) async fn reply(
    inner: &Inner,
    seqno: SeqNumber,
    method: &str,
    compression: CompressionType,
    result: Result<Value, AppError>,
    token: Option<&CancellationToken>,
) -> usize {
    let (error, value, reported) = match result {
        Ok(value) => (Value::Null, value, None),
        Err(err) => ((inner.wrap_error)(&err), Value::Null, Some(err.to_string())),
    };

    let frame = match encode_response(seqno, &error, &value, compression, &inner.compressors) {
        Ok(frame) => frame,
        Err(err) => match error_frame(inner, seqno, compression, &err) {
            Some(frame) => frame,
            None => {
                log::reply_write_error(seqno, method, &err);
                return 0;
            }
        },
    };

    let len = frame.len();
    let sent = match send_frame(inner, frame).await {
        Err(TransportError::FrameTooLarge { len, max }) => {
            let err = TransportError::FrameTooLarge { len, max };
            match error_frame(inner, seqno, compression, &err) {
                Some(frame) => send_frame(inner, frame).await,
                None => Err(err),
            }
        }
        other => other,
    };

    match sent {
        Err(err) => {
            log::reply_write_error(seqno, method, &err);
            0
        }
        Ok(()) if token.is_some_and(|token| token.is_cancelled()) => {
            log::reply_after_cancellation(seqno, method);
            len
        }
        Ok(()) => {
            log::server_reply(seqno, method, reported.as_ref().map(|err| err as &dyn Display));
            len
        }
    }
}

async fn send_frame(inner: &Inner, frame: Vec<u8>) -> Result<(), TransportError> {
    let ack = inner.writer.enqueue(frame).await?;
    wait_ack(ack).await
}

fn error_frame(
    inner: &Inner,
    seqno: SeqNumber,
    compression: CompressionType,
    err: &dyn Display,
) -> Option<Vec<u8>> {
    let error: AppError = format!("failed to send response: {err}").into();
    encode_response(
        seqno,
        &(inner.wrap_error)(&error),
        &Value::Null,
        compression,
        &inner.compressors,
    )
    .ok()
}
