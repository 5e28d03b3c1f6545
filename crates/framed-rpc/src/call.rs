//! Outbound calls awaiting a response.

use std::collections::HashMap;
use std::sync::Arc;

use framed_rpc_proto::{CompressionType, DynValue, Prototype, SeqNumber};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::instrument::NetworkInstrumenter;
use crate::unwrap::DynErrorUnwrapper;
use crate::{CallError, TransportError};

/// `Ok(None)` when the call registered no result holder.
pub(crate) type CallResult = Result<Option<DynValue>, CallError>;

pub(crate) struct PendingCall {
    pub(crate) seqno: SeqNumber,
    pub(crate) method: String,
    pub(crate) result: Option<Prototype>,
    pub(crate) unwrapper: Arc<dyn DynErrorUnwrapper>,
    pub(crate) compression: CompressionType,
    /// Accounts the Call frame and its Response under the call's tag.
    pub(crate) instrumenter: NetworkInstrumenter,
    tx: oneshot::Sender<CallResult>,
}

impl PendingCall {
    pub(crate) fn new(
        seqno: SeqNumber,
        method: String,
        result: Option<Prototype>,
        unwrapper: Arc<dyn DynErrorUnwrapper>,
        compression: CompressionType,
        instrumenter: NetworkInstrumenter,
    ) -> (Self, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                seqno,
                method,
                result,
                unwrapper,
                compression,
                instrumenter,
                tx,
            },
            rx,
        )
    }

    /// Delivers the outcome to the waiting caller. Consumes the call, so it happens once.
    pub(crate) fn complete(mut self, result: CallResult) {
        self.instrumenter.record_and_finish(0);
        // The caller may have given up already.
        let _ = self.tx.send(result);
    }

    /// Drops a call nobody waits for any more, still recording what was sent.
    pub(crate) fn abandon(mut self) {
        self.instrumenter.record_and_finish(0);
    }
}

#[derive(Default)]
struct Calls {
    calls: HashMap<SeqNumber, PendingCall>,
    closed: bool,
}

/// Pending calls keyed by sequence number.
#[derive(Default)]
pub(crate) struct CallContainer {
    inner: Mutex<Calls>,
}

impl CallContainer {
    /// Stores `call`. Fails once the container has been drained.
    pub(crate) fn register(&self, call: PendingCall) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }
        inner.calls.insert(call.seqno, call);
        Ok(())
    }

    pub(crate) fn retrieve_and_remove(&self, seqno: SeqNumber) -> Option<PendingCall> {
        self.inner.lock().calls.remove(&seqno)
    }

    /// Completes every pending call with `reason` and refuses further registrations.
    pub(crate) fn drain_all(&self, reason: TransportError) {
        let drained: Vec<PendingCall> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.calls.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            call.complete(Err(CallError::Transport(reason.clone())));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }
}
