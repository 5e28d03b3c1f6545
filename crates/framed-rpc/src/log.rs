//! Structured events for calls, replies and protocol anomalies.

use std::fmt::Display;

use framed_rpc_proto::SeqNumber;

pub(crate) const TARGET: &str = "framed_rpc";

pub(crate) fn serve_span(seqno: Option<SeqNumber>, method: &str) -> tracing::Span {
    tracing::info_span!(target: TARGET, "serve", seqno, method)
}

pub(crate) fn server_call(seqno: SeqNumber, method: &str) {
    tracing::debug!(target: TARGET, seqno, method, "server call");
}

pub(crate) fn server_reply(seqno: SeqNumber, method: &str, error: Option<&dyn Display>) {
    match error {
        None => tracing::debug!(target: TARGET, seqno, method, "server reply"),
        Some(error) => tracing::debug!(target: TARGET, seqno, method, error = %error, "server reply"),
    }
}

pub(crate) fn notify_call(method: &str) {
    tracing::debug!(target: TARGET, method, "notify call");
}

pub(crate) fn notify_complete(method: &str, error: Option<&dyn Display>) {
    match error {
        None => tracing::debug!(target: TARGET, method, "notify complete"),
        Some(error) => tracing::debug!(target: TARGET, method, error = %error, "notify complete"),
    }
}

pub(crate) fn client_call(seqno: SeqNumber, method: &str) {
    tracing::debug!(target: TARGET, seqno, method, "client call");
}

pub(crate) fn client_reply(seqno: SeqNumber, method: &str, error: Option<&dyn Display>) {
    match error {
        None => tracing::debug!(target: TARGET, seqno, method, "client reply"),
        Some(error) => tracing::debug!(target: TARGET, seqno, method, error = %error, "client reply"),
    }
}

pub(crate) fn cancel_received(seqno: SeqNumber, method: &str, found: bool) {
    tracing::debug!(target: TARGET, seqno, method, found, "cancel received");
}

pub(crate) fn call_not_found(seqno: SeqNumber) {
    tracing::warn!(target: TARGET, seqno, "response for unknown call");
}

pub(crate) fn handler_panicked(method: &str, message: &str) {
    tracing::error!(target: TARGET, method, panic = %message, "handler panicked");
}

pub(crate) fn reply_after_cancellation(seqno: SeqNumber, method: &str) {
    tracing::info!(target: TARGET, seqno, method, "completed after cancellation");
}

pub(crate) fn reply_write_error(seqno: SeqNumber, method: &str, error: &dyn Display) {
    tracing::warn!(target: TARGET, seqno, method, error = %error, "failed to send reply");
}

pub(crate) fn decode_error(error: &dyn Display) {
    tracing::warn!(target: TARGET, error = %error, "dropping undecodable frame");
}

pub(crate) fn connection_closed(reason: &dyn Display) {
    tracing::debug!(target: TARGET, reason = %reason, "connection closed");
}
