use framed_rpc_proto::{LogTags, SeqNumber};
use tokio_util::sync::CancellationToken;

/// Context handed to a handler for one inbound call or notification.
///
/// Cancellation is cooperative via [`CancellationToken`]: the token fires when the peer cancels
/// this call or the connection shuts down.
#[derive(Clone, Debug)]
pub struct RequestContext {
    seqno: Option<SeqNumber>,
    method: String,
    tags: LogTags,
    cancel: CancellationToken,
}

impl RequestContext {
    pub(crate) fn new(
        seqno: Option<SeqNumber>,
        method: String,
        tags: LogTags,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            seqno,
            method,
            tags,
            cancel,
        }
    }

    /// Sequence number of the call; `None` for notifications.
    pub fn seqno(&self) -> Option<SeqNumber> {
        self.seqno
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Log tags the caller attached to the message.
    pub fn tags(&self) -> &LogTags {
        &self.tags
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the call is canceled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
