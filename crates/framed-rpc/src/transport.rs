//! u32 little-endian length-prefixed framing and the single connection writer.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::TransportError;

type Ack = oneshot::Sender<Result<(), TransportError>>;

pub(crate) struct OutboundFrame {
    bytes: Bytes,
    ack: Ack,
}

/// Handle to the connection's writer task. Frames are written whole and in queue order.
#[derive(Clone, Debug)]
pub(crate) struct FrameWriter {
    tx: mpsc::Sender<OutboundFrame>,
    max_frame_len: usize,
}

impl FrameWriter {
    pub(crate) fn new(queue_len: usize, max_frame_len: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(queue_len);
        (Self { tx, max_frame_len }, rx)
    }

    fn check_len(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        Ok(())
    }

    /// Queues `frame` and returns a receiver that resolves once it has been written and flushed.
    pub(crate) async fn enqueue(
        &self,
        frame: Vec<u8>,
    ) -> Result<oneshot::Receiver<Result<(), TransportError>>, TransportError> {
        self.check_len(&frame)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(OutboundFrame {
                bytes: Bytes::from(frame),
                ack: ack_tx,
            })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(ack_rx)
    }

    /// Queues `frame` and waits until it has been written.
    pub(crate) async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let ack = self.enqueue(frame).await?;
        wait_ack(ack).await
    }

    /// Queues `frame` if the queue has room, without waiting for the write.
    pub(crate) fn try_send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.check_len(&frame)?;
        let (ack, _) = oneshot::channel();
        self.tx
            .try_send(OutboundFrame {
                bytes: Bytes::from(frame),
                ack,
            })
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

pub(crate) async fn wait_ack(
    ack: oneshot::Receiver<Result<(), TransportError>>,
) -> Result<(), TransportError> {
    ack.await.unwrap_or(Err(TransportError::ConnectionClosed))
}

pub(crate) async fn write_frame(
    w: &mut (impl AsyncWrite + Unpin),
    max_frame_len: usize,
    payload: &[u8],
) -> Result<(), TransportError> {
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| TransportError::FrameTooLarge {
            len: payload.len(),
            max: max_frame_len,
        })?;
    if payload.len() > max_frame_len {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max: max_frame_len,
        });
    }

    w.write_u32_le(len).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame(
    r: &mut (impl AsyncRead + Unpin),
    max_frame_len: usize,
) -> Result<Vec<u8>, TransportError> {
    let len = r.read_u32_le().await? as usize;
    if len > max_frame_len {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    // Reserve fallibly so allocation failure surfaces as an error instead of aborting the process.
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|err| TransportError::AllocationFailed {
            message: format!("allocate frame buffer ({len} bytes): {err}"),
        })?;
    buf.resize(len, 0);
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Drains the queue into `w` until shutdown or the first write error.
pub(crate) async fn write_loop<W: AsyncWrite + Unpin>(
    mut w: W,
    mut rx: mpsc::Receiver<OutboundFrame>,
    max_frame_len: usize,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let result = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            frame = rx.recv() => frame,
        };
        let Some(OutboundFrame { bytes, ack }) = frame else {
            break Ok(());
        };
        let res = write_frame(&mut w, max_frame_len, &bytes).await;
        let _ = ack.send(res.clone());
        if let Err(err) = res {
            break Err(err);
        }
    };

    let _ = w.shutdown().await;
    result
}
