//! Per-socket outbound frame queue.
//!
//! Frames arriving from the proxy for one tunneled WebSocket are pushed into a [`FrameQueue`]
//! and drained, in order, by the session's send loop. Closing the queue is the signal that
//! stops the session: it is idempotent and can be triggered from either end.

use portunnel_models::WebSocketFrame;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Returned by [`FrameQueue::push`] after a close, carrying the rejected frame.
#[derive(Debug, Error)]
#[error("Frame queue is closed")]
pub struct QueueClosed(pub WebSocketFrame);

/// Producer half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FrameQueue {
    tx: mpsc::UnboundedSender<WebSocketFrame>,
    closed: CancellationToken,
}

/// Consumer half, owned by the session's send loop.
#[derive(Debug)]
pub struct FrameQueueReceiver {
    rx: mpsc::UnboundedReceiver<WebSocketFrame>,
    closed: CancellationToken,
}

/// Creates an open queue for one socket.
#[must_use]
pub fn frame_queue() -> (FrameQueue, FrameQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    (
        FrameQueue {
            tx,
            closed: closed.clone(),
        },
        FrameQueueReceiver { rx, closed },
    )
}

impl FrameQueue {
    /// Appends a frame behind everything pushed before it.
    ///
    /// # Errors
    ///
    /// * If the queue has already been closed, handing the frame back
    pub fn push(&self, frame: WebSocketFrame) -> Result<(), QueueClosed> {
        if self.closed.is_cancelled() {
            return Err(QueueClosed(frame));
        }

        self.tx.send(frame).map_err(|e| QueueClosed(e.0))
    }

    /// Stops accepting frames and wakes the receiver. Calling it again does nothing.
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl FrameQueueReceiver {
    /// Waits for the next frame. Frames already queued are still handed out after a close;
    /// `None` is returned once the queue is closed and empty.
    pub async fn recv(&mut self) -> Option<WebSocketFrame> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            () = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    /// Token cancelled when the queue closes. Session loops share it.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}
