use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use portunnel_models::ProxyMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    #[error("Control connection is closed")]
    Closed,
}

/// Write side of one live control connection.
///
/// Every task that talks to the host holds a clone; the session's writer drains the channel
/// in order. Clones also share the largest body or frame payload the host accepts, which is
/// unbounded until the host announces it in `REGISTERED`.
#[derive(Debug, Clone)]
pub struct Link {
    tx: mpsc::UnboundedSender<Message>,
    message_limit: Arc<AtomicUsize>,
}

impl Link {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                message_limit: Arc::new(AtomicUsize::new(usize::MAX)),
            },
            rx,
        )
    }

    #[must_use]
    pub fn message_limit(&self) -> usize {
        self.message_limit.load(Ordering::Relaxed)
    }

    pub fn set_message_limit(&self, limit: usize) {
        self.message_limit.store(limit, Ordering::Relaxed);
    }

    /// # Errors
    ///
    /// * If the message fails to serialize
    /// * If the control connection has gone away
    pub fn send(&self, message: &ProxyMessage) -> Result<(), LinkError> {
        let text = message.to_json()?;
        self.send_raw(Message::text(text))
    }

    /// # Errors
    ///
    /// * If the control connection has gone away
    pub fn send_raw(&self, message: Message) -> Result<(), LinkError> {
        self.tx.send(message).map_err(|_| LinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn clones_share_the_message_limit() {
        let (link, _rx) = Link::new();
        let clone = link.clone();

        assert_eq!(clone.message_limit(), usize::MAX);

        link.set_message_limit(1024);

        assert_eq!(clone.message_limit(), 1024);
    }

    #[test_log::test]
    fn send_fails_once_the_writer_is_gone() {
        let (link, rx) = Link::new();
        drop(rx);

        assert!(matches!(
            link.send(&ProxyMessage::CloseSocket {
                socket_id: "s".into(),
            }),
            Err(LinkError::Closed)
        ));
    }
}
