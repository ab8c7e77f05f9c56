//! Host end of one proxy's control connection.
//!
//! A [`ControlConnection`] is the handle stored in the registry. Messages for the proxy are
//! queued on an unbounded channel drained by the connection's socket loop; `ForwardHttp` calls
//! are correlated with their `HTTP_RESPONSE` through a pending table keyed by request id.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use portunnel_models::{HostMessage, RequestMessage, ResponseMessage, WebSocketFrame};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a message could not be delivered to, or answered by, the proxy.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Control connection is closed")]
    Disconnected,
    #[error("Failed to queue control message")]
    Send,
    #[error("Timed out waiting for the proxy to respond")]
    Timeout,
}

type PendingTable = DashMap<String, oneshot::Sender<ResponseMessage>>;

/// Handle to one proxy's control connection.
///
/// Clones share the outbound channel and the pending request table. Two handles compare equal
/// when they belong to the same connection, which is what the registry keys ownership on.
#[derive(Debug, Clone)]
pub struct ControlConnection {
    id: u64,
    tx: mpsc::UnboundedSender<HostMessage>,
    pending: Arc<PendingTable>,
    closed: CancellationToken,
}

impl PartialEq for ControlConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ControlConnection {}

/// Removes the pending entry when a `forward_http` call finishes or is dropped mid-wait.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

impl ControlConnection {
    /// Creates a connection handle and the receiver its socket loop drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                tx,
                pending: Arc::new(DashMap::new()),
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Process-unique identifier, used in logs.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// # Errors
    ///
    /// * If the connection is closed
    /// * If the socket loop is no longer draining messages
    pub fn send(&self, message: HostMessage) -> Result<(), CallError> {
        if self.closed.is_cancelled() {
            return Err(CallError::Disconnected);
        }

        self.tx.send(message).map_err(|_| CallError::Send)
    }

    /// Sends `FORWARD_HTTP` and waits for the correlated response.
    ///
    /// # Errors
    ///
    /// * If the connection closes before the response arrives
    /// * If `timeout` elapses first
    pub async fn forward_http(
        &self,
        request: RequestMessage,
        timeout: Option<Duration>,
    ) -> Result<ResponseMessage, CallError> {
        if self.closed.is_cancelled() {
            return Err(CallError::Disconnected);
        }

        let (tx, rx) = oneshot::channel();
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: request.request_id.clone(),
        };
        self.pending.insert(request.request_id.clone(), tx);

        log::debug!(
            "forward_http: connection={} request_id={} {} {}",
            self.id,
            request.request_id,
            request.method,
            request.path_and_query(),
        );
        self.send(HostMessage::ForwardHttp { request })?;

        let response = async {
            tokio::select! {
                response = rx => response.map_err(|_| CallError::Disconnected),
                () = self.closed.cancelled() => Err(CallError::Disconnected),
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, response)
                .await
                .map_err(|_| CallError::Timeout)?,
            None => response.await,
        }
    }

    /// # Errors
    ///
    /// * If the frame could not be queued for the proxy
    pub fn forward_websocket(&self, frame: WebSocketFrame) -> Result<(), CallError> {
        self.send(HostMessage::ForwardWebSocket { frame })
    }

    /// Hands an `HTTP_RESPONSE` to its waiting caller. Returns `false` if nobody is waiting.
    pub fn complete(&self, response: ResponseMessage) -> bool {
        let Some((_, tx)) = self.pending.remove(&response.request_id) else {
            return false;
        };

        tx.send(response).is_ok()
    }

    /// Marks the connection closed and fails every pending call.
    ///
    /// Idempotent. Later [`Self::send`] calls return [`CallError::Disconnected`].
    pub fn close(&self) {
        self.closed.cancel();
        self.pending.clear();
    }

    /// Cancelled once [`Self::close`] runs. Caller socket loops select on it so they end with
    /// the connection.
    #[must_use]
    pub const fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Number of `FORWARD_HTTP` calls still waiting for their response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(request_id: &str) -> RequestMessage {
        RequestMessage {
            request_id: request_id.to_string(),
            socket_id: None,
            method: "GET".to_string(),
            path: "/foo".to_string(),
            headers: portunnel_models::Headers::new(),
            query_string: String::new(),
            body: Bytes::new(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn forward_http_resolves_with_correlated_response() {
        let (connection, mut outbound) = ControlConnection::new();

        let responder = {
            let connection = connection.clone();
            tokio::spawn(async move {
                let Some(HostMessage::ForwardHttp { request }) = outbound.recv().await else {
                    panic!("expected FORWARD_HTTP");
                };
                let mut response = ResponseMessage::empty(request.request_id);
                response.status = Some(200);
                assert!(connection.complete(response));
            })
        };

        let response = connection.forward_http(request("r1"), None).await.unwrap();
        responder.await.unwrap();

        assert_eq!(response.request_id, "r1");
        assert_eq!(response.status, Some(200));
        assert_eq!(connection.pending_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn close_fails_pending_calls() {
        let (connection, _outbound) = ControlConnection::new();

        let call = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.forward_http(request("r1"), None).await })
        };
        while connection.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        connection.close();

        assert!(matches!(call.await.unwrap(), Err(CallError::Disconnected)));
        assert_eq!(connection.pending_count(), 0);
        assert!(matches!(
            connection.forward_http(request("r2"), None).await,
            Err(CallError::Disconnected)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn timeout_removes_pending_entry() {
        let (connection, _outbound) = ControlConnection::new();

        let result = connection
            .forward_http(request("r1"), Some(Duration::from_millis(10)))
            .await;

        assert!(matches!(result, Err(CallError::Timeout)));
        assert_eq!(connection.pending_count(), 0);
        assert!(!connection.complete(ResponseMessage::empty("r1")));
    }

    #[test_log::test]
    fn handles_compare_by_identity() {
        let (first, _rx1) = ControlConnection::new();
        let (second, _rx2) = ControlConnection::new();

        assert_eq!(first, first.clone());
        assert_ne!(first, second);
    }
}
