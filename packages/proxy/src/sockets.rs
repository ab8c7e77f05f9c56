//! Local WebSocket connections opened on behalf of tunneled caller sockets.
//!
//! Each socket id gets one connection to the target, opened lazily by the first frame. A
//! writer loop feeds it frames in arrival order and a reader loop relays the target's messages
//! back to the host. When either loop ends the socket is torn down and the host is told with
//! `CLOSE_SOCKET`.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures_util::{SinkExt as _, StreamExt as _};
use portunnel_models::{FrameKind, ProxyMessage, WebSocketFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        protocol::frame::{
            Frame,
            coding::{Data, OpCode},
        },
    },
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{forward::target_url, link::Link};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

struct LocalSocket {
    id: u64,
    tx: mpsc::UnboundedSender<WebSocketFrame>,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct LocalSockets {
    sockets: Arc<DashMap<String, LocalSocket>>,
    link: Link,
    target: Url,
    token: CancellationToken,
}

impl LocalSockets {
    /// Sockets for one control connection. Cancelling `token` tears all of them down.
    #[must_use]
    pub fn new(link: Link, target: Url, token: CancellationToken) -> Self {
        Self {
            sockets: Arc::new(DashMap::new()),
            link,
            target,
            token,
        }
    }

    /// Queues a caller frame for its local socket, opening the socket on first use.
    pub fn forward(&self, frame: WebSocketFrame) {
        let socket_id = frame.socket_id.clone();

        let socket = match self.sockets.entry(socket_id.clone()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(_) if frame.is_close() => {
                log::debug!("Close for socket {socket_id} which is not open");
                return;
            }
            Entry::Vacant(entry) => entry.insert(self.open(&socket_id, &frame.path)),
        };

        if socket.tx.send(frame).is_err() {
            log::debug!("Local socket {socket_id} is gone; dropping frame");
        }
    }

    /// Tears a socket down, e.g. after the host reported it unknown.
    pub fn close(&self, socket_id: &str) {
        if let Some((_, socket)) = self.sockets.remove(socket_id) {
            socket.token.cancel();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Removes the entry for `socket_id` if it still belongs to the connection `id`.
    fn forget(&self, socket_id: &str, id: u64) {
        self.sockets.remove_if(socket_id, |_, socket| socket.id == id);
    }

    fn open(&self, socket_id: &str, path: &str) -> LocalSocket {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.token.child_token();
        let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(self.clone().run(
            id,
            socket_id.to_string(),
            path.to_string(),
            rx,
            token.clone(),
        ));

        LocalSocket { id, tx, token }
    }

    async fn run(
        self,
        id: u64,
        socket_id: String,
        path: String,
        mut rx: mpsc::UnboundedReceiver<WebSocketFrame>,
        token: CancellationToken,
    ) {
        let url = target_url(&self.target, &path);

        log::debug!("Opening local WebSocket {url} for socket {socket_id}");

        let stream = tokio::select! {
            result = connect_async(url.as_str()) => match result {
                Ok((stream, _)) => stream,
                Err(e) => {
                    // frames queued while connecting are dropped; a later frame tries again
                    log::warn!("Failed to open local WebSocket {url} for socket {socket_id}: {e}");
                    self.forget(&socket_id, id);
                    return;
                }
            },
            () = token.cancelled() => {
                self.forget(&socket_id, id);
                return;
            }
        };

        let (mut write, mut read) = stream.split();

        tokio::select! {
            () = token.cancelled() => {
                log::debug!("Socket {socket_id} cancelled");
            }
            () = async {
                let mut in_fragment = false;
                while let Some(frame) = rx.recv().await {
                    let closing = frame.is_close();
                    let message = to_target_message(frame, &mut in_fragment);
                    if let Err(e) = write.send(message).await {
                        log::debug!("Failed to write to local socket {socket_id}: {e}");
                        break;
                    }
                    if closing {
                        log::debug!("Caller closed socket {socket_id}");
                        break;
                    }
                }
            } => {}
            () = async {
                while let Some(message) = read.next().await {
                    let (data, frame_kind) = match message {
                        Ok(Message::Text(text)) => (Bytes::from(text), FrameKind::Text),
                        Ok(Message::Binary(data)) => (data, FrameKind::Binary),
                        Ok(Message::Close(frame)) => {
                            log::debug!("Target closed socket {socket_id}: {frame:?}");
                            break;
                        }
                        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                        Err(e) => {
                            log::debug!("Local socket {socket_id} read error: {e}");
                            break;
                        }
                    };

                    let limit = self.link.message_limit();
                    if data.len() > limit {
                        log::warn!(
                            "Dropping {} byte message on socket {socket_id}: the host accepts at most {limit}",
                            data.len()
                        );
                        continue;
                    }

                    let frame = WebSocketFrame {
                        socket_id: socket_id.clone(),
                        data,
                        frame_kind,
                        is_final: true,
                        path: path.clone(),
                    };

                    if let Err(e) = self.link.send(&ProxyMessage::ForwardFrameToHost { frame }) {
                        log::debug!("Failed to relay frame for socket {socket_id}: {e}");
                        break;
                    }
                }
            } => {}
        }

        token.cancel();
        let _ = write.close().await;
        self.forget(&socket_id, id);

        if !self.token.is_cancelled()
            && let Err(e) = self.link.send(&ProxyMessage::CloseSocket {
                socket_id: socket_id.clone(),
            })
        {
            log::debug!("Failed to send close for socket {socket_id}: {e}");
        }

        log::debug!("Local socket {socket_id} finished");
    }
}

/// Maps a caller frame onto the local connection, keeping fragment boundaries.
fn to_target_message(frame: WebSocketFrame, in_fragment: &mut bool) -> Message {
    if frame.is_close() {
        return Message::Close(None);
    }

    let data = if *in_fragment {
        Data::Continue
    } else if frame.frame_kind == FrameKind::Binary {
        Data::Binary
    } else {
        Data::Text
    };
    *in_fragment = !frame.is_final;

    Message::Frame(Frame::message(frame.data, OpCode::Data(data), frame.is_final))
}
