//! Control endpoint served to proxies.
//!
//! The upgrade request must carry the shared secret; anything else is refused with `401` before
//! the WebSocket handshake happens. Once upgraded, each connection runs [`handle_control`] until
//! the proxy disconnects, goes silent or the host shuts down.

#![allow(clippy::future_not_send)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use actix_web::{HttpRequest, HttpResponse, error::ErrorUnauthorized, web};
use actix_ws::{AggregatedMessage, AggregatedMessageStream, CloseReason, ProtocolError, Session};
use futures_util::StreamExt as _;
use portunnel_models::{HostMessage, ProxyMessage, SECRET_HEADER};
use subtle::ConstantTimeEq as _;
use tokio::time::interval;

use crate::{
    CANCELLATION_TOKEN, HostState, connection::ControlConnection, registry::ConnectionRegistry,
};

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of proxy response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn is_authorized(req: &HttpRequest, secret_key: &str) -> bool {
    req.headers()
        .get(SECRET_HEADER)
        .is_some_and(|value| bool::from(value.as_bytes().ct_eq(secret_key.as_bytes())))
}

/// # Errors
///
/// * If the secret header is missing or wrong
/// * If the request is not a valid WebSocket handshake
pub async fn control_endpoint(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<HostState>,
) -> Result<HttpResponse, actix_web::Error> {
    if !is_authorized(&req, &state.config.secret_key) {
        log::warn!(
            "Rejected control connection from {:?}: missing or invalid {SECRET_HEADER}",
            req.peer_addr()
        );
        return Err(ErrorUnauthorized("Unauthorized"));
    }

    let (response, session, messages) = actix_ws::handle(&req, stream)?;
    let messages = messages
        .max_frame_size(state.config.control_frame_size_limit())
        .aggregate_continuations()
        .max_continuation_size(state.config.control_frame_size_limit());

    // spawn the control loop (and don't await it) so that the upgrade response is returned immediately
    actix_web::rt::spawn(handle_control(state.into_inner(), session, messages));

    Ok(response)
}

#[allow(clippy::cognitive_complexity)]
pub async fn handle_control(
    state: Arc<HostState>,
    mut session: Session,
    mut messages: AggregatedMessageStream,
) {
    let (connection, mut outbound) = ControlConnection::new();
    log::debug!("Control connection {} opened", connection.id());

    let mut last_heartbeat = Instant::now();
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);

    let close_reason: Option<CloseReason> = loop {
        tokio::select! {
            message = messages.next() => match message {
                Some(Ok(AggregatedMessage::Text(text))) => {
                    last_heartbeat = Instant::now();

                    let text: &str = text.as_ref();
                    match ProxyMessage::try_from(text) {
                        Ok(message) => handle_message(
                            &state.registry,
                            &connection,
                            message,
                            state.config.message_size_limit(),
                        ),
                        Err(e) => log::error!(
                            "Invalid control message on connection {}: {e:?}",
                            connection.id()
                        ),
                    }
                }
                Some(Ok(AggregatedMessage::Binary(_))) => {
                    last_heartbeat = Instant::now();
                    log::warn!("Ignoring binary control message on connection {}", connection.id());
                }
                Some(Ok(AggregatedMessage::Ping(bytes))) => {
                    log::trace!("Received ping");
                    last_heartbeat = Instant::now();
                    if session.pong(&bytes).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(AggregatedMessage::Pong(_))) => {
                    last_heartbeat = Instant::now();
                }
                Some(Ok(AggregatedMessage::Close(reason))) => break reason,
                Some(Err(ProtocolError::Overflow)) => {
                    // the codec skips the oversized frame, so the connection stays usable
                    last_heartbeat = Instant::now();
                    log::warn!(
                        "Dropped an oversized control message on connection {}",
                        connection.id()
                    );
                }
                Some(Err(e)) => {
                    log::error!("Control connection {} stream error: {e}", connection.id());
                    break None;
                }
                None => {
                    log::debug!("Control connection {} stream ended", connection.id());
                    break None;
                }
            },
            Some(message) = outbound.recv() => {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to serialize control message: {e:?}");
                        continue;
                    }
                };
                if let Err(e) = session.text(text).await {
                    log::error!("Failed to write to control connection {}: {e:?}", connection.id());
                    break None;
                }
            }
            _ = heartbeat.tick() => {
                // if no heartbeat ping/pong received recently, close the connection
                if Instant::now().duration_since(last_heartbeat) > CLIENT_TIMEOUT {
                    log::info!(
                        "Proxy has not sent heartbeat in over {CLIENT_TIMEOUT:?}; disconnecting"
                    );
                    break None;
                }

                let _ = session.ping(b"").await;
            }
            () = CANCELLATION_TOKEN.cancelled() => {
                log::debug!("Host shutting down; closing control connection {}", connection.id());
                break None;
            }
        }
    };

    let removed = state.registry.unregister_by_handle(&connection);
    if !removed.is_empty() {
        log::info!("Unregistered services {removed:?} after connection loss");
    }
    connection.close();

    log::debug!("Closing control connection {}", connection.id());
    let _ = session.close(close_reason).await;
}

/// Applies one proxy message. Replies, if any, are queued on `connection`.
///
/// `REGISTERED` replies announce `message_size_limit` so the proxy can refuse oversized target
/// responses itself. A `CLOSE_SOCKET` only removes the socket and closes its queue: the socket's
/// own session task drains what is left and closes the caller's WebSocket.
pub fn handle_message<S>(
    registry: &ConnectionRegistry<ControlConnection, S>,
    connection: &ControlConnection,
    message: ProxyMessage,
    message_size_limit: usize,
) {
    match message {
        ProxyMessage::Register { service_id } => {
            let reply = if registry.register(&service_id, connection.clone()) {
                log::info!(
                    "Registered service '{service_id}' on connection {}",
                    connection.id()
                );
                HostMessage::Registered {
                    message: format!("Service '{service_id}' registered"),
                    maximum_message_size: Some(message_size_limit),
                }
            } else {
                log::warn!("Service '{service_id}' is already registered");
                HostMessage::NotRegistered {
                    message: format!("Service '{service_id}' is already registered"),
                }
            };

            if let Err(e) = connection.send(reply) {
                log::error!("Failed to reply to register: {e}");
            }
        }
        ProxyMessage::Unregister { service_id } => {
            if registry.unregister(&service_id, connection) {
                log::info!("Unregistered service '{service_id}'");
            } else {
                log::warn!(
                    "Connection {} tried to unregister '{service_id}' which it does not hold",
                    connection.id()
                );
            }
        }
        ProxyMessage::HttpResponse { response } => {
            let request_id = response.request_id.clone();
            if !connection.complete(response) {
                log::debug!("No caller waiting for response to request {request_id}");
            }
        }
        ProxyMessage::ForwardFrameToHost { frame } => {
            let socket_id = frame.socket_id.clone();

            let Some(queue) = registry.outbound_queue(&socket_id) else {
                log::error!(
                    "Proxy on connection {} sent a frame for unknown socket {socket_id}",
                    connection.id()
                );
                let reply = HostMessage::ProtocolError {
                    message: format!("Unknown socket '{socket_id}'"),
                    socket_id: Some(socket_id),
                };
                if let Err(e) = connection.send(reply) {
                    log::error!("Failed to send protocol error: {e}");
                }
                return;
            };

            if queue.push(frame).is_err() {
                log::debug!("Socket {socket_id} closed while relaying a frame; dropping it");
            }
        }
        ProxyMessage::CloseSocket { socket_id } => {
            if registry.close_socket(&socket_id).is_some() {
                log::debug!("Closing socket {socket_id} at the proxy's request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{App, http::StatusCode, test};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use portunnel_models::{FrameKind, WebSocketFrame};

    use super::*;
    use crate::{config::HostConfig, configure, queue::frame_queue};

    const LIMIT: usize = 1024;

    fn frame(socket_id: &str) -> WebSocketFrame {
        WebSocketFrame {
            socket_id: socket_id.to_string(),
            data: Bytes::from_static(b"hi"),
            frame_kind: FrameKind::Text,
            is_final: true,
            path: "ws".to_string(),
        }
    }

    fn upgrade_request() -> test::TestRequest {
        test::TestRequest::get()
            .uri("/portunnel")
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "Upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
    }

    #[test_log::test(actix_web::test)]
    async fn control_endpoint_rejects_missing_or_wrong_secret() {
        let state = Arc::new(HostState::new(HostConfig::new("s3cret")));
        let app = test::init_service(App::new().configure(|cfg| configure(cfg, state.clone()))).await;

        let missing = test::call_service(&app, upgrade_request().to_request()).await;
        let wrong = test::call_service(
            &app,
            upgrade_request()
                .insert_header((SECRET_HEADER, "nope"))
                .to_request(),
        )
        .await;

        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[test_log::test(actix_web::test)]
    async fn control_endpoint_upgrades_with_correct_secret() {
        let state = Arc::new(HostState::new(HostConfig::new("s3cret")));
        let app = test::init_service(App::new().configure(|cfg| configure(cfg, state.clone()))).await;

        let response = test::call_service(
            &app,
            upgrade_request()
                .insert_header((SECRET_HEADER, "s3cret"))
                .to_request(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[test_log::test(tokio::test)]
    async fn register_replies_and_rejects_duplicates() {
        let registry = ConnectionRegistry::<ControlConnection, ()>::new();
        let (first, mut first_rx) = ControlConnection::new();
        let (second, mut second_rx) = ControlConnection::new();

        let register = || ProxyMessage::Register {
            service_id: "svc".to_string(),
        };
        handle_message(&registry, &first, register(), LIMIT);
        handle_message(&registry, &second, register(), LIMIT);

        assert_eq!(
            first_rx.recv().await,
            Some(HostMessage::Registered {
                message: "Service 'svc' registered".to_string(),
                maximum_message_size: Some(LIMIT),
            })
        );
        assert!(matches!(
            second_rx.recv().await,
            Some(HostMessage::NotRegistered { .. })
        ));
        assert_eq!(registry.lookup("SVC"), Some(first));
    }

    #[test_log::test(tokio::test)]
    async fn unregister_only_applies_to_owner() {
        let registry = ConnectionRegistry::<ControlConnection, ()>::new();
        let (owner, _owner_rx) = ControlConnection::new();
        let (other, _other_rx) = ControlConnection::new();
        registry.register("svc", owner.clone());

        let unregister = || ProxyMessage::Unregister {
            service_id: "svc".to_string(),
        };
        handle_message(&registry, &other, unregister(), LIMIT);
        assert_eq!(registry.lookup("svc"), Some(owner.clone()));

        handle_message(&registry, &owner, unregister(), LIMIT);
        assert_eq!(registry.lookup("svc"), None);
    }

    #[test_log::test(tokio::test)]
    async fn frames_for_known_sockets_are_queued() {
        let registry = ConnectionRegistry::<ControlConnection, &str>::new();
        let (connection, _rx) = ControlConnection::new();
        let (queue, mut receiver) = frame_queue();
        assert!(registry.open_socket("s1", queue, "caller"));

        handle_message(
            &registry,
            &connection,
            ProxyMessage::ForwardFrameToHost { frame: frame("s1") },
            LIMIT,
        );

        assert_eq!(receiver.recv().await, Some(frame("s1")));
    }

    #[test_log::test(tokio::test)]
    async fn close_socket_keeps_frames_queued_before_it() {
        let registry = ConnectionRegistry::<ControlConnection, &str>::new();
        let (connection, _rx) = ControlConnection::new();
        let (queue, mut receiver) = frame_queue();
        registry.open_socket("s1", queue, "caller");

        let close = || ProxyMessage::CloseSocket {
            socket_id: "s1".to_string(),
        };

        handle_message(
            &registry,
            &connection,
            ProxyMessage::ForwardFrameToHost { frame: frame("s1") },
            LIMIT,
        );
        handle_message(&registry, &connection, close(), LIMIT);

        assert_eq!(registry.socket_count(), 0);
        assert!(receiver.closed_token().is_cancelled());
        assert_eq!(receiver.recv().await, Some(frame("s1")));
        assert_eq!(receiver.recv().await, None);

        handle_message(&registry, &connection, close(), LIMIT);
        assert_eq!(registry.socket_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn frames_for_unknown_sockets_get_a_protocol_error() {
        let registry = ConnectionRegistry::<ControlConnection, ()>::new();
        let (connection, mut rx) = ControlConnection::new();

        handle_message(
            &registry,
            &connection,
            ProxyMessage::ForwardFrameToHost { frame: frame("gone") },
            LIMIT,
        );

        assert_eq!(
            rx.recv().await,
            Some(HostMessage::ProtocolError {
                socket_id: Some("gone".to_string()),
                message: "Unknown socket 'gone'".to_string(),
            })
        );
    }
}
