//! Ingress relay middleware.
//!
//! Requests shaped `{prefix}/{serviceId}/{path...}`, where `serviceId` parses as a UUID, are
//! taken over and relayed to the proxy registered under that id. Everything else passes through
//! to the wrapped service untouched.

#![allow(clippy::future_not_send)]

use std::{
    future::{Ready, ready},
    sync::Arc,
};

use actix_web::{
    FromRequest as _, HttpRequest, HttpResponse,
    body::{EitherBody, MessageBody},
    dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    error::{ErrorInternalServerError, ErrorPayloadTooLarge},
    http::{
        StatusCode,
        header::{self, HeaderMap, HeaderName, HeaderValue},
    },
    web,
};
use actix_ws::{Item, Message, MessageStream, Session};
use bytes::BytesMut;
use futures_util::{StreamExt as _, future::LocalBoxFuture};
use portunnel_models::{FrameKind, Headers, RequestMessage, ResponseMessage, WebSocketFrame};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    HostState,
    config::FailurePolicy,
    connection::{CallError, ControlConnection},
    queue::{FrameQueueReceiver, frame_queue},
};

/// Where an intercepted request is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressTarget {
    pub service_id: String,
    /// Forwarded path without its leading `/`.
    pub path: String,
}

/// Splits `path` into service id and forwarded path if it lies under `prefix`.
#[must_use]
pub fn parse_target(prefix: &str, path: &str) -> Option<IngressTarget> {
    let head = path.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }

    let rest = path[prefix.len()..].strip_prefix('/')?;
    let (service_id, forwarded) = rest.split_once('/').unwrap_or((rest, ""));

    Uuid::parse_str(service_id).ok()?;

    Some(IngressTarget {
        service_id: service_id.to_string(),
        path: forwarded.to_string(),
    })
}

pub struct IngressTranslator {
    state: Arc<HostState>,
}

impl IngressTranslator {
    #[must_use]
    pub const fn new(state: Arc<HostState>) -> Self {
        Self { state }
    }
}

impl<S, B> Transform<S, ServiceRequest> for IngressTranslator
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type InitError = ();
    type Transform = IngressMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(IngressMiddleware {
            service,
            state: self.state.clone(),
        }))
    }
}

pub struct IngressMiddleware<S> {
    service: S,
    state: Arc<HostState>,
}

impl<S, B> Service<ServiceRequest> for IngressMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let Some(target) = parse_target(&self.state.config.prefix, req.path()) else {
            let response = self.service.call(req);
            return Box::pin(async move { Ok(response.await?.map_into_left_body()) });
        };

        let state = self.state.clone();

        Box::pin(async move {
            let (req, payload) = req.into_parts();
            let response = relay(&state, &req, payload, target)
                .await
                .unwrap_or_else(HttpResponse::from_error);
            Ok(ServiceResponse::new(req, response).map_into_right_body())
        })
    }
}

async fn relay(
    state: &Arc<HostState>,
    req: &HttpRequest,
    mut payload: Payload,
    target: IngressTarget,
) -> Result<HttpResponse, actix_web::Error> {
    let Some(connection) = state.registry.lookup(&target.service_id) else {
        log::error!(
            "No proxy connection registered for service id {}",
            target.service_id
        );
        return Ok(failure_response(
            state.config.failure_policy,
            StatusCode::NOT_FOUND,
        ));
    };

    if is_websocket_upgrade(req) {
        let payload = web::Payload::from_request(req, &mut payload).await?;
        relay_websocket(state, req, payload, connection, target)
    } else {
        relay_http(state, req, payload, &connection, &target).await
    }
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn failure_response(policy: FailurePolicy, status: StatusCode) -> HttpResponse {
    match policy {
        FailurePolicy::Empty => HttpResponse::Ok().finish(),
        FailurePolicy::Status => HttpResponse::build(status).finish(),
    }
}

async fn read_body(mut payload: Payload, limit: usize) -> Result<BytesMut, actix_web::Error> {
    let mut body = BytesMut::new();

    while let Some(chunk) = payload.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > limit {
            return Err(ErrorPayloadTooLarge(format!(
                "Request body exceeds {limit} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

/// Flattens a header map, joining repeated headers with `,`.
#[must_use]
pub fn collect_headers(headers: &HeaderMap) -> Headers {
    let mut collected = Headers::new();

    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            log::debug!("Skipping non-text header {name}");
            continue;
        };

        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    collected
}

async fn relay_http(
    state: &HostState,
    req: &HttpRequest,
    payload: Payload,
    connection: &ControlConnection,
    target: &IngressTarget,
) -> Result<HttpResponse, actix_web::Error> {
    let body = read_body(payload, state.config.message_size_limit()).await?;

    let query_string = match req.query_string() {
        "" => String::new(),
        query => format!("?{query}"),
    };

    let request = RequestMessage {
        request_id: Uuid::new_v4().to_string(),
        socket_id: None,
        method: req.method().to_string(),
        path: format!("/{}", target.path),
        headers: collect_headers(req.headers()),
        query_string,
        body: body.freeze(),
    };

    let policy = state.config.failure_policy;

    match connection
        .forward_http(request, state.config.forward_timeout)
        .await
    {
        Ok(response) if response.status.is_none() => {
            log::debug!("Proxy returned an empty response for {}", target.service_id);
            Ok(match policy {
                FailurePolicy::Empty => response_from_message(response),
                FailurePolicy::Status => failure_response(policy, StatusCode::BAD_GATEWAY),
            })
        }
        Ok(response) => Ok(response_from_message(response)),
        Err(CallError::Timeout) => {
            log::warn!("Timed out waiting for service {}", target.service_id);
            Ok(failure_response(policy, StatusCode::GATEWAY_TIMEOUT))
        }
        Err(e) => {
            log::error!("Failed to forward request to {}: {e}", target.service_id);
            Ok(failure_response(policy, StatusCode::BAD_GATEWAY))
        }
    }
}

fn response_from_message(message: ResponseMessage) -> HttpResponse {
    let status = message
        .status
        .and_then(|status| StatusCode::from_u16(status).ok())
        .unwrap_or(StatusCode::OK);

    let mut response = HttpResponse::build(status);

    for (name, value) in &message.headers {
        if name.eq_ignore_ascii_case(header::TRANSFER_ENCODING.as_str()) {
            continue;
        }

        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.append_header((name, value));
            }
            _ => log::debug!("Skipping invalid response header {name}"),
        }
    }

    response.body(message.body)
}

fn relay_websocket(
    state: &Arc<HostState>,
    req: &HttpRequest,
    payload: web::Payload,
    connection: ControlConnection,
    target: IngressTarget,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, messages) = actix_ws::handle(req, payload)?;
    let messages = messages.max_frame_size(state.config.message_size_limit());

    let socket_id = Uuid::new_v4().to_string();
    let (queue, receiver) = frame_queue();

    if !state
        .registry
        .open_socket(&socket_id, queue, session.clone())
    {
        log::error!("Failed to register socket {socket_id}");
        return Err(ErrorInternalServerError("Failed to open socket"));
    }

    let path = match req.query_string() {
        "" => target.path,
        query => format!("{}?{query}", target.path),
    };

    log::debug!(
        "Opened socket {socket_id} for service {} at '/{path}'",
        target.service_id
    );

    // spawn the session loops (and don't await them) so that the upgrade response is returned immediately
    actix_web::rt::spawn(run_session(
        state.clone(),
        connection,
        SocketSession {
            socket_id,
            path,
            session,
            messages,
            receiver,
        },
    ));

    Ok(response)
}

struct SocketSession {
    socket_id: String,
    path: String,
    session: Session,
    messages: MessageStream,
    receiver: FrameQueueReceiver,
}

/// Runs the caller-to-proxy and proxy-to-caller loops of one socket until both end, then
/// closes the caller's WebSocket.
///
/// Whichever side ends the socket only removes it from the registry and closes its queue, so
/// frames the proxy queued before a `CLOSE_SOCKET` are still written before the close.
async fn run_session(state: Arc<HostState>, connection: ControlConnection, socket: SocketSession) {
    let SocketSession {
        socket_id,
        path,
        session,
        messages,
        receiver,
    } = socket;
    let token = receiver.closed_token();

    let receive = async {
        let caller_closed = receive_from_caller(
            &connection,
            session.clone(),
            messages,
            &socket_id,
            &path,
            &token,
        )
        .await;

        if caller_closed
            && let Err(e) =
                connection.forward_websocket(WebSocketFrame::close(socket_id.clone(), path.clone()))
        {
            log::debug!("Could not forward close of socket {socket_id}: {e}");
        }

        state.registry.close_socket(&socket_id);
    };

    let send = async {
        send_to_caller(session.clone(), receiver).await;
        state.registry.close_socket(&socket_id);
    };

    tokio::join!(receive, send);

    let _ = session.close(None).await;
    log::debug!("Socket {socket_id} finished");
}

/// Relays caller frames to the proxy. Returns `true` when the caller ended the socket.
async fn receive_from_caller(
    connection: &ControlConnection,
    mut session: Session,
    mut messages: MessageStream,
    socket_id: &str,
    path: &str,
    token: &CancellationToken,
) -> bool {
    let mut fragment_kind = FrameKind::Text;

    loop {
        let message = tokio::select! {
            () = token.cancelled() => return false,
            () = connection.closed().cancelled() => {
                log::debug!("Control connection lost; ending socket {socket_id}");
                return false;
            }
            message = messages.next() => message,
        };

        let (data, frame_kind, is_final) = match message {
            Some(Ok(Message::Text(text))) => (text.into_bytes(), FrameKind::Text, true),
            Some(Ok(Message::Binary(data))) => (data, FrameKind::Binary, true),
            Some(Ok(Message::Continuation(item))) => match item {
                Item::FirstText(data) => {
                    fragment_kind = FrameKind::Text;
                    (data, fragment_kind, false)
                }
                Item::FirstBinary(data) => {
                    fragment_kind = FrameKind::Binary;
                    (data, fragment_kind, false)
                }
                Item::Continue(data) => (data, fragment_kind, false),
                Item::Last(data) => (data, fragment_kind, true),
            },
            Some(Ok(Message::Ping(bytes))) => {
                let _ = session.pong(&bytes).await;
                continue;
            }
            Some(Ok(Message::Pong(_) | Message::Nop)) => continue,
            Some(Ok(Message::Close(reason))) => {
                log::debug!("Caller closed socket {socket_id}: {reason:?}");
                return true;
            }
            Some(Err(e)) => {
                log::debug!("Socket {socket_id} stream error: {e}");
                return true;
            }
            None => return true,
        };

        let frame = WebSocketFrame {
            socket_id: socket_id.to_string(),
            data,
            frame_kind,
            is_final,
            path: path.to_string(),
        };

        if let Err(e) = connection.forward_websocket(frame) {
            log::debug!("Failed to forward frame for socket {socket_id}: {e}");
            return false;
        }
    }
}

/// Drains the socket's queue into the caller's WebSocket, keeping fragment boundaries.
async fn send_to_caller(mut session: Session, mut receiver: FrameQueueReceiver) {
    let mut in_fragment = false;

    while let Some(frame) = receiver.recv().await {
        let result = match (frame.frame_kind, in_fragment, frame.is_final) {
            (FrameKind::Close, ..) => break,
            (kind, false, true) => match kind {
                FrameKind::Binary => session.binary(frame.data).await,
                _ => match String::from_utf8(frame.data.to_vec()) {
                    Ok(text) => session.text(text).await,
                    Err(e) => {
                        log::warn!("Dropping non UTF-8 text frame: {e}");
                        continue;
                    }
                },
            },
            (kind, false, false) => {
                in_fragment = true;
                let item = match kind {
                    FrameKind::Binary => Item::FirstBinary(frame.data),
                    _ => Item::FirstText(frame.data),
                };
                session.continuation(item).await
            }
            (_, true, false) => session.continuation(Item::Continue(frame.data)).await,
            (_, true, true) => {
                in_fragment = false;
                session.continuation(Item::Last(frame.data)).await
            }
        };

        if result.is_err() {
            log::debug!("Caller socket already closed");
            break;
        }
    }
}
