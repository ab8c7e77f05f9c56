//! Client end of the control channel.
//!
//! [`RelayExecutor::connect`] dials the host once and fails fast on a bad credential or an
//! unreachable host. After that a supervisor task owns the connection: it serves host messages,
//! pings every few seconds and redials after transport loss until [`RelayExecutor::disconnect`]
//! is called. Registrations do not survive a reconnect.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::{SinkExt as _, StreamExt as _};
use portunnel_models::{HostMessage, ProxyMessage, ResponseMessage, SECRET_HEADER};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{Mutex, RwLock, mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{
        self, Message,
        client::IntoClientRequest as _,
        http::{HeaderName, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
    },
};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::{
    forward::forward_http,
    link::{Link, LinkError},
    options::OptionsProvider,
    request_logger::RequestLogger,
    sockets::LocalSockets,
    url_validator::{UrlValidationError, to_websocket_url, validate_url},
};

const RECONNECT_DELAY: Duration = Duration::from_millis(5000);
const PING_INTERVAL: Duration = Duration::from_millis(5000);

type ControlStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Invalid {name}: {source}")]
    InvalidUrl {
        name: &'static str,
        source: UrlValidationError,
    },
    #[error("API key cannot be sent as a header")]
    InvalidApiKey,
    #[error("Host rejected the API key")]
    Unauthorized,
    #[error(transparent)]
    WebSocket(#[from] Box<tungstenite::Error>),
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("Not connected")]
    NotConnected,
    #[error("Already registered")]
    AlreadyRegistered,
    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Error)]
pub enum UnregisterError {
    #[error("Not connected")]
    NotConnected,
    #[error("Not registered")]
    NotRegistered,
    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Error)]
pub enum DisconnectError {
    #[error("Not connected")]
    NotConnected,
}

/// Where this proxy stands with the host for its current client id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegistrationStatus {
    #[default]
    Unregistered,
    /// `REGISTER` was sent and the host has not answered yet.
    Pending(String),
    Registered(String),
    /// The host refused the registration with the given reason.
    Rejected(String),
}

impl RegistrationStatus {
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::Pending(id) | Self::Registered(id) => Some(id),
            Self::Unregistered | Self::Rejected(_) => None,
        }
    }
}

#[derive(Clone)]
struct Endpoints {
    control: Url,
    api_key: HeaderValue,
    target_http: Url,
    target_ws: Url,
}

/// Per-connection state shared by the message handlers.
struct Session {
    link: Link,
    sockets: LocalSockets,
    target: Url,
    token: CancellationToken,
}

struct Inner {
    options: Box<dyn OptionsProvider>,
    logger: RequestLogger,
    http: reqwest::Client,
    connected: AtomicBool,
    link: RwLock<Option<Link>>,
    registration: watch::Sender<RegistrationStatus>,
    supervisor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

#[derive(Clone)]
pub struct RelayExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RelayExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayExecutor")
            .field("connected", &self.is_connected())
            .field("registration", &*self.inner.registration.borrow())
            .finish_non_exhaustive()
    }
}

impl RelayExecutor {
    #[must_use]
    pub fn new(options: impl OptionsProvider + 'static, logger: RequestLogger) -> Self {
        let (registration, _) = watch::channel(RegistrationStatus::Unregistered);

        Self {
            inner: Arc::new(Inner {
                options: Box::new(options),
                logger,
                http: reqwest::Client::new(),
                connected: AtomicBool::new(false),
                link: RwLock::new(None),
                registration,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Whether a control connection is currently live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn registration(&self) -> RegistrationStatus {
        self.inner.registration.borrow().clone()
    }

    /// Follows registration changes, including the host's answer to `REGISTER`.
    #[must_use]
    pub fn subscribe_registration(&self) -> watch::Receiver<RegistrationStatus> {
        self.inner.registration.subscribe()
    }

    /// Dials the host and keeps the connection alive in the background.
    ///
    /// # Errors
    ///
    /// * If already connected
    /// * If the configured URLs or API key are invalid
    /// * If the host rejects the API key or cannot be reached
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut supervisor = self.inner.supervisor.lock().await;

        if supervisor.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }

        let endpoints = self.endpoints()?;

        log::debug!("Connecting to {}", endpoints.control);
        let stream = dial(&endpoints).await?;
        log::info!("Connected to {}", endpoints.control);

        let (link, rx) = self.attach().await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.clone().supervise(
            endpoints,
            (stream, link, rx),
            token.clone(),
        ));

        *supervisor = Some((token, handle));

        Ok(())
    }

    /// Asks the host to route a fresh client id to this proxy and returns the id.
    ///
    /// The host answers asynchronously; see [`Self::subscribe_registration`].
    ///
    /// # Errors
    ///
    /// * If not connected
    /// * If a registration is already pending or active
    /// * If the control connection goes away while sending
    pub async fn register(&self) -> Result<String, RegisterError> {
        let link = self.link().await.ok_or(RegisterError::NotConnected)?;
        let client_id = Uuid::new_v4().to_string();

        let mut claimed = false;
        self.inner.registration.send_if_modified(|status| {
            if status.client_id().is_some() {
                return false;
            }
            *status = RegistrationStatus::Pending(client_id.clone());
            claimed = true;
            true
        });

        if !claimed {
            return Err(RegisterError::AlreadyRegistered);
        }

        log::debug!("Registering client id {client_id}");

        if let Err(e) = link.send(&ProxyMessage::Register {
            service_id: client_id.clone(),
        }) {
            self.inner
                .registration
                .send_replace(RegistrationStatus::Unregistered);
            return Err(e.into());
        }

        Ok(client_id)
    }

    /// # Errors
    ///
    /// * If not connected
    /// * If there is no pending or active registration
    /// * If the control connection goes away while sending
    pub async fn unregister(&self) -> Result<(), UnregisterError> {
        let link = self.link().await.ok_or(UnregisterError::NotConnected)?;

        let Some(service_id) = self.registration().client_id().map(str::to_string) else {
            return Err(UnregisterError::NotRegistered);
        };

        link.send(&ProxyMessage::Unregister {
            service_id: service_id.clone(),
        })?;
        self.inner
            .registration
            .send_replace(RegistrationStatus::Unregistered);

        log::info!("Unregistered client id {service_id}");

        Ok(())
    }

    /// Stops the supervisor and closes the control connection and every local socket.
    ///
    /// # Errors
    ///
    /// * If [`Self::connect`] has not succeeded since the last disconnect
    pub async fn disconnect(&self) -> Result<(), DisconnectError> {
        let Some((token, handle)) = self.inner.supervisor.lock().await.take() else {
            return Err(DisconnectError::NotConnected);
        };

        token.cancel();

        log::debug!("disconnect: Waiting for relay to finish...");
        if let Err(e) = handle.await {
            log::warn!("disconnect: Relay failed to finish: {e:?}");
        }

        Ok(())
    }

    fn endpoints(&self) -> Result<Endpoints, ConnectError> {
        let options = &self.inner.options;

        let control = validate_url(&options.host_url())
            .and_then(|url| to_websocket_url(&url))
            .map_err(|source| ConnectError::InvalidUrl {
                name: "host URL",
                source,
            })?;

        let target_http = validate_url(&options.target_service_url()).map_err(|source| {
            ConnectError::InvalidUrl {
                name: "target service URL",
                source,
            }
        })?;

        let target_ws =
            to_websocket_url(&target_http).map_err(|source| ConnectError::InvalidUrl {
                name: "target service URL",
                source,
            })?;

        let api_key = HeaderValue::from_str(&options.host_api_key())
            .map_err(|_| ConnectError::InvalidApiKey)?;

        Ok(Endpoints {
            control,
            api_key,
            target_http,
            target_ws,
        })
    }

    async fn link(&self) -> Option<Link> {
        self.inner.link.read().await.clone()
    }

    async fn attach(&self) -> (Link, mpsc::UnboundedReceiver<Message>) {
        let (link, rx) = Link::new();
        *self.inner.link.write().await = Some(link.clone());
        self.inner.connected.store(true, Ordering::SeqCst);
        (link, rx)
    }

    async fn detach(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.link.write().await.take();
        self.inner
            .registration
            .send_replace(RegistrationStatus::Unregistered);
    }

    async fn supervise(
        self,
        endpoints: Endpoints,
        first: (ControlStream, Link, mpsc::UnboundedReceiver<Message>),
        token: CancellationToken,
    ) {
        let mut next = Some(first);

        loop {
            if let Some((stream, link, rx)) = next.take() {
                self.run_session(&endpoints, stream, link, rx, &token).await;
                self.detach().await;
                log::info!("Control connection closed");
            }

            tokio::select! {
                () = sleep(RECONNECT_DELAY) => {}
                () = token.cancelled() => {
                    log::debug!("Cancelling reconnect");
                    break;
                }
            }

            log::debug!("Reconnecting to {}...", endpoints.control);

            match tokio::select! {
                result = dial(&endpoints) => result,
                () = token.cancelled() => {
                    log::debug!("Cancelling connect");
                    break;
                }
            } {
                Ok(stream) => {
                    log::info!("Control connection successfully reconnected");
                    let (link, rx) = self.attach().await;
                    next = Some((stream, link, rx));
                }
                Err(e) => {
                    log::error!("Failed to reconnect to {}: {e}", endpoints.control);
                }
            }
        }

        log::debug!("Relay stopped");
    }

    async fn run_session(
        &self,
        endpoints: &Endpoints,
        stream: ControlStream,
        link: Link,
        mut rx: mpsc::UnboundedReceiver<Message>,
        token: &CancellationToken,
    ) {
        let close_token = token.child_token();
        let session = Session {
            sockets: LocalSockets::new(
                link.clone(),
                endpoints.target_ws.clone(),
                close_token.clone(),
            ),
            link,
            target: endpoints.target_http.clone(),
            token: close_token.clone(),
        };

        let (mut write, mut read) = stream.split();

        let pinger = tokio::spawn({
            let link = session.link.clone();
            let close_token = close_token.clone();

            async move {
                loop {
                    tokio::select! {
                        () = close_token.cancelled() => break,
                        () = sleep(PING_INTERVAL) => {
                            log::trace!("Sending ping to host");
                            if let Err(e) = link.send_raw(Message::Ping(Bytes::new())) {
                                log::error!("Pinger send error: {e}");
                                close_token.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        });

        tokio::select! {
            () = close_token.cancelled() => {}
            () = async {
                while let Some(message) = rx.recv().await {
                    if let Err(e) = write.send(message).await {
                        log::error!("Failed to write to host: {e}");
                        break;
                    }
                }
            } => {}
            () = async {
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => match HostMessage::try_from(text.as_str()) {
                            Ok(message) => self.dispatch(&session, message),
                            Err(e) => log::error!("Invalid message from host: {e}"),
                        },
                        Ok(Message::Close(frame)) => {
                            log::debug!("Host closed the control connection: {frame:?}");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::error!("Control connection read error: {e}");
                            break;
                        }
                    }
                }
            } => {}
        }

        close_token.cancel();
        let _ = write.close().await;

        log::debug!("run_session: Waiting for pinger to finish...");
        if let Err(e) = pinger.await {
            log::warn!("run_session: Pinger failed to finish: {e:?}");
        }
    }

    fn dispatch(&self, session: &Session, message: HostMessage) {
        match message {
            HostMessage::Registered {
                message,
                maximum_message_size,
            } => {
                log::info!("{message}");
                if let Some(limit) = maximum_message_size {
                    log::debug!("Host accepts messages of up to {limit} bytes");
                    session.link.set_message_limit(limit);
                }
                self.inner.registration.send_if_modified(|status| {
                    if let RegistrationStatus::Pending(id) = status {
                        *status = RegistrationStatus::Registered(id.clone());
                        true
                    } else {
                        false
                    }
                });
            }
            HostMessage::NotRegistered { message } => {
                log::error!("{message}");
                self.inner
                    .registration
                    .send_replace(RegistrationStatus::Rejected(message));
            }
            HostMessage::ForwardHttp { request } => {
                self.inner.logger.log_http(&request);

                let client = self.inner.http.clone();
                let target = session.target.clone();
                let link = session.link.clone();
                let token = session.token.clone();

                tokio::spawn(async move {
                    let limit = link.message_limit();
                    let response = tokio::select! {
                        result = forward_http(&client, &target, &request, limit) => {
                            result.unwrap_or_else(|e| {
                                log::error!("Request {} failed: {e}", request.request_id);
                                ResponseMessage::empty(request.request_id.clone())
                            })
                        }
                        () = token.cancelled() => {
                            log::debug!("Abandoning request {}", request.request_id);
                            return;
                        }
                    };

                    if let Err(e) = link.send(&ProxyMessage::HttpResponse { response }) {
                        log::error!("Failed to answer request {}: {e}", request.request_id);
                    }
                });
            }
            HostMessage::ForwardWebSocket { frame } => {
                self.inner.logger.log_websocket(&frame);
                session.sockets.forward(frame);
            }
            HostMessage::ProtocolError { socket_id, message } => {
                log::error!("Host reported a protocol error: {message}");
                if let Some(socket_id) = socket_id {
                    session.sockets.close(&socket_id);
                }
            }
        }
    }
}

async fn dial(endpoints: &Endpoints) -> Result<ControlStream, ConnectError> {
    let mut request = endpoints
        .control
        .as_str()
        .into_client_request()
        .map_err(Box::new)?;

    let header = HeaderName::from_bytes(SECRET_HEADER.as_bytes())
        .map_err(|e| Box::new(tungstenite::Error::HttpFormat(e.into())))?;
    request
        .headers_mut()
        .insert(header, endpoints.api_key.clone());

    // the host caps what it forwards, so its frames are not limited here
    let config = WebSocketConfig::default()
        .max_message_size(None)
        .max_frame_size(None);

    match connect_async_with_config(request, Some(config), false).await {
        Ok((stream, _)) => Ok(stream),
        Err(tungstenite::Error::Http(response))
            if response.status() == StatusCode::UNAUTHORIZED =>
        {
            Err(ConnectError::Unauthorized)
        }
        Err(e) => Err(Box::new(e).into()),
    }
}
