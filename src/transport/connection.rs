use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events;
use super::router::MessageRouter;
use super::sender::OutboundSender;
use super::state::{ConnectionState, ConnectionStatus};
use crate::state::AgentIdentity;

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_PERIOD: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out waiting for connection")]
    ConnectTimeout,

    #[error("not connected")]
    NotConnected,

    #[error("socket error: {0}")]
    Socket(String),

    #[error("authentication rejected by control plane (status {0})")]
    AuthRejected(u16),

    #[error("invalid socket configuration: {0}")]
    InvalidConfig(String),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    Shutdown,
    Dropped(&'static str),
}

/// Authenticated socket lifecycle.
///
/// All reconnection is driven here: exponential backoff starting at 2s,
/// doubling to a 10s cap, unbounded retries. The only unrecoverable outcome
/// is an explicit credential rejection during the handshake.
pub struct ConnectionManager {
    ws_url: String,
    api_key: String,
    agent_id: AgentIdentity,
    repository_id: Option<String>,
    /// Handshake disambiguation: the per-process override, falling back to
    /// the repository identifier. Startup fails earlier when neither exists.
    agent_alias: String,
    state: ConnectionState,
    sender: Arc<OutboundSender>,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ws_url: String,
        api_key: String,
        agent_id: AgentIdentity,
        repository_id: Option<String>,
        agent_alias: String,
        state: ConnectionState,
        sender: Arc<OutboundSender>,
        router: Arc<MessageRouter>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ws_url,
            api_key,
            agent_id,
            repository_id,
            agent_alias,
            state,
            sender,
            router,
            shutdown,
        }
    }

    /// Connect loop. Returns `Ok(())` on clean shutdown; an error only for
    /// a fatal credential rejection, which terminates the process.
    pub async fn run(&self) -> Result<(), TransportError> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.connect_once().await {
                Ok(ws) => {
                    backoff = INITIAL_BACKOFF;
                    info!(url = %self.ws_url, agent_id = %self.agent_id, "connected to control plane");
                    self.state.set(ConnectionStatus::Connected);
                    let end = self.session(ws).await;
                    self.state.set(ConnectionStatus::Disconnected);
                    self.sender.detach().await;
                    match end {
                        SessionEnd::Shutdown => {
                            info!("socket closed for shutdown");
                            return Ok(());
                        }
                        SessionEnd::Dropped(reason) => {
                            warn!(reason, "socket session ended, reconnecting");
                        }
                    }
                }
                Err(TransportError::AuthRejected(status)) => {
                    error!(status, "control plane rejected credentials, retries disabled");
                    return Err(TransportError::AuthRejected(status));
                }
                Err(e) => {
                    warn!(error = %e, "connect attempt failed");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn connect_once(&self) -> Result<WsStream, TransportError> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        let header =
            |v: &str| HeaderValue::from_str(v).map_err(|e| TransportError::InvalidConfig(e.to_string()));
        let headers = request.headers_mut();
        headers.insert("X-API-KEY", header(&self.api_key)?);
        headers.insert("X-AGENT-ID", header(self.agent_id.as_str())?);
        if let Some(repo) = &self.repository_id {
            headers.insert("X-REPO", header(repo)?);
        }
        headers.insert("X-AGENT-ALIAS", header(&self.agent_alias)?);

        match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await {
            Err(_) => Err(TransportError::ConnectTimeout),
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response)))
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                Err(TransportError::AuthRejected(response.status().as_u16()))
            }
            Ok(Err(e)) => Err(TransportError::Handshake(e)),
        }
    }

    /// One connected session: route inbound frames, keep the liveness ping
    /// going, and report why the session ended.
    async fn session(&self, ws: WsStream) -> SessionEnd {
        let (sink, mut read) = ws.split();
        self.sender.attach(sink).await;

        let mut ping = tokio::time::interval(PING_PERIOD);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return SessionEnd::Shutdown;
                }
                _ = ping.tick() => {
                    if let Err(e) = self.sender.send_ping().await {
                        warn!(error = %e, "liveness ping failed");
                        return SessionEnd::Dropped("ping failed");
                    }
                    debug!("liveness ping sent");
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match events::parse_frame(&text) {
                            Some(envelope) => self.router.route(envelope).await,
                            None => debug!("ignoring frame on unrecognized channel"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = self.sender.send_pong(payload).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "received close frame");
                        return SessionEnd::Dropped("server closed connection");
                    }
                    Some(Ok(_)) => {} // Pong / Binary / raw frames: ignore
                    Some(Err(e)) => {
                        warn!(error = %e, "socket read error");
                        return SessionEnd::Dropped("socket error");
                    }
                    None => {
                        return SessionEnd::Dropped("stream ended");
                    }
                }
            }
        }
    }
}
