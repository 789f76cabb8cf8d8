//! Socket lifecycle and the receive loop.
//!
//! `DISCONNECTED -> CONNECTED -> RUNNING -> CLOSING -> DISCONNECTED`. The loop
//! is the only reader of the socket. Every decoded envelope is routed by
//! opcode to the handshake, the heartbeat bookkeeping, or the dispatcher.

use crate::config::GatewayConfig;
use crate::error::{BoxError, GatewayError};
use crate::gateway::codec::{Envelope, Opcode, decode, decode_bytes};
use crate::gateway::events::{DispatchEvent, EventDispatcher};
use crate::gateway::handshake::{Handshake, HandshakeState, Identity, SessionState};
use crate::gateway::heartbeat::HeartbeatScheduler;
use crate::gateway::periodic::{ErrorHandler, TaskHandle};
use crate::gateway::transport::{FrameSender, FrameSink, FrameStream, split_socket};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Running,
    Closing,
}

/// Why the receive loop was asked to stop.
#[derive(Debug, Clone, PartialEq)]
enum Shutdown {
    Requested,
    HeartbeatFailed(String),
}

impl Shutdown {
    fn into_result(self) -> Result<(), GatewayError> {
        match self {
            Shutdown::Requested => Ok(()),
            Shutdown::HeartbeatFailed(reason) => Err(GatewayError::HeartbeatFailed(reason)),
        }
    }
}

struct Transport {
    // Taken by `run()` for the lifetime of the loop.
    reader: Option<FrameStream>,
    sender: FrameSender,
}

pub struct GatewayClient {
    endpoint: String,
    identity: Identity,
    dispatcher: EventDispatcher,
    state: watch::Sender<ConnectionState>,
    shutdown: Arc<watch::Sender<Option<Shutdown>>>,
    transport: Mutex<Option<Transport>>,
    handshake: Mutex<Option<Handshake>>,
}

impl GatewayClient {
    pub fn new(endpoint: impl Into<String>, identity: Identity) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(None);
        Self {
            endpoint: endpoint.into(),
            identity,
            dispatcher: EventDispatcher::new(),
            state,
            shutdown: Arc::new(shutdown),
            transport: Mutex::new(None),
            handshake: Mutex::new(None),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        Ok(Self::new(config.endpoint_url(), config.identity()?))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Shorthand for [`EventDispatcher::register`].
    pub fn register<F, Fut>(&self, event_name: &str, callback: F) -> Result<(), GatewayError>
    where
        F: Fn(Arc<DispatchEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.dispatcher.register(event_name, callback)
    }

    /// `None` until the first connection.
    pub async fn handshake_state(&self) -> Option<HandshakeState> {
        self.handshake.lock().await.as_ref().map(Handshake::state)
    }

    pub async fn heartbeat_running(&self) -> bool {
        self.handshake
            .lock()
            .await
            .as_ref()
            .is_some_and(Handshake::heartbeat_running)
    }

    /// Snapshot of the current (or last) session.
    pub async fn session(&self) -> Option<SessionState> {
        let session = self.handshake.lock().await.as_ref().map(Handshake::session)?;
        let snapshot = session.lock().await.clone();
        Some(snapshot)
    }

    pub async fn latency(&self) -> Option<Duration> {
        self.session().await.and_then(|session| session.latency)
    }

    /// Opens the websocket to the configured endpoint.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.ensure_disconnected()?;
        info!(url = %self.endpoint, "Connecting to gateway.");
        let (socket, _response) = tokio_tungstenite::connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| GatewayError::Connection(format!("{}: {e}", self.endpoint)))?;
        let (stream, sink) = split_socket(socket);
        self.connect_with(stream, sink).await
    }

    /// Attaches an already established transport.
    pub async fn connect_with(&self, stream: FrameStream, sink: FrameSink) -> Result<(), GatewayError> {
        self.ensure_disconnected()?;
        let heartbeat = HeartbeatScheduler::new().with_error_handler(self.heartbeat_error_handler());
        *self.handshake.lock().await = Some(Handshake::new(self.identity.clone(), heartbeat));
        *self.transport.lock().await = Some(Transport {
            reader: Some(stream),
            sender: FrameSender::new(sink),
        });
        self.shutdown.send_replace(None);
        self.state.send_replace(ConnectionState::Connected);
        info!("Connected to gateway.");
        Ok(())
    }

    /// Runs the receive loop until the session ends. Connects first when
    /// still disconnected.
    ///
    /// Returns `Ok(())` after [`close`](Self::close), `SocketClosed` when the
    /// gateway ends the connection and `HeartbeatFailed` when a keep-alive
    /// could not be sent. The client is disconnected in every case.
    pub async fn run(&self) -> Result<(), GatewayError> {
        if self.state() == ConnectionState::Disconnected {
            self.connect().await?;
        }
        let (mut reader, sender) = {
            let mut transport = self.transport.lock().await;
            let transport = transport
                .as_mut()
                .ok_or_else(|| GatewayError::Connection("not connected".to_string()))?;
            let reader = transport
                .reader
                .take()
                .ok_or_else(|| GatewayError::Connection("receive loop already running".to_string()))?;
            (reader, transport.sender.clone())
        };

        self.state.send_replace(ConnectionState::Running);
        info!("Gateway receive loop started.");
        let outcome = self.receive_loop(&mut reader, &sender).await;
        self.state.send_replace(ConnectionState::Closing);
        match &outcome {
            Ok(()) => info!("Gateway receive loop stopped on request."),
            Err(e) => warn!(error = %e, "Gateway receive loop ended."),
        }
        drop(reader);
        self.disconnect().await;
        outcome
    }

    /// Asks a running loop to stop once the frame in hand is handled. A no-op
    /// when disconnected or when a stop is already pending.
    pub fn close(&self) {
        if self.state() == ConnectionState::Disconnected {
            debug!("Close requested while disconnected. Nothing to do.");
            return;
        }
        let requested = self.shutdown.send_if_modified(|pending| {
            if pending.is_some() {
                return false;
            }
            *pending = Some(Shutdown::Requested);
            true
        });
        if requested {
            info!("Close requested.");
        }
    }

    async fn receive_loop(&self, reader: &mut FrameStream, sender: &FrameSender) -> Result<(), GatewayError> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let pending = shutdown.borrow_and_update().clone();
            if let Some(reason) = pending {
                return reason.into_result();
            }

            let frame = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                frame = reader.next() => frame,
            };

            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    return Err(GatewayError::SocketClosed {
                        code: None,
                        reason: e.to_string(),
                    });
                }
                None => {
                    return Err(GatewayError::SocketClosed {
                        code: None,
                        reason: "connection reset without a close frame".to_string(),
                    });
                }
            };

            let decoded = match message {
                WsMessage::Text(text) => decode(text.as_str()),
                WsMessage::Binary(bytes) => decode_bytes(&bytes),
                WsMessage::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    info!(code = ?code, reason = %reason, "Gateway sent a close frame.");
                    return Err(GatewayError::SocketClosed { code, reason });
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            };

            match decoded {
                Ok(envelope) => self.route(envelope, sender).await?,
                Err(e) => warn!(error = %e, "Skipping malformed frame."),
            }
        }
    }

    async fn route(&self, envelope: Envelope, sender: &FrameSender) -> Result<(), GatewayError> {
        let mut guard = self.handshake.lock().await;
        let Some(handshake) = guard.as_mut() else {
            return Ok(());
        };
        handshake.observe_sequence(&envelope).await;
        debug!(envelope = %envelope, sequence = ?envelope.sequence, "Received envelope.");

        match envelope.op {
            Opcode::Hello => match handshake.on_hello(&envelope, sender).await {
                Err(GatewayError::MalformedFrame(reason)) => {
                    warn!(reason = %reason, "Skipping malformed HELLO.");
                }
                other => other?,
            },
            Opcode::HeartbeatAck => handshake.on_heartbeat_ack().await,
            Opcode::Heartbeat => handshake
                .on_heartbeat_request(sender)
                .await
                .map_err(|e| GatewayError::HeartbeatFailed(e.to_string()))?,
            Opcode::Dispatch => {
                drop(guard);
                self.dispatcher.dispatch(&envelope);
            }
            Opcode::Reconnect | Opcode::InvalidSession => {
                warn!(op = %envelope.op, "Session resumption is not supported. Ignoring.");
            }
            Opcode::Identify
            | Opcode::Presence
            | Opcode::VoiceState
            | Opcode::VoicePing
            | Opcode::Resume
            | Opcode::RequestMembers
            | Opcode::GuildSync => {
                debug!(op = %envelope.op, "Ignoring opcode.");
            }
        }
        Ok(())
    }

    /// Stops the heartbeat, closes the socket and forgets the transport.
    /// Calling it again is a no-op.
    async fn disconnect(&self) {
        let transport = self.transport.lock().await.take();
        if let Some(handshake) = self.handshake.lock().await.as_mut() {
            handshake.close().await;
        }
        if let Some(transport) = transport {
            if let Err(e) = transport.sender.close().await {
                debug!(error = %e, "Socket was already closed.");
            }
            info!("Disconnected from gateway.");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn ensure_disconnected(&self) -> Result<(), GatewayError> {
        match self.state() {
            ConnectionState::Disconnected => Ok(()),
            other => Err(GatewayError::Connection(format!(
                "client is already {other:?}"
            ))),
        }
    }

    fn heartbeat_error_handler(&self) -> ErrorHandler {
        let shutdown = self.shutdown.clone();
        Arc::new(move |task: &TaskHandle, err: BoxError| {
            error!(task = task.name(), error = %err, "Heartbeat failed. Ending the session.");
            task.cancel();
            shutdown.send_if_modified(|pending| {
                if pending.is_some() {
                    return false;
                }
                *pending = Some(Shutdown::HeartbeatFailed(err.to_string()));
                true
            });
        })
    }
}
