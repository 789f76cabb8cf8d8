use crate::error::{BoxError, GatewayError};
use crate::gateway::codec::{
    ClientProperties, Envelope, encode_heartbeat, encode_identify, hello_interval,
};
use crate::gateway::heartbeat::HeartbeatScheduler;
use crate::gateway::intents::Intents;
use crate::gateway::transport::FrameSender;
use crate::version::CLIENT_NAME;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHello,
    Handshaking,
    Established,
    Closed,
}

/// Per-session protocol state. Written by the connection loop, read by the
/// heartbeat task; both go through the same lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub heartbeat_interval_ms: u64,
    pub last_sequence: Option<u64>,
    pub closed: bool,
    pub pending_ack: bool,
    pub last_heartbeat_sent: Option<Instant>,
    pub latency: Option<Duration>,
}

pub type SharedSession = Arc<Mutex<SessionState>>;

/// Credentials and client identification sent with IDENTIFY.
#[derive(Clone)]
pub struct Identity {
    pub token: String,
    pub intents: Intents,
    pub properties: ClientProperties,
}

impl Identity {
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            properties: default_properties(),
        }
    }

    pub fn with_properties(mut self, properties: ClientProperties) -> Self {
        self.properties = properties;
        self
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("properties", &self.properties)
            .finish()
    }
}

pub fn default_properties() -> ClientProperties {
    ClientProperties {
        os: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
        client_name: CLIENT_NAME.to_string(),
        device_name: CLIENT_NAME.to_string(),
    }
}

/// Sends one heartbeat carrying the last seen sequence. Holds the session
/// lock across the send so the echoed sequence cannot change underneath it.
/// Returns `false` without sending once the session is closed.
pub async fn send_heartbeat(
    session: &SharedSession,
    sender: &FrameSender,
) -> Result<bool, GatewayError> {
    let mut state = session.lock().await;
    if state.closed {
        debug!("Session closed. Skipping heartbeat.");
        return Ok(false);
    }
    if state.pending_ack {
        warn!(
            last_sequence = ?state.last_sequence,
            "Previous heartbeat was never acknowledged."
        );
    }
    debug!(last_sequence = ?state.last_sequence, "Sending heartbeat.");
    sender.send_text(encode_heartbeat(state.last_sequence)).await?;
    state.pending_ack = true;
    state.last_heartbeat_sent = Some(Instant::now());
    Ok(true)
}

/// HELLO -> heartbeat -> IDENTIFY, plus liveness bookkeeping.
pub struct Handshake {
    state: HandshakeState,
    session: SharedSession,
    identity: Identity,
    heartbeat: HeartbeatScheduler,
}

impl Handshake {
    pub fn new(identity: Identity, heartbeat: HeartbeatScheduler) -> Self {
        Self {
            state: HandshakeState::AwaitingHello,
            session: Arc::new(Mutex::new(SessionState::default())),
            identity,
            heartbeat,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn session(&self) -> SharedSession {
        self.session.clone()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.is_running()
    }

    /// Records the envelope's sequence number, if it carries one.
    pub async fn observe_sequence(&self, envelope: &Envelope) {
        let Some(seq) = envelope.sequence else {
            return;
        };
        let mut state = self.session.lock().await;
        match state.last_sequence {
            Some(last) if seq < last => {
                warn!(sequence = seq, last_sequence = last, "Ignoring out-of-order sequence.");
            }
            _ => state.last_sequence = Some(seq),
        }
    }

    pub async fn on_hello(
        &mut self,
        envelope: &Envelope,
        sender: &FrameSender,
    ) -> Result<(), GatewayError> {
        if self.state != HandshakeState::AwaitingHello {
            warn!(state = ?self.state, "Ignoring HELLO outside of the handshake.");
            return Ok(());
        }
        let interval_ms = hello_interval(envelope)?;
        self.session.lock().await.heartbeat_interval_ms = interval_ms;
        self.state = HandshakeState::Handshaking;
        info!(heartbeat_interval_ms = interval_ms, "Received HELLO.");

        let session = self.session.clone();
        let heartbeat_sender = sender.clone();
        self.heartbeat.start(Duration::from_millis(interval_ms), move || {
            let session = session.clone();
            let sender = heartbeat_sender.clone();
            async move {
                send_heartbeat(&session, &sender)
                    .await
                    .map(|_| ())
                    .map_err(BoxError::from)
            }
        })?;

        debug!(intents = %self.identity.intents, "Sending IDENTIFY.");
        let identify = encode_identify(
            &self.identity.token,
            self.identity.intents,
            &self.identity.properties,
        );
        sender.send_text(identify).await?;
        self.state = HandshakeState::Established;
        info!("Handshake established.");
        Ok(())
    }

    pub async fn on_heartbeat_ack(&mut self) {
        if self.state != HandshakeState::Established {
            debug!(state = ?self.state, "Ignoring HEARTBEAT_ACK outside of an established session.");
            return;
        }
        let mut state = self.session.lock().await;
        state.pending_ack = false;
        if let Some(sent_at) = state.last_heartbeat_sent {
            state.latency = Some(sent_at.elapsed());
        }
        debug!(latency = ?state.latency, "Heartbeat acknowledged.");
    }

    /// The gateway asked for an immediate heartbeat.
    pub async fn on_heartbeat_request(&self, sender: &FrameSender) -> Result<(), GatewayError> {
        if self.state != HandshakeState::Established {
            debug!(state = ?self.state, "Ignoring heartbeat request before the session is established.");
            return Ok(());
        }
        send_heartbeat(&self.session, sender).await.map(|_| ())
    }

    /// Terminal: stops the heartbeat and marks the session closed.
    pub async fn close(&mut self) {
        if self.state == HandshakeState::Closed {
            return;
        }
        self.heartbeat.cancel();
        self.session.lock().await.closed = true;
        self.state = HandshakeState::Closed;
        info!("Session closed.");
    }
}
