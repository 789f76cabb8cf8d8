//! Event listener registry and fire-and-forget dispatch.

use crate::error::{BoxError, GatewayError};
use crate::gateway::codec::Envelope;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Closed set of dispatch events listeners may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayEvent {
    Ready,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
}

impl GatewayEvent {
    pub const ALL: [GatewayEvent; 4] = [
        GatewayEvent::Ready,
        GatewayEvent::MessageCreate,
        GatewayEvent::MessageUpdate,
        GatewayEvent::MessageDelete,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            GatewayEvent::Ready => "READY",
            GatewayEvent::MessageCreate => "MESSAGE_CREATE",
            GatewayEvent::MessageUpdate => "MESSAGE_UPDATE",
            GatewayEvent::MessageDelete => "MESSAGE_DELETE",
        }
    }
}

impl FromStr for GatewayEvent {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GatewayEvent::ALL
            .into_iter()
            .find(|event| event.name() == s)
            .ok_or_else(|| GatewayError::UnknownEvent(s.to_string()))
    }
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a listener receives: the event plus its undecoded data blob.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub event: GatewayEvent,
    pub sequence: Option<u64>,
    pub data: Value,
}

pub type ListenerFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
pub type Listener = Arc<dyn Fn(Arc<DispatchEvent>) -> ListenerFuture + Send + Sync>;

#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<HashMap<GatewayEvent, Vec<Listener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener for `event_name`. Fails with `UnknownEvent` for
    /// names outside [`GatewayEvent::ALL`].
    pub fn register<F, Fut>(&self, event_name: &str, callback: F) -> Result<(), GatewayError>
    where
        F: Fn(Arc<DispatchEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let event = event_name.parse::<GatewayEvent>()?;
        self.register_event(event, callback);
        Ok(())
    }

    pub fn register_event<F, Fut>(&self, event: GatewayEvent, callback: F)
    where
        F: Fn(Arc<DispatchEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |dispatch| Box::pin(callback(dispatch)) as ListenerFuture);
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners.entry(event).or_default().push(listener);
        debug!(event = %event, "Registered listener.");
    }

    /// Registers a listener that receives the data blob deserialized into `T`.
    /// A blob that does not fit `T` fails that listener only.
    pub fn register_typed<T, F, Fut>(&self, event_name: &str, callback: F) -> Result<(), GatewayError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let callback = Arc::new(callback);
        self.register(event_name, move |dispatch: Arc<DispatchEvent>| {
            let callback = callback.clone();
            async move {
                let payload = <T as serde::Deserialize>::deserialize(&dispatch.data)?;
                callback(payload).await
            }
        })
    }

    pub fn listener_count(&self, event: GatewayEvent) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .map_or(0, Vec::len)
    }

    /// Schedules every listener of the envelope's event and returns without
    /// waiting for them. Returns the number of listeners scheduled.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let Some(name) = envelope.event_name.as_deref() else {
            warn!(op = %envelope.op, "Dispatch envelope without an event name.");
            return 0;
        };
        let Ok(event) = name.parse::<GatewayEvent>() else {
            debug!(event = name, "No listeners for unrecognized event.");
            return 0;
        };
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .cloned()
            .unwrap_or_default();
        if listeners.is_empty() {
            debug!(event = %event, "No listeners registered.");
            return 0;
        }

        let dispatch = Arc::new(DispatchEvent {
            event,
            sequence: envelope.sequence,
            data: envelope.data.clone(),
        });
        let count = listeners.len();
        debug!(event = %event, listeners = count, "Dispatching event.");
        tokio::spawn(async move {
            let mut running = JoinSet::new();
            for listener in listeners {
                running.spawn(listener(dispatch.clone()));
            }
            while let Some(outcome) = running.join_next().await {
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(event = %event, error = %e, "Event listener failed."),
                    Err(join_error) => {
                        error!(event = %event, error = %join_error, "Event listener panicked.")
                    }
                }
            }
        });
        count
    }
}
