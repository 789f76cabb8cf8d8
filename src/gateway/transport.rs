use crate::error::GatewayError;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, protocol::Message as WsMessage};
use tracing::debug;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WsMessage, WsError>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;

/// Write half of the gateway socket, shared by the connection loop and the
/// heartbeat task.
#[derive(Clone)]
pub struct FrameSender {
    sink: Arc<Mutex<FrameSink>>,
}

impl FrameSender {
    pub fn new(sink: FrameSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub async fn send_text(&self, frame: String) -> Result<(), GatewayError> {
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(frame.into())).await?;
        Ok(())
    }

    /// Sends a close frame and shuts the write half down.
    pub async fn close(&self) -> Result<(), GatewayError> {
        let mut sink = self.sink.lock().await;
        debug!("Closing gateway sink.");
        sink.close().await?;
        Ok(())
    }
}

/// Splits a connected websocket into boxed read and write halves.
pub fn split_socket<S>(socket: S) -> (FrameStream, FrameSink)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Send + 'static,
{
    let (sink, stream) = socket.split();
    (Box::pin(stream), Box::pin(sink))
}
