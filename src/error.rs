use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Boxed error returned by user callbacks (periodic tasks, event listeners).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Socket closed (code: {code:?}, reason: {reason:?})")]
    SocketClosed { code: Option<u16>, reason: String },
    #[error("Periodic task with a zero interval is not supported")]
    ZeroIntervalNotSupported,
    #[error("Unknown gateway event: {0}")]
    UnknownEvent(String),
    #[error("Heartbeat send failed: {0}")]
    HeartbeatFailed(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Close code carried by a `SocketClosed` error, if any.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            GatewayError::SocketClosed { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::MalformedFrame(err.to_string())
    }
}

impl From<tungstenite::Error> for GatewayError {
    fn from(err: tungstenite::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_only_on_socket_closed() {
        let closed = GatewayError::SocketClosed {
            code: Some(4004),
            reason: "Authentication failed.".to_string(),
        };
        assert_eq!(closed.close_code(), Some(4004));
        assert_eq!(GatewayError::ZeroIntervalNotSupported.close_code(), None);
    }

    #[test]
    fn test_json_error_maps_to_malformed_frame() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let gateway_err: GatewayError = err.into();
        assert!(matches!(gateway_err, GatewayError::MalformedFrame(_)));
    }
}
