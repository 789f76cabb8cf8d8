//! Gateway frame codec.
//!
//! Every frame on the wire is a JSON object `{"op", "d", "s", "t"}`. Inbound
//! frames are decoded into an [`Envelope`]; outbound control frames are
//! produced by the `encode_*` functions. Interpretation of `d` beyond the
//! protocol envelope is left to the event listeners.

use crate::error::GatewayError;
use crate::gateway::intents::Intents;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    Presence,
    VoiceState,
    VoicePing,
    Resume,
    Reconnect,
    RequestMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
    GuildSync,
}

impl Opcode {
    pub const fn code(self) -> u8 {
        match self {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::Presence => 3,
            Opcode::VoiceState => 4,
            Opcode::VoicePing => 5,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::RequestMembers => 8,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
            Opcode::GuildSync => 12,
        }
    }
}

impl TryFrom<u64> for Opcode {
    type Error = GatewayError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        let op = match value {
            0 => Opcode::Dispatch,
            1 => Opcode::Heartbeat,
            2 => Opcode::Identify,
            3 => Opcode::Presence,
            4 => Opcode::VoiceState,
            5 => Opcode::VoicePing,
            6 => Opcode::Resume,
            7 => Opcode::Reconnect,
            8 => Opcode::RequestMembers,
            9 => Opcode::InvalidSession,
            10 => Opcode::Hello,
            11 => Opcode::HeartbeatAck,
            12 => Opcode::GuildSync,
            other => {
                return Err(GatewayError::MalformedFrame(format!(
                    "unrecognized opcode {other}"
                )));
            }
        };
        Ok(op)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// One decoded gateway frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub op: Opcode,
    pub sequence: Option<u64>,
    pub event_name: Option<String>,
    pub data: Value,
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.event_name {
            Some(name) => write!(f, "Envelope(op={}, t={})", self.op, name),
            None => write!(f, "Envelope(op={})", self.op),
        }
    }
}

#[derive(Deserialize)]
struct RawFrame {
    op: u64,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

impl TryFrom<RawFrame> for Envelope {
    type Error = GatewayError;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        let op = Opcode::try_from(raw.op)?;
        // A heartbeat carries its sequence in `d`.
        let sequence = match (op, raw.s) {
            (Opcode::Heartbeat, None) => raw.d.as_u64(),
            (_, s) => s,
        };
        Ok(Envelope {
            op,
            sequence,
            event_name: raw.t,
            data: raw.d,
        })
    }
}

/// Decodes a text frame.
pub fn decode(raw_frame: &str) -> Result<Envelope, GatewayError> {
    serde_json::from_str::<RawFrame>(raw_frame)?.try_into()
}

/// Decodes a binary frame carrying the same JSON document.
pub fn decode_bytes(raw_frame: &[u8]) -> Result<Envelope, GatewayError> {
    serde_json::from_slice::<RawFrame>(raw_frame)?.try_into()
}

#[derive(Deserialize)]
struct HelloData {
    heartbeat_interval: i64,
}

/// Heartbeat interval in milliseconds announced by a HELLO envelope. A
/// non-positive interval is `ZeroIntervalNotSupported`.
pub fn hello_interval(envelope: &Envelope) -> Result<u64, GatewayError> {
    if envelope.op != Opcode::Hello {
        return Err(GatewayError::MalformedFrame(format!(
            "expected HELLO, got {}",
            envelope.op
        )));
    }
    let hello = HelloData::deserialize(&envelope.data)?;
    u64::try_from(hello.heartbeat_interval)
        .ok()
        .filter(|interval| *interval > 0)
        .ok_or(GatewayError::ZeroIntervalNotSupported)
}

/// Identification fields sent with IDENTIFY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientProperties {
    pub os: String,
    #[serde(rename = "browser")]
    pub client_name: String,
    #[serde(rename = "device")]
    pub device_name: String,
}

pub fn encode_heartbeat(last_sequence: Option<u64>) -> String {
    json!({
        "op": Opcode::Heartbeat.code(),
        "d": last_sequence,
    })
    .to_string()
}

pub fn encode_identify(token: &str, intents: Intents, properties: &ClientProperties) -> String {
    json!({
        "op": Opcode::Identify.code(),
        "d": {
            "token": token,
            "intents": intents.bits(),
            "properties": properties,
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_dispatch() {
        let env = decode(r#"{"op":0,"s":42,"t":"MESSAGE_CREATE","d":{"content":"hi"}}"#).unwrap();
        assert_eq!(env.op, Opcode::Dispatch);
        assert_eq!(env.sequence, Some(42));
        assert_eq!(env.event_name.as_deref(), Some("MESSAGE_CREATE"));
        assert_eq!(env.data["content"], "hi");
    }

    #[test]
    fn test_decode_hello_without_sequence() {
        let env = decode(r#"{"op":10,"d":{"heartbeat_interval":41250},"s":null,"t":null}"#).unwrap();
        assert_eq!(env.op, Opcode::Hello);
        assert_eq!(env.sequence, None);
        assert_eq!(hello_interval(&env).unwrap(), 41250);
    }

    #[test]
    fn test_decode_ack_without_payload() {
        let env = decode(r#"{"op":11}"#).unwrap();
        assert_eq!(env.op, Opcode::HeartbeatAck);
        assert_eq!(env.data, Value::Null);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(GatewayError::MalformedFrame(_))));
        assert!(matches!(decode(r#"{"d":1}"#), Err(GatewayError::MalformedFrame(_))));
        assert!(matches!(decode(r#"{"op":99}"#), Err(GatewayError::MalformedFrame(_))));
        assert!(matches!(decode(r#"{"op":"x"}"#), Err(GatewayError::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_bytes() {
        let env = decode_bytes(br#"{"op":11}"#).unwrap();
        assert_eq!(env.op, Opcode::HeartbeatAck);
    }

    #[test]
    fn test_hello_interval_requires_field() {
        let env = decode(r#"{"op":10,"d":{}}"#).unwrap();
        assert!(matches!(hello_interval(&env), Err(GatewayError::MalformedFrame(_))));
        let not_hello = decode(r#"{"op":11}"#).unwrap();
        assert!(hello_interval(&not_hello).is_err());
    }

    #[test]
    fn test_heartbeat_echoes_sequence() {
        for seq in [None, Some(0), Some(7), Some(u64::from(u32::MAX) + 1)] {
            let env = decode(&encode_heartbeat(seq)).unwrap();
            assert_eq!(env.op, Opcode::Heartbeat);
            assert_eq!(env.sequence, seq);
            assert_eq!(env.data.as_u64(), seq);
        }
    }

    #[test]
    fn test_hello_interval_must_be_positive() {
        for interval in ["0", "-5"] {
            let env = decode(&format!(r#"{{"op":10,"d":{{"heartbeat_interval":{interval}}}}}"#)).unwrap();
            assert!(matches!(hello_interval(&env), Err(GatewayError::ZeroIntervalNotSupported)));
        }
        let huge = decode(r#"{"op":10,"d":{"heartbeat_interval":18446744073709551615}}"#).unwrap();
        assert!(matches!(hello_interval(&huge), Err(GatewayError::MalformedFrame(_))));
    }

    #[test]
    fn test_encode_identify_shape() {
        let props = ClientProperties {
            os: "linux".to_string(),
            client_name: "gateway-client".to_string(),
            device_name: "gateway-client".to_string(),
        };
        let frame = encode_identify("secret", Intents::GUILDS | Intents::GUILD_MESSAGES, &props);
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], 2);
        assert_eq!(value["d"]["token"], "secret");
        assert_eq!(value["d"]["intents"], 513);
        assert_eq!(value["d"]["properties"]["os"], "linux");
        assert_eq!(value["d"]["properties"]["browser"], "gateway-client");
        assert_eq!(value["d"]["properties"]["device"], "gateway-client");
    }
}
