pub mod codec;
pub mod connection;
pub mod events;
pub mod handshake;
pub mod heartbeat;
pub mod intents;
pub mod periodic;
pub mod transport;

pub use codec::{ClientProperties, Envelope, Opcode};
pub use connection::{ConnectionState, GatewayClient};
pub use events::{DispatchEvent, EventDispatcher, GatewayEvent};
pub use handshake::{HandshakeState, Identity, SessionState};
pub use heartbeat::HeartbeatScheduler;
pub use intents::Intents;
pub use periodic::{PeriodicTask, TaskHandle};
