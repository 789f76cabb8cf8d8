pub mod config;
pub mod error;
pub mod gateway;
pub mod version;

pub use config::GatewayConfig;
pub use error::{BoxError, GatewayError};
pub use gateway::{GatewayClient, GatewayEvent, Intents};
