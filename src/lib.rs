//! mqttgate - point-to-point MQTT v3.1.1 device gateway
//!
//! Devices connect over MQTT and publish; every accepted payload is handed to
//! one application [`MessageHandler`] on a dedicated worker thread, and the
//! application answers a specific device by connection id. There is no topic
//! routing between clients, no retained messages and no persistent sessions.

pub mod auth;
pub mod charset;
pub mod codec;
pub mod config;
pub mod gateway;
pub mod hooks;
pub mod protocol;
pub mod queue;
pub mod session;

pub use auth::StaticCredentials;
pub use charset::Charset;
pub use config::Config;
pub use gateway::{
    Gateway, GatewayConfig, GatewayError, GatewayHandle, OutboundMessage, PublishError, Publisher,
};
pub use hooks::{MessageHandler, Verifier};
pub use protocol::QoS;
pub use queue::PendingMessage;
pub use session::{ConnectionId, Session, SessionRegistry};
