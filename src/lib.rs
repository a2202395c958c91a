pub mod types {
    pub mod events;
    pub mod media;
}

pub mod calls;
pub mod client;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod keepalive;
pub mod protocol;
pub mod request;
pub mod session;
pub mod transport;

pub mod test_utils;

pub use calls::{CallControl, CallError, CallState};
pub use client::{Client, ClientBuilder, ClientError};
pub use config::{Backend, ClientConfig, ConfigError, RegistrationConfig};
pub use connection::GatewayConnection;
pub use types::events::{CallEvent, EventBus, EventKind};
