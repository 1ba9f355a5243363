pub mod auth;
pub mod client;
pub mod config;
mod connection;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod state;
pub mod transport;

pub use auth::{AuthorizationClient, StaticTokenProvider, TokenProvider};
pub use client::{ConnectOutcome, RealtimeClient, SubscribeOutcome};
pub use config::{load_settings, RealtimeSettings, ReconnectPolicy};
pub use dispatch::{ConnectionEvent, ThreadCallbacks, ThreadEvent, ThreadEventStream};
pub use error::{AuthorizationError, ConfigError};
pub use registry::JoinState;
pub use state::ConnectionState;
pub use transport::{BrokerTransport, TransportMessage, TungsteniteTransport};
