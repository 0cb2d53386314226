//! Live subscriptions: one WebSocket per subscription key feeding a patch
//! reduced snapshot, plus the HTTP pages the views backfill from.

use thiserror::Error;

pub mod api;
pub mod backoff;
pub mod connection;
pub mod key;
pub mod transport;

pub use api::{ApiClient, ApiError, EntriesPage, HttpEntrySource, TasksPage};
pub use backoff::{next_backoff, ReconnectPolicy};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionStatus, StreamState};
pub use key::{stream_url, SubscriptionKey};
pub use transport::{BoxTransport, Connector, Transport, TransportError, TransportEvent, WsConnector};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("unsupported url scheme '{0}': expected http, https, ws or wss")]
    UnsupportedScheme(String),
}
