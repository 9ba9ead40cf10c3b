//! Network subsystem: relay transport and HTTP helpers

pub mod http;
pub mod transport;
pub mod websocket;

pub use http::fetch_users;
pub use transport::{Connection, Connector, Outgoing, TransportHandle};
pub use websocket::WsConnector;
