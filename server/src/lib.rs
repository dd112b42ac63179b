//! WebSocket host for the multiplexed terminal gateway.

pub mod connection;
pub mod web_server;

pub use connection::AppState;
pub use web_server::run_server;
