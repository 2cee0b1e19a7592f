//! Server module - Unix socket listener and operator connection handling

mod connection;
mod listener;
mod session;

pub use connection::ClientConnection;
pub use listener::{ServerListener, SHUTDOWN_PERMISSION};
pub use session::OperatorSession;
