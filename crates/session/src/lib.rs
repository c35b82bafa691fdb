//! Keel - Client sessions
//!
//! One task per client connection: frame messages off the socket,
//! dispatch by opcode into the engines, batch replies under the 16MB
//! cap, and keep the per-session state (cursors, last write, auth). The
//! wire port doubles as a minimal HTTP status surface for anything that
//! opens with `GET `.

mod command;
mod credentials;
mod cursors;
mod http;
mod listener;
mod monitor;
mod session;

pub use credentials::{keep_credentials_updated, update_credentials};
pub use cursors::{CursorMap, CursorScope};
pub use listener::Listener;
pub use monitor::check_health;
pub use session::Session;

#[cfg(test)]
mod cursors_test;
