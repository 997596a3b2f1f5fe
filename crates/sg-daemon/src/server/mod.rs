//! Gateway Listener
//!
//! Terminates local SSH sessions. A login is accepted only once the
//! workspace named by the username has an authenticated upstream session.

mod auth;
mod handler;
mod listener;
mod username;

pub use auth::{AuthFailure, Authenticated, Authenticator};
pub use handler::{GatewayHandler, ServerConfig};
pub use listener::{load_or_generate_host_key, GatewayServer, ListenerError};
pub use username::{LoginTarget, UsernameError};
