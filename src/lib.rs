//! Stateless encrypted-cookie sessions for axum.
//!
//! Session data lives entirely in the client's cookie, encrypted under keys
//! derived from a server secret and the issue time. Nothing is stored on the
//! server between requests.

#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod gate;
pub mod integration;
pub mod session;

pub use config::{CookieOptions, SessionConfig};
pub use error::{Result, SessionError};
pub use integration::{configure_session, session_middleware, SessionLayerState};
pub use session::Session;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
