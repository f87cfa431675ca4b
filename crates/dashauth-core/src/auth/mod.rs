//! Authentication module for managing the bearer-token session.
//!
//! This module provides:
//! - `Session` / `Grant`: token data built from login and refresh responses
//! - `RefreshPolicy`: when to refresh proactively and when to trust a restore
//! - `SessionManager`: the login → persist → refresh → clear lifecycle
//!
//! Sessions are persisted through a `KeyValueStore` and refreshed ahead of
//! expiry by a single cancellable timer.

pub mod manager;
pub mod session;

pub use manager::{AuthState, SessionManager};
pub use session::{Grant, RefreshPolicy, Session, SessionInfo};
