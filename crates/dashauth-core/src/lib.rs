//! dashauth-core - session lifecycle for the dashboard REST backend.
//!
//! This crate contains the platform-agnostic pieces:
//! - `api`: HTTP client for the `/auth/*` endpoints
//! - `auth`: session data, refresh policy and the session manager
//! - `models`: wire types and the authenticated `User`
//! - `storage`: persistent key-value backends for the session
//! - `config`: configuration file and environment overrides

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;

pub use api::{ApiError, AuthApi, AuthClient};
pub use auth::{AuthState, RefreshPolicy, SessionInfo, SessionManager};
pub use config::{Config, StorageBackend};
pub use models::User;
pub use storage::{KeyValueStore, SESSION_KEY, USER_KEY};
