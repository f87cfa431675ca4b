//! Data models for the authentication API and the authenticated identity.

pub mod auth;
pub mod user;

pub use auth::{AuthResponse, LoginRequest, LogoutRequest, RefreshRequest, UserRecord};
pub use user::User;
