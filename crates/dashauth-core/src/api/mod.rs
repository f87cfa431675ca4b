//! REST client module for the dashboard authentication endpoints.
//!
//! This module provides the `AuthApi` trait the session manager talks to,
//! and `AuthClient`, its `reqwest` implementation.
//!
//! The backend issues a short-lived bearer access token and, optionally, a
//! longer-lived refresh token used to mint new access tokens.

pub mod client;
pub mod error;

pub use client::{AuthApi, AuthClient};
pub use error::ApiError;
