//! HTTP client for the dashboard authentication endpoints.
//!
//! This module provides the `AuthApi` trait consumed by the session manager
//! and `AuthClient`, which implements it over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::models::{AuthResponse, LoginRequest, LogoutRequest, RefreshRequest};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Default HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const LOGIN_PATH: &str = "/auth/login";
const REFRESH_PATH: &str = "/auth/refresh";
const LOGOUT_PATH: &str = "/auth/logout";

/// The three calls the session lifecycle needs from the backend.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange credentials for a session.
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ApiError>;

    /// Mint a new access token. `None` relies on a session cookie.
    async fn refresh(&self, refresh_token: Option<&str>) -> Result<AuthResponse, ApiError>;

    /// Invalidate server-side session state.
    async fn logout(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<(), ApiError>;
}

/// Auth client for the dashboard backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    base_url: String,
}

impl AuthClient {
    /// Create a new client against `base_url` (e.g. `https://admin.example.com/api`)
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(access_token: Option<&str>) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(token) = access_token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidResponse("access token is not a valid header value".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        access_token: Option<&str>,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        debug!(url = %url, "POST");

        let response = self
            .client
            .post(&url)
            .headers(Self::auth_headers(access_token)?)
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", path, e)))
    }

    /// Surface an explicit `success: false` body as a rejection.
    fn accept(response: AuthResponse) -> Result<AuthResponse, ApiError> {
        if response.success == Some(false) {
            let detail = response
                .detail
                .clone()
                .unwrap_or_else(|| "no reason given".to_string());
            return Err(ApiError::Rejected(detail));
        }
        Ok(response)
    }
}

#[async_trait]
impl AuthApi for AuthClient {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ApiError> {
        let response = self.post(LOGIN_PATH, request, None).await?;
        Self::accept(response)
    }

    async fn refresh(&self, refresh_token: Option<&str>) -> Result<AuthResponse, ApiError> {
        let body = RefreshRequest {
            refresh_token: refresh_token.map(str::to_string),
        };
        let response = self.post(REFRESH_PATH, &body, None).await?;
        Self::accept(response)
    }

    async fn logout(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<(), ApiError> {
        let body = LogoutRequest {
            refresh_token: refresh_token.map(str::to_string),
        };
        let url = self.url(LOGOUT_PATH);
        let response = self
            .client
            .post(&url)
            .headers(Self::auth_headers(access_token)?)
            .json(&body)
            .send()
            .await?;

        // Body is irrelevant; some backends answer 204
        Self::check_response(response).await?;
        Ok(())
    }
}
