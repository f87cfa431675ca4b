use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::models::{AuthResponse, User};

/// Refresh this long before the access token expires.
const DEFAULT_LEAD_TIME_SECS: u64 = 60;

/// Never schedule a refresh sooner than this.
/// Pathologically short expiries would otherwise cause refresh storms.
const DEFAULT_MIN_DELAY_SECS: u64 = 5;

/// A restored session must have at least this much life left to be used
/// without refreshing first.
const DEFAULT_RESTORE_GRACE_SECS: u64 = 30;

/// Upper bound accepted for server-supplied lifetimes (ten years).
const MAX_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// Initial backoff for transient refresh failures (only with retries enabled).
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Timing knobs for proactive refresh and restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshPolicy {
    pub lead_time_secs: u64,
    pub min_delay_secs: u64,
    pub restore_grace_secs: u64,
    /// Extra attempts for transient refresh failures. 0 means a single
    /// failure ends the session.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            lead_time_secs: DEFAULT_LEAD_TIME_SECS,
            min_delay_secs: DEFAULT_MIN_DELAY_SECS,
            restore_grace_secs: DEFAULT_RESTORE_GRACE_SECS,
            max_retries: 0,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl RefreshPolicy {
    /// How long to wait before refreshing a token that expires at `expires_at`.
    ///
    /// `max(remaining - lead_time, remaining / 2, min_delay)`: normally
    /// `lead_time` early, at the half-life for short tokens, never sooner
    /// than `min_delay`.
    pub fn refresh_delay(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
        let remaining = (expires_at - now).num_milliseconds();
        let lead = secs_to_millis(self.lead_time_secs);
        let floor = secs_to_millis(self.min_delay_secs);

        let delay_ms = remaining.saturating_sub(lead).max(remaining / 2).max(floor);
        std::time::Duration::from_millis(delay_ms.max(0) as u64)
    }

    /// Whether a persisted session can be trusted without a refresh
    pub fn is_restorable(&self, session: &Session, now: DateTime<Utc>) -> bool {
        (session.expires_at - now).num_milliseconds() > secs_to_millis(self.restore_grace_secs)
    }
}

/// Config values are user-supplied; saturate instead of overflowing.
fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000)
}

/// Bearer credentials for one authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True only when the server told us when the refresh token dies and
    /// that moment has passed.
    pub fn refresh_token_expired(&self, now: DateTime<Utc>) -> bool {
        self.refresh_expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

/// A complete Session+User pair built from a login or refresh response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub session: Session,
    pub user: User,
}

impl Grant {
    /// Build a grant from a server response, falling back to `previous` for
    /// anything the server omitted (user fields, an unrotated refresh token).
    ///
    /// Expiry is always computed from the response's `expires_in`; a response
    /// without one is malformed.
    pub fn from_response(
        response: AuthResponse,
        previous: Option<&Grant>,
        now: DateTime<Utc>,
    ) -> Result<Grant, ApiError> {
        let access_token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("missing access_token".into()))?;

        let expires_in = response
            .expires_in
            .ok_or_else(|| ApiError::InvalidResponse("missing expires_in".into()))?;

        let user = User::merge(
            previous.map(|g| &g.user),
            response.user.unwrap_or_default(),
        )
        .ok_or_else(|| ApiError::InvalidResponse("missing user id".into()))?;

        let refresh_token = response
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous.and_then(|g| g.session.refresh_token.clone()));

        let refresh_expires_at = match response.refresh_expires_in {
            Some(secs) => Some(after(now, secs)),
            None => previous.and_then(|g| g.session.refresh_expires_at),
        };

        Ok(Grant {
            session: Session {
                access_token,
                refresh_token,
                expires_at: after(now, expires_in),
                refresh_expires_at,
            },
            user,
        })
    }
}

fn after(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    now + Duration::seconds(secs.clamp(0, MAX_LIFETIME_SECS))
}

/// Read-only snapshot of the current session for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct SessionInfo {
    pub user: User,
    pub has_refresh_token: bool,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub expires_at: DateTime<Utc>,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub refresh_expires_at: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub next_refresh_at: Option<DateTime<Utc>>,
}

impl SessionInfo {
    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_minutes().max(0)
    }
}
