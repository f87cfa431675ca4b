//! Session lifecycle: login, persist, proactive refresh, restore, logout.
//!
//! `SessionManager` is the only owner of the current Session+User pair. It is
//! a cheap `Clone` handle; every clone talks to the same state.
//!
//! Every mutation funnels through `commit`, which updates memory, the
//! refresh timer and the state broadcast together, then brings the
//! persistent store up to date on the blocking pool. Each commit bumps an
//! epoch; a refresh whose epoch went stale while its request was in flight
//! (logout, new login) is discarded instead of applied.
//!
//! Storage is never touched while the slot lock is held, so accessors stay
//! responsive during slow writes (key derivation, keychain prompts).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthApi};
use crate::models::{AuthResponse, LoginRequest, User};
use crate::storage::{KeyValueStore, SESSION_KEY, USER_KEY};

use super::session::{Grant, RefreshPolicy, Session, SessionInfo};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum AuthState {
    Anonymous,
    Authenticated,
    Refreshing,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthState::Anonymous => "anonymous",
            AuthState::Authenticated => "authenticated",
            AuthState::Refreshing => "refreshing",
        };
        f.write_str(name)
    }
}

struct Slot {
    grant: Option<Grant>,
    state: AuthState,
    epoch: u64,
}

struct ScheduledRefresh {
    id: u64,
    at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct Inner {
    api: Arc<dyn AuthApi>,
    store: Arc<dyn KeyValueStore>,
    policy: RefreshPolicy,
    slot: Mutex<Slot>,
    timer: Mutex<Option<ScheduledRefresh>>,
    next_timer_id: AtomicU64,
    refreshing: AtomicBool,
    state_tx: watch::Sender<AuthState>,
    /// Epoch of the last commit written to `store`. Held for the whole
    /// write, which serialises writers.
    written_epoch: Mutex<u64>,
}

impl Inner {
    // Lock order: written_epoch, then slot, then timer.
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<ScheduledRefresh>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_timer(&self) {
        if let Some(scheduled) = self.lock_timer().take() {
            debug!(timer = scheduled.id, "Cancelling scheduled refresh");
            scheduled.handle.abort();
        }
    }

    // =========================================================================
    // Storage (blocking; call from the blocking pool)
    // =========================================================================

    /// Write whatever the latest commit holds, unless a later writer already
    /// did. Storage converges on the newest state regardless of the order
    /// in which concurrent commits get here.
    fn write_latest(&self) {
        let mut written = self
            .written_epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (epoch, grant) = {
            let slot = self.lock_slot();
            (slot.epoch, slot.grant.clone())
        };
        if epoch <= *written {
            return;
        }

        match grant {
            Some(grant) => self.persist(&grant),
            None => self.erase(),
        }
        *written = epoch;
    }

    fn persist(&self, grant: &Grant) {
        if let Err(e) = self.write_pair(grant) {
            warn!(error = %e, "Failed to persist session, clearing stored copy");
            self.erase();
        }
    }

    /// The session key is removed first and written last, so a failure at
    /// any step leaves an incomplete pair that restores as absent.
    fn write_pair(&self, grant: &Grant) -> anyhow::Result<()> {
        let user = serde_json::to_string(&grant.user)?;
        let session = serde_json::to_string(&grant.session)?;
        self.store.remove(SESSION_KEY)?;
        self.store.set(USER_KEY, &user)?;
        self.store.set(SESSION_KEY, &session)?;
        Ok(())
    }

    fn erase(&self) {
        for key in [SESSION_KEY, USER_KEY] {
            if let Err(e) = self.store.remove(key) {
                warn!(error = %e, key, "Failed to remove persisted session data");
            }
        }
    }

    /// Read the persisted pair. Missing, partial or corrupt data is `None`.
    fn load_persisted(&self) -> Option<Grant> {
        let read = |key: &str| match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, key, "Failed to read persisted session data");
                None
            }
        };

        let (user, session) = match (read(USER_KEY), read(SESSION_KEY)) {
            (Some(user), Some(session)) => (user, session),
            (None, None) => return None,
            _ => {
                warn!("Persisted session is incomplete, discarding");
                return None;
            }
        };

        let user: User = match serde_json::from_str(&user) {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "Persisted user is corrupt, discarding");
                return None;
            }
        };
        let session: Session = match serde_json::from_str(&session) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Persisted session is corrupt, discarding");
                return None;
            }
        };

        if session.access_token.is_empty() || user.id.is_empty() {
            warn!("Persisted session has empty credentials, discarding");
            return None;
        }

        Some(Grant { session, user })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Clears the in-flight flag however the refresh ends, including when its
/// future is dropped mid-request.
struct RefreshGuard<'a> {
    inner: &'a Inner,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        {
            let mut slot = self.inner.lock_slot();
            if slot.state == AuthState::Refreshing && slot.grant.is_some() {
                slot.state = AuthState::Authenticated;
                self.inner.state_tx.send_replace(AuthState::Authenticated);
            }
        }
        self.inner.refreshing.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create an anonymous manager. Call `init` to restore a persisted session.
    pub fn new(
        api: Arc<dyn AuthApi>,
        store: Arc<dyn KeyValueStore>,
        policy: RefreshPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(AuthState::Anonymous);
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                policy,
                slot: Mutex::new(Slot {
                    grant: None,
                    state: AuthState::Anonymous,
                    epoch: 0,
                }),
                timer: Mutex::new(None),
                next_timer_id: AtomicU64::new(1),
                refreshing: AtomicBool::new(false),
                state_tx,
                written_epoch: Mutex::new(0),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore a persisted session.
    ///
    /// A session with more than the restore grace left is used as is. An
    /// older one is refreshed once if it has a usable refresh token. Anything
    /// else, including unreadable data, leaves the manager anonymous with
    /// storage cleared.
    pub async fn init(&self) {
        let inner = self.inner.clone();
        let persisted = match tokio::task::spawn_blocking(move || inner.load_persisted()).await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "Reading persisted session failed");
                None
            }
        };
        let Some(grant) = persisted else {
            debug!("No usable persisted session");
            self.clear_session().await;
            return;
        };

        let now = Utc::now();
        if self.inner.policy.is_restorable(&grant.session, now) {
            info!(user_id = %grant.user.id, "Restored persisted session");
            self.save_session(grant).await;
            return;
        }

        if grant.session.refresh_token.is_some() && !grant.session.refresh_token_expired(now) {
            info!(user_id = %grant.user.id, "Persisted session near expiry, refreshing");
            let epoch = self.inner.lock_slot().epoch;
            if self.refresh_from(Some(grant), epoch).await {
                return;
            }
            // A refresh that lost to a concurrent login/logout already left
            // the manager in a settled state; only clear if nothing replaced it.
            if self.state() == AuthState::Anonymous {
                self.clear_session().await;
            }
            return;
        }

        info!("Persisted session expired");
        self.clear_session().await;
    }

    /// Stop the scheduled refresh. Session state and storage are untouched,
    /// so a later `init` restores from where this left off.
    pub fn teardown(&self) {
        self.inner.cancel_timer();
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Authenticate with the backend. Returns `false` on any failure, in
    /// which case nothing changes.
    pub async fn login(&self, identifier: &str, secret: &str, remember_me: bool) -> bool {
        let identifier = identifier.trim();
        if identifier.is_empty() || secret.is_empty() {
            warn!("Login attempted without identifier or password");
            return false;
        }

        let request = LoginRequest {
            identifier: identifier.to_string(),
            password: secret.to_string(),
            remember_me,
        };

        let grant = match self.inner.api.login(&request).await {
            Ok(response) => Grant::from_response(response, None, Utc::now()),
            Err(e) => Err(e),
        };

        match grant {
            Ok(grant) => {
                info!(user_id = %grant.user.id, "Login successful");
                self.save_session(grant).await;
                true
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                false
            }
        }
    }

    /// Sign out locally, then tell the server on a best-effort basis.
    pub async fn logout(&self) {
        let previous = self.inner.lock_slot().grant.clone();
        self.clear_session().await;
        info!("Logged out");

        let (access_token, refresh_token) = match previous {
            Some(grant) => (Some(grant.session.access_token), grant.session.refresh_token),
            None => (None, None),
        };

        if let Err(e) = self
            .inner
            .api
            .logout(access_token.as_deref(), refresh_token.as_deref())
            .await
        {
            warn!(error = %e, "Server logout failed; local session already cleared");
        }
    }

    /// Exchange the refresh token for a new access token, replacing any
    /// scheduled refresh.
    ///
    /// Returns `false` without a request if another refresh is in flight.
    /// A failed refresh ends the session.
    pub async fn refresh_session(&self) -> bool {
        let (previous, epoch) = {
            let slot = self.inner.lock_slot();
            (slot.grant.clone(), slot.epoch)
        };
        self.refresh_from(previous, epoch).await
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> AuthState {
        self.inner.lock_slot().state
    }

    pub fn is_authenticated(&self) -> bool {
        let slot = self.inner.lock_slot();
        slot.state != AuthState::Anonymous && slot.grant.is_some()
    }

    pub fn access_token(&self) -> Option<String> {
        let slot = self.inner.lock_slot();
        slot.grant.as_ref().map(|g| g.session.access_token.clone())
    }

    /// `Authorization` header value for API calls made on the user's behalf
    pub fn authorization_header(&self) -> Option<String> {
        self.access_token().map(|token| format!("Bearer {}", token))
    }

    pub fn user(&self) -> Option<User> {
        let slot = self.inner.lock_slot();
        slot.grant.as_ref().map(|g| g.user.clone())
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        let grant = self.inner.lock_slot().grant.clone()?;
        Some(SessionInfo {
            user: grant.user,
            has_refresh_token: grant.session.refresh_token.is_some(),
            expires_at: grant.session.expires_at,
            refresh_expires_at: grant.session.refresh_expires_at,
            next_refresh_at: self.next_refresh_at(),
        })
    }

    /// When the pending proactive refresh will fire, if one is scheduled
    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock_timer().as_ref().map(|t| t.at)
    }

    pub fn has_pending_refresh(&self) -> bool {
        self.inner
            .lock_timer()
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Watch state transitions. The receiver starts at the current state.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state_tx.subscribe()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn refresh_from(&self, previous: Option<Grant>, epoch: u64) -> bool {
        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            debug!("Refresh already in flight, skipping");
            return false;
        }
        let _guard = RefreshGuard { inner: &self.inner };

        {
            let mut slot = self.inner.lock_slot();
            if slot.epoch != epoch {
                debug!("Session changed before refresh started, skipping");
                return false;
            }
            self.inner.cancel_timer();
            if slot.state == AuthState::Authenticated {
                slot.state = AuthState::Refreshing;
                self.inner.state_tx.send_replace(AuthState::Refreshing);
            }
        }

        let refresh_token = previous
            .as_ref()
            .and_then(|g| g.session.refresh_token.clone());

        let grant = match self.request_refresh(refresh_token.as_deref()).await {
            Ok(response) => Grant::from_response(response, previous.as_ref(), Utc::now()),
            Err(e) => Err(e),
        };

        match grant {
            Ok(grant) => {
                let user_id = grant.user.id.clone();
                if self.commit(Some(grant), Some(epoch)).await {
                    info!(user_id = %user_id, "Session refreshed");
                    true
                } else {
                    debug!("Session changed during refresh, discarding new tokens");
                    false
                }
            }
            Err(e) => {
                if self.commit(None, Some(epoch)).await {
                    warn!(error = %e, "Session refresh failed, signing out");
                } else {
                    debug!(error = %e, "Refresh failed after session changed, ignoring");
                }
                false
            }
        }
    }

    /// One refresh request, retried with exponential backoff for transient
    /// failures when the policy allows it.
    async fn request_refresh(&self, refresh_token: Option<&str>) -> Result<AuthResponse, ApiError> {
        let policy = &self.inner.policy;
        let mut retries = 0;
        let mut backoff_ms = policy.retry_backoff_ms;

        loop {
            match self.inner.api.refresh(refresh_token).await {
                Err(e) if e.is_transient() && retries < policy.max_retries => {
                    retries += 1;
                    warn!(error = %e, retry = retries, backoff_ms = backoff_ms, "Refresh failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
                result => return result,
            }
        }
    }

    async fn save_session(&self, grant: Grant) {
        self.commit(Some(grant), None).await;
    }

    async fn clear_session(&self) {
        self.commit(None, None).await;
    }

    /// The single writer path. With `expected_epoch`, the commit only
    /// happens if no other commit landed since that epoch was read.
    ///
    /// Memory, timer and broadcast change under the slot lock; the store is
    /// written afterwards and awaited, so callers return with storage in
    /// step.
    async fn commit(&self, grant: Option<Grant>, expected_epoch: Option<u64>) -> bool {
        {
            let mut slot = self.inner.lock_slot();
            if expected_epoch.is_some_and(|epoch| epoch != slot.epoch) {
                return false;
            }
            slot.epoch += 1;

            match grant {
                Some(grant) => {
                    self.schedule_refresh(grant.session.expires_at);
                    slot.grant = Some(grant);
                    slot.state = AuthState::Authenticated;
                }
                None => {
                    self.inner.cancel_timer();
                    slot.grant = None;
                    slot.state = AuthState::Anonymous;
                }
            }

            let state = slot.state;
            self.inner.state_tx.send_if_modified(|current| {
                let changed = *current != state;
                *current = state;
                changed
            });
        }

        self.sync_store().await;
        true
    }

    /// Runs on the blocking pool; the write finishes even if the caller's
    /// future is dropped.
    async fn sync_store(&self) {
        let inner = self.inner.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || inner.write_latest()).await {
            warn!(error = %e, "Storage write task failed");
        }
    }

    /// Replace any pending refresh with one timed from `expires_at`.
    fn schedule_refresh(&self, expires_at: DateTime<Utc>) {
        let now = Utc::now();
        let delay = self.inner.policy.refresh_delay(expires_at, now);
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let mut timer = self.inner.lock_timer();
        if let Some(previous) = timer.take() {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SessionManager { inner }.run_scheduled_refresh(id).await;
            }
        });

        debug!(timer = id, delay_secs = delay.as_secs(), refresh_at = %at, "Scheduled proactive refresh");
        *timer = Some(ScheduledRefresh { id, at, handle });
    }

    async fn run_scheduled_refresh(&self, id: u64) {
        {
            // Detach our own handle so the refresh below cannot abort itself
            let mut timer = self.inner.lock_timer();
            if !timer.as_ref().is_some_and(|scheduled| scheduled.id == id) {
                return;
            }
            timer.take();
        }

        let (previous, epoch) = {
            let slot = self.inner.lock_slot();
            (slot.grant.clone(), slot.epoch)
        };
        if previous.is_none() {
            return;
        }

        debug!(timer = id, "Proactive refresh due");
        self.refresh_from(previous, epoch).await;
    }
}
