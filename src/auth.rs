use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::DomainClient;
use crate::error::is_token_error;

/// Cached validation results younger than this are reused.
pub const VALIDATION_CACHE: Duration = Duration::from_secs(60);
/// Assumed token lifetime; older tokens are refreshed instead of checked.
pub const TOKEN_EXPIRATION: Duration = Duration::from_secs(60 * 60);
/// Backoff before each retry of a failed refresh.
const REFRESH_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];
const AUTHENTICATE_BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

#[derive(Debug, Default)]
struct AuthState {
    last_refresh: Option<Instant>,
    last_validation: Option<Instant>,
    token_valid: bool,
    validation_in_progress: bool,
    /// Result channel of the refresh currently running, if any.
    refresh_in_flight: Option<watch::Receiver<Option<bool>>>,
}

/// Token lifecycle for the domain session.
///
/// Neither validation nor refresh ever overlaps with itself: a second caller
/// gets the cached validity (validation) or the in-flight result (refresh).
/// Failures resolve to `false` and are never returned as errors.
pub struct AuthSession {
    client: Arc<dyn DomainClient>,
    state: Mutex<AuthState>,
}

/// Clears a busy flag when the owning call finishes or is dropped.
struct BusyGuard<'a> {
    state: &'a Mutex<AuthState>,
    clear: fn(&mut AuthState),
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (self.clear)(&mut state);
    }
}

impl AuthSession {
    pub fn new(client: Arc<dyn DomainClient>) -> Self {
        Self {
            client,
            state: Mutex::new(AuthState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_token_valid(&self) -> bool {
        self.lock().token_valid
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().refresh_in_flight.is_some()
    }

    /// Signs in with stored credentials, retrying twice with 1 s and 2 s
    /// backoff. Returns the domain server URL.
    pub async fn authenticate(&self) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.client.authenticate(None).await {
                Ok(url) => {
                    let mut state = self.lock();
                    let now = Instant::now();
                    state.last_refresh = Some(now);
                    state.last_validation = Some(now);
                    state.token_valid = true;
                    info!("[AUTH] Authenticated, domain server {}", url);
                    return Ok(url);
                }
                Err(e) => {
                    let Some(backoff) = AUTHENTICATE_BACKOFF.get(attempt) else {
                        self.lock().token_valid = false;
                        warn!("[AUTH] Authentication failed after {} attempts: {}", attempt + 1, e);
                        return Err(e);
                    };
                    warn!("[AUTH] Authentication attempt {} failed: {}", attempt + 1, e);
                    tokio::time::sleep(*backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Checks that the token is still usable, refreshing it when it is
    /// likely expired or the validity check says it was rejected.
    pub async fn validate_token(&self, force: bool) -> bool {
        let refresh_due = {
            let mut state = self.lock();
            if state.validation_in_progress {
                debug!("[AUTH] Validation already in progress");
                return state.token_valid;
            }
            if !force {
                if let Some(last) = state.last_validation {
                    if last.elapsed() < VALIDATION_CACHE {
                        return state.token_valid;
                    }
                }
            }
            let due = state
                .last_refresh
                .map_or(true, |last| last.elapsed() > TOKEN_EXPIRATION);
            if !due {
                state.validation_in_progress = true;
            }
            due
        };

        if refresh_due {
            info!("[AUTH] Token older than expiration estimate, refreshing");
            return self.refresh_token().await;
        }

        let check = {
            let _guard = BusyGuard {
                state: &self.state,
                clear: |state| state.validation_in_progress = false,
            };
            self.client.test_token_validity().await
        };

        match check {
            Ok(()) => {
                let mut state = self.lock();
                state.token_valid = true;
                state.last_validation = Some(Instant::now());
                true
            }
            Err(e) if is_token_error(&e.to_string()) => {
                warn!("[AUTH] Token rejected ({}), refreshing", e);
                self.refresh_token().await
            }
            Err(e) => {
                // Network trouble says nothing about the token itself.
                warn!("[AUTH] Token validity check failed: {}", e);
                self.lock().token_valid
            }
        }
    }

    /// Refreshes the token with up to three retries. Concurrent callers share
    /// one in-flight attempt and all receive its result.
    pub async fn refresh_token(&self) -> bool {
        let pending = {
            let mut state = self.lock();
            if let Some(rx) = state.refresh_in_flight.clone() {
                let fallback = state.token_valid;
                Err((rx, fallback))
            } else {
                let (tx, rx) = watch::channel(None);
                state.refresh_in_flight = Some(rx);
                Ok(tx)
            }
        };
        let result_tx = match pending {
            Ok(tx) => tx,
            Err((rx, fallback)) => {
                debug!("[AUTH] Refresh already in flight, waiting for its result");
                return Self::await_refresh(rx, fallback).await;
            }
        };

        let _guard = BusyGuard {
            state: &self.state,
            clear: |state| state.refresh_in_flight = None,
        };

        let mut attempt = 0;
        let refreshed = loop {
            match self.client.refresh_token().await {
                Ok(()) => break true,
                Err(e) => {
                    let Some(backoff) = REFRESH_BACKOFF.get(attempt) else {
                        warn!("[AUTH] Token refresh gave up after {} attempts: {}", attempt + 1, e);
                        break false;
                    };
                    warn!(
                        "[AUTH] Token refresh attempt {} failed: {}, retrying in {:?}",
                        attempt + 1,
                        e,
                        backoff
                    );
                    tokio::time::sleep(*backoff).await;
                    attempt += 1;
                }
            }
        };

        {
            let mut state = self.lock();
            state.token_valid = refreshed;
            if refreshed {
                let now = Instant::now();
                state.last_refresh = Some(now);
                state.last_validation = Some(now);
                info!("[AUTH] Token refreshed");
            }
        }
        result_tx.send_replace(Some(refreshed));
        refreshed
    }

    async fn await_refresh(mut rx: watch::Receiver<Option<bool>>, fallback: bool) -> bool {
        match rx.wait_for(Option::is_some).await {
            Ok(result) => result.unwrap_or(fallback),
            // The refreshing task was dropped before it finished.
            Err(_) => fallback,
        }
    }
}
