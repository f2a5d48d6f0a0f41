//! Token renewal with at most one refresh call in flight.
//!
//! The coordinator is a two-state machine. `Idle` → `Pending` when the
//! first caller asks for a renewal; that caller's refresh runs in its own
//! task, and everyone who asks while it is `Pending` awaits the same shared
//! result. The task puts the machine back to `Idle` once it settles, after
//! the session store has been updated (success) or cleared (failure).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::auth::{decode_claims, Replacement, SessionStore};
use crate::models::CredentialRecord;

use super::endpoints::REFRESH_PATH;
use super::error::{ApiError, RenewalError};
use super::transport::{ApiRequest, Transport};

/// Extra attempts when the refresh call gets no response at all.
/// A rejected refresh is never retried.
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 1;

/// Initial backoff before retrying a refresh that got no response
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

type SharedRenewal = Shared<BoxFuture<'static, Result<CredentialRecord, RenewalError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    pub transport_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            transport_retries: DEFAULT_TRANSPORT_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

enum RenewalState {
    Idle,
    Pending { generation: u64, result: SharedRenewal },
}

pub struct RenewalCoordinator {
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    policy: RenewalPolicy,
    state: Mutex<RenewalState>,
    next_generation: AtomicU64,
}

impl RenewalCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        policy: RenewalPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            state: Mutex::new(RenewalState::Idle),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Renew the stored credential, joining a refresh already in flight.
    pub async fn renew(self: &Arc<Self>) -> Result<CredentialRecord, RenewalError> {
        self.pending_or_start().await
    }

    /// Start a renewal without waiting for it. A no-op if one is in flight.
    pub fn renew_in_background(self: &Arc<Self>) {
        // The refresh lives in its own task, the shared handle can go
        drop(self.pending_or_start());
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.lock_state(), RenewalState::Pending { .. })
    }

    fn pending_or_start(self: &Arc<Self>) -> SharedRenewal {
        let mut state = self.lock_state();
        if let RenewalState::Pending { result, .. } = &*state {
            debug!("Joining in-flight token refresh");
            return result.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        debug!(generation, "Starting token refresh");

        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _settle = SettleOnDrop {
                coordinator: Arc::clone(&coordinator),
                generation,
            };
            coordinator.refresh().await
        });

        let result = async move {
            task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Token refresh task did not complete");
                Err(RenewalError::Aborted)
            })
        }
        .boxed()
        .shared();

        *state = RenewalState::Pending {
            generation,
            result: result.clone(),
        };
        result
    }

    fn settle(&self, generation: u64) {
        let mut state = self.lock_state();
        if matches!(*state, RenewalState::Pending { generation: g, .. } if g == generation) {
            *state = RenewalState::Idle;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RenewalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh(&self) -> Result<CredentialRecord, RenewalError> {
        let token = match self.store.token() {
            Some(token) => token,
            None => {
                // Wipe any half-written leftovers along with the session
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "Failed to clear session");
                }
                return Err(RenewalError::NoCredential);
            }
        };

        match self.request_credential(&token).await {
            Ok(record) => self.store_renewed(&token, record),
            Err(err) => {
                warn!(error = %err, "Token refresh failed, clearing session");
                match self.store.clear_if_current(&token) {
                    Ok(true) => {}
                    Ok(false) => debug!("Session changed during refresh, leaving it in place"),
                    Err(e) => warn!(error = %e, "Failed to clear session"),
                }
                Err(err)
            }
        }
    }

    fn store_renewed(
        &self,
        presented: &str,
        record: CredentialRecord,
    ) -> Result<CredentialRecord, RenewalError> {
        match self.store.replace_if_current(presented, &record) {
            Ok(Replacement::Replaced) => {
                info!(user_id = %record.user.id, role = %record.user.role, "Token refreshed");
                Ok(record)
            }
            Ok(Replacement::Superseded(current)) => {
                debug!("A newer login landed during refresh, keeping it");
                Ok(current)
            }
            Ok(Replacement::Vacated) => {
                debug!("Logged out during refresh, discarding new token");
                Err(RenewalError::LoggedOut)
            }
            Err(e) => {
                warn!(error = %e, "Failed to store refreshed token, clearing session");
                if let Err(e) = self.store.clear_if_current(presented) {
                    warn!(error = %e, "Failed to clear session");
                }
                Err(RenewalError::Storage(e.to_string()))
            }
        }
    }

    async fn request_credential(&self, token: &str) -> Result<CredentialRecord, RenewalError> {
        let request =
            ApiRequest::post(REFRESH_PATH, serde_json::json!({})).with_bearer(Some(token));
        let mut retries = 0;
        let mut backoff = self.policy.initial_backoff;

        loop {
            match self.transport.dispatch(&request).await {
                Ok(response) if response.is_success() => {
                    let record: CredentialRecord = response
                        .json()
                        .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?;
                    if decode_claims(&record.access_token).is_none() {
                        return Err(RenewalError::InvalidResponse(
                            "refreshed token has no readable expiry".to_string(),
                        ));
                    }
                    return Ok(record);
                }
                Ok(response) => {
                    return Err(RenewalError::Rejected {
                        status: response.status.as_u16(),
                        message: ApiError::body_message(&response.body),
                    });
                }
                Err(e) => {
                    retries += 1;
                    if retries > self.policy.transport_retries {
                        return Err(RenewalError::Transport(e.to_string()));
                    }
                    warn!(
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Token refresh got no response, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

/// Returns the coordinator to `Idle` when the refresh task ends, even if
/// it panicked.
struct SettleOnDrop {
    coordinator: Arc<RenewalCoordinator>,
    generation: u64,
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        self.coordinator.settle(self.generation);
    }
}
