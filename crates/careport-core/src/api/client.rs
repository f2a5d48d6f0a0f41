//! Request gateway for the portal backend.
//!
//! Every backend call goes through `Gateway::send`, which attaches the
//! current bearer token, starts a background renewal when the token is
//! close to expiry, and replays a request once after renewing when the
//! backend rejects it for an expired or missing token.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{decode_claims, SessionStore};
use crate::config::Config;
use crate::models::CredentialRecord;

use super::endpoints::{PublicEndpoints, LOGIN_PATH, VALIDATE_SESSION_PATH};
use super::error::{ExpiryReason, RenewalError, SessionExpired, UnauthorizedCause};
use super::renewal::{RenewalCoordinator, RenewalPolicy};
use super::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
use super::ApiError;

#[derive(Debug, Clone, Default)]
pub struct GatewayOptions {
    pub renewal: RenewalPolicy,
    /// Paths reachable without a credential, on top of the auth flows
    pub extra_public_paths: Vec<String>,
}

/// Gateway to the portal backend.
/// Clone is cheap - all state is behind `Arc`s and shared between clones.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    renewal: Arc<RenewalCoordinator>,
    public: Arc<PublicEndpoints>,
}

impl Gateway {
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        options: GatewayOptions,
    ) -> Self {
        let renewal = Arc::new(RenewalCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            options.renewal,
        ));
        Self {
            store,
            transport,
            renewal,
            public: Arc::new(PublicEndpoints::new(options.extra_public_paths)),
        }
    }

    /// Gateway over HTTP with the session store and policies from `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = config.session_store().context("Failed to open session storage")?;
        let transport = HttpTransport::new(
            config.api_url.clone(),
            config.request_timeout(),
        )
        .context("Failed to build HTTP client")?;

        Ok(Self::new(
            Arc::new(store),
            Arc::new(transport),
            GatewayOptions {
                renewal: config.renewal_policy(),
                extra_public_paths: config.extra_public_paths.clone(),
            },
        ))
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn renewal(&self) -> &Arc<RenewalCoordinator> {
        &self.renewal
    }

    /// Send a request, returning the response only if it succeeded.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.send_raw(request).await?;
        Self::check_response(response)
    }

    /// Like `send`, but hands back non-2xx responses instead of classifying
    /// them. Transport failures and terminal session loss are still errors.
    pub async fn send_raw(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if self.public.is_public(&request.path) {
            debug!(method = %request.method, path = %request.path, "Dispatching public request");
            let response = self.transport.dispatch(&request.with_bearer(None)).await?;
            return Ok(response);
        }

        // Only a valid token is attached; otherwise the 401 path takes over
        let token = self
            .store
            .token()
            .filter(|t| self.store.is_valid(Some(t.as_str())));
        if let Some(ref token) = token {
            self.renew_if_due(token);
        }

        debug!(
            method = %request.method,
            path = %request.path,
            authenticated = token.is_some(),
            "Dispatching request"
        );
        let response = self.dispatch(&request, token.as_deref()).await?;

        if response.status == StatusCode::UNAUTHORIZED {
            let cause = UnauthorizedCause::from_body(&response.body);
            if cause.is_renewable() {
                debug!(path = %request.path, ?cause, "Token rejected, renewing and retrying once");
                return self.renew_and_replay(&request, token.as_deref()).await;
            }
        }

        Ok(response)
    }

    /// `presented` is the token the rejected attempt carried. If the store
    /// already holds a different valid token, a renewal settled while the
    /// attempt was in flight and its token is reused instead of renewing again.
    async fn renew_and_replay(
        &self,
        request: &ApiRequest,
        presented: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        // The store may be cleared by the renewal, so remember who was logged in
        let role = self.store.role();

        let newer = self.store.get().filter(|r| {
            Some(r.access_token.as_str()) != presented && self.store.is_valid(Some(&r.access_token))
        });

        let renewed = match newer {
            Some(record) => {
                debug!(path = %request.path, "Token already renewed, replaying with it");
                Ok(record)
            }
            None => self.renewal.renew().await,
        };

        let record = match renewed {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %request.path, error = %err, "Session expired, token refresh failed");
                return Err(ApiError::SessionExpired(SessionExpired {
                    reason: ExpiryReason::RenewalFailed(err),
                    role,
                }));
            }
        };

        let response = self.dispatch(request, Some(&record.access_token)).await?;

        if response.status == StatusCode::UNAUTHORIZED {
            warn!(
                path = %request.path,
                "Request rejected again after token refresh, clearing session"
            );
            if let Err(e) = self.store.clear_if_current(&record.access_token) {
                warn!(error = %e, "Failed to clear session");
            }
            return Err(ApiError::SessionExpired(SessionExpired {
                reason: ExpiryReason::RetryRejected,
                role: role.or(Some(record.user.role)),
            }));
        }

        Ok(response)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let response = self.transport.dispatch(&request.with_bearer(token)).await?;
        if response.refresh_suggested() {
            if let Some(token) = token {
                debug!("Backend suggested a token refresh");
                self.renew_if_due(token);
            }
        }
        Ok(response)
    }

    fn renew_if_due(&self, token: &str) {
        if self.store.should_renew(Some(token)) {
            debug!("Token expires soon, renewing in background");
            self.renewal.renew_in_background();
        }
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    // ===== Session Operations =====

    /// Log in and store the resulting credential
    pub async fn login(&self, email: &str, password: &str) -> Result<CredentialRecord, ApiError> {
        #[derive(Deserialize)]
        struct LoginRejection {
            #[serde(default)]
            requires_verification: bool,
        }

        let request = ApiRequest::post(
            LOGIN_PATH,
            serde_json::json!({ "email": email, "password": password }),
        );
        let response = self.send_raw(request).await?;

        match response.status {
            status if status.is_success() => {}
            StatusCode::FORBIDDEN => {
                let rejection = serde_json::from_str::<LoginRejection>(&response.body);
                if rejection.map(|r| r.requires_verification).unwrap_or(false) {
                    return Err(ApiError::VerificationRequired);
                }
                return Err(ApiError::from_status(response.status, &response.body));
            }
            StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST => {
                return Err(ApiError::InvalidCredentials(ApiError::body_message(&response.body)));
            }
            _ => return Err(ApiError::from_status(response.status, &response.body)),
        }

        let record: CredentialRecord = response.json()?;
        if decode_claims(&record.access_token).is_none() {
            return Err(ApiError::InvalidResponse(
                "login token has no readable expiry".to_string(),
            ));
        }

        self.store.set(&record)?;
        info!(user_id = %record.user.id, role = %record.user.role, "Login successful");
        Ok(record)
    }

    /// Forget the stored credential
    pub fn logout(&self) -> Result<(), ApiError> {
        self.store.clear()?;
        info!("Logged out");
        Ok(())
    }

    /// Network-confirmed session check. Never renews or clears anything,
    /// so the refresh hint on its response is ignored.
    pub async fn validate_session(&self) -> bool {
        let token = match self.store.get() {
            Some(record) if self.store.is_valid(Some(&record.access_token)) => record.access_token,
            _ => return false,
        };

        let request = ApiRequest::get(VALIDATE_SESSION_PATH).with_bearer(Some(&token));
        match self.transport.dispatch(&request).await {
            Ok(response) if response.is_success() => true,
            Ok(response) => {
                debug!(status = %response.status, "Session validation rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "Session validation failed");
                false
            }
        }
    }

    /// A token that is valid right now, renewing first if the stored one
    /// is inside the validity margin.
    pub async fn ensure_valid_session(&self) -> Result<String, ApiError> {
        let role = self.store.role();
        let token = match self.store.token() {
            Some(token) => token,
            None => {
                return Err(ApiError::SessionExpired(SessionExpired {
                    reason: ExpiryReason::RenewalFailed(RenewalError::NoCredential),
                    role,
                }));
            }
        };

        if self.store.is_valid(Some(&token)) {
            return Ok(token);
        }

        match self.renewal.renew().await {
            Ok(record) => Ok(record.access_token),
            Err(err) => Err(ApiError::SessionExpired(SessionExpired {
                reason: ExpiryReason::RenewalFailed(err),
                role,
            })),
        }
    }

    // ===== Typed Helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path, Self::to_value(body)?)).await?.json()
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::put(path, Self::to_value(body)?)).await?.json()
    }

    pub async fn delete_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::delete(path)).await?.json()
    }

    fn to_value<B: Serialize>(body: &B) -> Result<serde_json::Value, ApiError> {
        serde_json::to_value(body)
            .map_err(|e| {
                ApiError::InvalidResponse(format!("Failed to serialize request body: {}", e))
            })
    }
}
