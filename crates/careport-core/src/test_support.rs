//! Scripted backend and token minting for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::json;

use crate::api::endpoints::{HEALTH_PATH, LOGIN_PATH, REFRESH_PATH};
use crate::api::transport::REFRESH_SUGGESTED_HEADER;
use crate::api::{
    ApiRequest, ApiResponse, Gateway, GatewayOptions, RenewalPolicy, Transport, TransportError,
};
use crate::auth::{Clock, ExpiryPolicy, ManualClock, MemoryStorage, SessionStore};
use crate::models::{CredentialRecord, Role, User};

/// Virtual "now" every test starts at
pub(crate) const START: i64 = 1_700_000_000;

const SECRET: &[u8] = b"test-secret";

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mint a signed token. Each call yields a distinct token even for equal claims.
pub(crate) fn mint_token(id: &str, email: &str, role: &str, exp: i64) -> String {
    #[derive(Serialize)]
    struct Claims<'a> {
        id: &'a str,
        email: &'a str,
        role: &'a str,
        exp: i64,
        jti: u64,
    }

    let claims = Claims {
        id,
        email,
        role,
        exp,
        jti: TOKEN_SEQ.fetch_add(1, Ordering::Relaxed),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET))
        .expect("test token encodes")
}

pub(crate) fn patient() -> User {
    User::new("1", "a@b.com", "Ada", Role::Patient)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum RefreshBehavior {
    Issue { lifetime_secs: i64 },
    Reject,
    ServerError,
    /// The next `failures` refresh calls get no response, later ones succeed
    Unreachable { failures: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub path: String,
    pub bearer: Option<String>,
}

struct MockState {
    accepted: HashSet<String>,
    refresh: RefreshBehavior,
    refresh_calls: usize,
    log: Vec<Dispatch>,
    reject_all: bool,
    suggest_refresh: bool,
    canned: HashMap<String, (StatusCode, String)>,
    unreachable: HashSet<String>,
    delays: HashMap<String, Duration>,
}

/// Stands in for the portal backend: accepts the tokens it has been told
/// about, answers 401 `expired_token`/`missing_token` otherwise, and echoes
/// the bearer and body back on success.
pub(crate) struct MockBackend {
    clock: Arc<ManualClock>,
    refresh_delay: Duration,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            refresh_delay: Duration::from_millis(20),
            state: Mutex::new(MockState {
                accepted: HashSet::new(),
                refresh: RefreshBehavior::Issue { lifetime_secs: 3600 },
                refresh_calls: 0,
                log: Vec::new(),
                reject_all: false,
                suggest_refresh: false,
                canned: HashMap::new(),
                unreachable: HashSet::new(),
                delays: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn accept(&self, token: &str) {
        self.state().accepted.insert(token.to_string());
    }

    pub fn set_refresh(&self, behavior: RefreshBehavior) {
        self.state().refresh = behavior;
    }

    pub fn set_reject_all(&self, reject: bool) {
        self.state().reject_all = reject;
    }

    pub fn set_suggest_refresh(&self, suggest: bool) {
        self.state().suggest_refresh = suggest;
    }

    pub fn canned(&self, path: &str, status: StatusCode, body: &str) {
        self.state().canned.insert(path.to_string(), (status, body.to_string()));
    }

    pub fn unreachable(&self, path: &str) {
        self.state().unreachable.insert(path.to_string());
    }

    /// Hold responses for `path` back by `delay`. The token is checked when
    /// the request arrives, the answer goes out after the delay.
    pub fn delay(&self, path: &str, delay: Duration) {
        self.state().delays.insert(path.to_string(), delay);
    }

    pub fn refresh_calls(&self) -> usize {
        self.state().refresh_calls
    }

    pub fn log(&self) -> Vec<Dispatch> {
        self.state().log.clone()
    }

    pub fn dispatches_to(&self, path: &str) -> Vec<Dispatch> {
        self.state().log.iter().filter(|d| d.path == path).cloned().collect()
    }

    fn issue(&self, lifetime_secs: i64) -> ApiResponse {
        let user = patient();
        let exp = self.clock.now() + lifetime_secs;
        let token = mint_token(&user.id, &user.email, user.role.as_str(), exp);
        self.accept(&token);
        let body = json!({
            "access_token": token,
            "user": user,
            "message": "Token refreshed successfully"
        });
        ApiResponse::new(StatusCode::OK, body.to_string())
    }

    fn refresh(&self, bearer: Option<&str>) -> Result<ApiResponse, TransportError> {
        if bearer.is_none() {
            let body = r#"{"error": "Token is missing"}"#;
            return Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, body));
        }

        let behavior = {
            let mut state = self.state();
            let behavior = state.refresh;
            if let RefreshBehavior::Unreachable { failures } = behavior {
                state.refresh = if failures > 1 {
                    RefreshBehavior::Unreachable { failures: failures - 1 }
                } else {
                    RefreshBehavior::Issue { lifetime_secs: 3600 }
                };
            }
            behavior
        };

        match behavior {
            RefreshBehavior::Issue { lifetime_secs } => Ok(self.issue(lifetime_secs)),
            RefreshBehavior::Reject => Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                r#"{"error": "Token is invalid and cannot be refreshed"}"#,
            )),
            RefreshBehavior::ServerError => Ok(ApiResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error": "Failed to refresh token"}"#,
            )),
            RefreshBehavior::Unreachable { .. } => {
                Err(TransportError::Unavailable("connection refused".to_string()))
            }
        }
    }

    fn login(&self, request: &ApiRequest) -> ApiResponse {
        let body = request.body.clone().unwrap_or_default();
        let email = body["email"].as_str().unwrap_or_default();
        let password = body["password"].as_str().unwrap_or_default();

        match (email, password) {
            ("a@b.com", "x") => self.issue(3600),
            ("new@b.com", _) => ApiResponse::new(
                StatusCode::FORBIDDEN,
                json!({
                    "message": "Please verify your email before logging in",
                    "requires_verification": true,
                    "user_id": "9"
                })
                .to_string(),
            ),
            _ => ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                r#"{"message": "Invalid email or password"}"#,
            ),
        }
    }

    fn protected(&self, path: &str, request: &ApiRequest) -> ApiResponse {
        let state = self.state();
        let bearer = match request.bearer() {
            Some(bearer) => bearer,
            None => {
                return ApiResponse::new(
                    StatusCode::UNAUTHORIZED,
                    r#"{"message": "Token is missing", "error_type": "missing_token"}"#,
                );
            }
        };
        if state.reject_all || !state.accepted.contains(bearer) {
            return ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                r#"{"message": "Token has expired", "error_type": "expired_token"}"#,
            );
        }

        let body = json!({ "path": path, "token": bearer, "body": request.body });
        let response = ApiResponse::new(StatusCode::OK, body.to_string());
        if state.suggest_refresh {
            response.with_header(REFRESH_SUGGESTED_HEADER, "true")
        } else {
            response
        }
    }
}

#[async_trait]
impl Transport for MockBackend {
    async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let path = request.path.split('?').next().unwrap_or_default().to_string();
        let (unreachable, canned) = {
            let mut state = self.state();
            state.log.push(Dispatch {
                path: path.clone(),
                bearer: request.bearer().map(str::to_string),
            });
            if path == REFRESH_PATH {
                state.refresh_calls += 1;
            }
            (state.unreachable.contains(&path), state.canned.get(&path).cloned())
        };
        let delay = self.state().delays.get(&path).copied();

        if unreachable {
            return Err(TransportError::Unavailable("connection reset".to_string()));
        }
        if let Some((status, body)) = canned {
            return Ok(ApiResponse::new(status, body));
        }

        match path.as_str() {
            REFRESH_PATH => {
                tokio::time::sleep(self.refresh_delay).await;
                self.refresh(request.bearer())
            }
            LOGIN_PATH => Ok(self.login(request)),
            HEALTH_PATH => Ok(ApiResponse::new(StatusCode::OK, r#"{"status": "healthy"}"#)),
            p if p.starts_with("/api/doctors") => Ok(ApiResponse::new(StatusCode::OK, "[]")),
            _ => {
                let response = self.protected(&path, request);
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(response)
            }
        }
    }
}

/// A gateway wired to a mock backend on a manual clock.
pub(crate) struct Harness {
    pub clock: Arc<ManualClock>,
    pub backend: Arc<MockBackend>,
    pub store: Arc<SessionStore>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let backend = Arc::new(MockBackend::new(Arc::clone(&clock)));
        let store = Arc::new(SessionStore::new(
            Box::new(MemoryStorage::new()),
            clock.clone(),
            ExpiryPolicy::default(),
        ));
        Self { clock, backend, store }
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            transport_retries: 1,
            initial_backoff: Duration::from_millis(1),
        }
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(
            Arc::clone(&self.store),
            self.backend.clone(),
            GatewayOptions {
                renewal: self.renewal_policy(),
                extra_public_paths: Vec::new(),
            },
        )
    }

    /// Store a patient credential expiring `lifetime_secs` from now.
    /// `accepted` controls whether the backend still honours it.
    pub fn log_in(&self, lifetime_secs: i64, accepted: bool) -> CredentialRecord {
        let user = patient();
        let exp = self.clock.now() + lifetime_secs;
        let token = mint_token(&user.id, &user.email, user.role.as_str(), exp);
        if accepted {
            self.backend.accept(&token);
        }
        let record = CredentialRecord::new(token, user);
        self.store.set(&record).expect("memory storage never fails");
        record
    }

    /// Wait until a background renewal has started and settled
    pub async fn wait_for_renewal(&self, gateway: &Gateway) {
        let wait = async {
            while self.backend.refresh_calls() == 0 || gateway.renewal().is_pending() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("background renewal did not settle");
    }
}
