use serde::Deserialize;
use thiserror::Error;

use crate::auth::StorageError;
use crate::models::Role;

use super::transport::TransportError;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Terminal: the credential could not be recovered and the session
    /// store has been cleared. Callers should send the user back to login.
    #[error("Session expired. Please log in again.")]
    SessionExpired(SessionExpired),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Please verify your email before logging in")]
    VerificationRequired,

    #[error("Login failed: {0}")]
    InvalidCredentials(String),

    #[error("Credential storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Details of a terminal session loss.
#[derive(Debug, Clone)]
pub struct SessionExpired {
    pub reason: ExpiryReason,
    /// Role of the account that was logged in, if known
    pub role: Option<Role>,
}

impl SessionExpired {
    /// Where a frontend should send the user; patients by default.
    pub fn login_path(&self) -> String {
        self.role.unwrap_or(Role::Patient).login_path()
    }
}

#[derive(Debug, Clone)]
pub enum ExpiryReason {
    /// Renewing the token failed
    RenewalFailed(RenewalError),
    /// The request was still rejected after a successful renewal
    RetryRejected,
}

impl std::fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpiryReason::RenewalFailed(e) => write!(f, "{}", e),
            ExpiryReason::RetryRejected => {
                f.write_str("request rejected again after token refresh")
            }
        }
    }
}

/// Outcome of a failed renewal, shared by every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("No token available for refresh")]
    NoCredential,

    #[error("Refresh rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Refresh request failed: {0}")]
    Transport(String),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Failed to store refreshed credential: {0}")]
    Storage(String),

    #[error("Logged out while the refresh was in flight")]
    LoggedOut,

    #[error("Refresh task aborted")]
    Aborted,
}

/// Why the backend answered 401, from the `error_type` field of its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnauthorizedCause {
    ExpiredToken,
    MissingToken,
    InvalidToken,
    Other,
}

impl UnauthorizedCause {
    pub fn from_body(body: &str) -> Self {
        #[derive(Deserialize)]
        struct Body {
            error_type: Option<String>,
        }

        let error_type = serde_json::from_str::<Body>(body).ok().and_then(|b| b.error_type);
        match error_type.as_deref() {
            Some("expired_token") => UnauthorizedCause::ExpiredToken,
            Some("missing_token") => UnauthorizedCause::MissingToken,
            Some("invalid_token") => UnauthorizedCause::InvalidToken,
            _ => UnauthorizedCause::Other,
        }
    }

    /// Only an expired or absent token can be fixed by renewing it
    pub fn is_renewable(&self) -> bool {
        matches!(self, UnauthorizedCause::ExpiredToken | UnauthorizedCause::MissingToken)
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Human-readable message from a backend error body. The backend uses
    /// `message` on some routes and `error` on others.
    pub fn body_message(body: &str) -> String {
        #[derive(Deserialize)]
        struct Body {
            message: Option<String>,
            error: Option<String>,
        }

        match serde_json::from_str::<Body>(body) {
            Ok(Body { message: Some(m), .. }) | Ok(Body { error: Some(m), .. }) => {
                Self::truncate_body(&m)
            }
            _ => Self::truncate_body(body),
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = Self::body_message(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::SessionExpired(_))
    }

    /// Login entry point to redirect to, for the terminal case only
    pub fn login_redirect(&self) -> Option<String> {
        match self {
            ApiError::SessionExpired(expired) => Some(expired.login_path()),
            _ => None,
        }
    }
}
