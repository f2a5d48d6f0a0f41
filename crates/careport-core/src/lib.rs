//! Session and token lifecycle for the careport telehealth portal.
//!
//! Pages and services issue every backend call through [`api::Gateway`],
//! which keeps the credential held by [`auth::SessionStore`] alive:
//! proactive renewal before expiry, a single coordinated refresh when the
//! backend reports an expired token, and one replay of the failed request.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, ApiRequest, ApiResponse, Gateway};
pub use auth::SessionStore;
pub use config::Config;
pub use models::{CredentialRecord, Role, User};
