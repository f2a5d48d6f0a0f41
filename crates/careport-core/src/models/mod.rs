//! Data models shared between the session store and the request gateway.
//!
//! - `User`, `Role`: identity of the logged-in account
//! - `CredentialRecord`: access token paired with its user
//!
//! Appointment, doctor and payment payloads are backend-owned and pass
//! through the gateway as opaque JSON.

pub mod credential;
pub mod user;

pub use credential::CredentialRecord;
pub use user::{Role, User};
