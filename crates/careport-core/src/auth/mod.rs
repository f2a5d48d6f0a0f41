//! Session state: who is logged in, and whether their token is still usable.
//!
//! This module provides:
//! - `SessionStore`: the credential record plus the expiry policy
//! - `CredentialStorage` backends: memory, session file, OS keychain
//! - Token inspection and the `Clock` expiry is measured against
//!
//! Tokens are checked against a 5 minute validity margin and renewed
//! proactively once they are within 30 minutes of expiry.

pub mod session;
pub mod storage;
pub mod token;

pub use session::{ExpiryPolicy, Replacement, SessionStore};
pub use storage::{CredentialStorage, FileStorage, KeyringStorage, MemoryStorage, StorageError};
pub use token::{decode_claims, Clock, ManualClock, SystemClock, TokenClaims};
