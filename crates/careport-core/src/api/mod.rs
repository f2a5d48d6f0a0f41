//! REST gateway to the telehealth portal backend.
//!
//! This module provides the `Gateway` through which every backend call is
//! issued. It attaches the bearer token held by the `SessionStore`, renews
//! the token ahead of expiry, and replays a request once after renewing
//! when the backend reports an expired or missing token.
//!
//! Renewals are coordinated by `RenewalCoordinator` so that at most one
//! refresh call is ever in flight.

pub mod client;
pub mod endpoints;
pub mod error;
pub mod renewal;
pub mod transport;

pub use client::{Gateway, GatewayOptions};
pub use endpoints::PublicEndpoints;
pub use error::{ApiError, ExpiryReason, RenewalError, SessionExpired, UnauthorizedCause};
pub use renewal::{RenewalCoordinator, RenewalPolicy};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport, TransportError};
