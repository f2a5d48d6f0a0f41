use serde::{Deserialize, Serialize};

use super::User;

/// The paired access token and user identity held by the session store.
///
/// Also the shape of the backend's login and refresh responses, which
/// carry a few extra fields (`message`) that are ignored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub user: User,
}

impl CredentialRecord {
    pub fn new(access_token: impl Into<String>, user: User) -> Self {
        Self {
            access_token: access_token.into(),
            user,
        }
    }
}
