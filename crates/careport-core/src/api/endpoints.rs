//! Backend paths the gateway treats specially.

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REFRESH_PATH: &str = "/api/auth/refresh-token";
pub const VALIDATE_SESSION_PATH: &str = "/api/auth/validate-session";
pub const HEALTH_PATH: &str = "/health";

/// Public paths that also cover anything beneath them
const PUBLIC_TREES: &[&str] = &[
    HEALTH_PATH,
    LOGIN_PATH,
    "/api/auth/register",
    "/api/auth/verify-otp",
    "/api/auth/resend-otp",
    "/api/auth/forgot-password",
    "/api/auth/reset-password",
    "/api/auth/verify-reset-token",
    REFRESH_PATH,
    // Listing, availability and slot lookups used by the booking flow
    "/api/doctors",
];

/// Decides which requests go out without a credential.
#[derive(Debug, Clone, Default)]
pub struct PublicEndpoints {
    extra: Vec<String>,
}

impl PublicEndpoints {
    /// `extra` paths are matched like the built-in auth flows: the path
    /// itself and anything beneath it.
    pub fn new(extra: Vec<String>) -> Self {
        let extra = extra
            .into_iter()
            .map(|p| normalize(&p).to_string())
            .filter(|p| p != "/")
            .collect();
        Self { extra }
    }

    pub fn is_public(&self, path: &str) -> bool {
        let path = normalize(path);

        PUBLIC_TREES.iter().any(|tree| in_tree(path, tree))
            || self.extra.iter().any(|tree| in_tree(path, tree))
    }
}

fn in_tree(path: &str, tree: &str) -> bool {
    path == tree
        || path
            .strip_prefix(tree)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

// Drop query string, fragment and trailing slashes
fn normalize(path: &str) -> &str {
    let path = path.split(|c: char| c == '?' || c == '#').next().unwrap_or(path);
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}
