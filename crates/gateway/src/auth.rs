use clawgate_config::schema::{AuthModeConfig, GatewayAuthConfig};

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Token,
}

/// Resolved gateway auth configuration.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
}

/// Result of an authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub ok: bool,
    pub method: Option<AuthMethod>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Token,
}

impl AuthResult {
    fn allowed(method: AuthMethod) -> Self {
        Self {
            ok: true,
            method: Some(method),
            reason: None,
        }
    }

    fn denied(reason: &str) -> Self {
        Self {
            ok: false,
            method: None,
            reason: Some(reason.into()),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // XOR each byte and accumulate; any difference makes result non-zero.
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

// ── Auth logic ───────────────────────────────────────────────────────────────

impl ResolvedAuth {
    pub fn from_config(config: &GatewayAuthConfig) -> Self {
        let mode = match config.resolved_mode() {
            AuthModeConfig::None => AuthMode::None,
            AuthModeConfig::Token => AuthMode::Token,
        };
        Self {
            mode,
            token: config.token.clone(),
        }
    }

    pub fn none() -> Self {
        Self {
            mode: AuthMode::None,
            token: None,
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Token,
            token: Some(token.into()),
        }
    }
}

/// Authenticate a connect handshake or HTTP bearer token.
pub fn authorize_connect(auth: &ResolvedAuth, provided_token: Option<&str>) -> AuthResult {
    match auth.mode {
        AuthMode::None => AuthResult::allowed(AuthMethod::None),
        AuthMode::Token => {
            let Some(expected) = auth.token.as_deref() else {
                return AuthResult::denied("token_missing_config");
            };
            let Some(given) = provided_token else {
                return AuthResult::denied("token_missing");
            };
            if !safe_equal(given, expected) {
                return AuthResult::denied("token_mismatch");
            }
            AuthResult::allowed(AuthMethod::Token)
        },
    }
}
