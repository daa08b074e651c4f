//! Token Verifier and the login bootstrap endpoint.
//!
//! Token issuance is explicitly out of scope for the collaboration core
//!; this module is the
//! minimal stand-in SPEC_FULL.md calls for so the end-to-end login scenario
//! and the first-user-becomes-admin open question
//! are implementable. It deliberately does not grow into a full
//! auth framework — no password, refresh tokens, or OAuth (non-goals).

use crate::error::{Error, Result};
use crate::role::Role;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A verified identity, immutable for the lifetime of a socket or request
///.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    username: String,
    role: Role,
    exp: i64,
}

/// Validates bearer tokens against the shared symmetric secret and mints new
/// ones for the login handler. HS256 via `jsonwebtoken`, trimmed to three
/// claims (subject, username, role) — a richer multi-algorithm claim set
/// (roles, perms, iss, aud) doesn't fit this service's single-secret,
/// single-role model.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Arc<str>,
}

impl TokenVerifier {
    pub fn new(secret: Arc<str>) -> Self {
        Self { secret }
    }

    /// Succeeds iff the signature validates and the claims contain
    /// `userId:string`, `username:string`, `role` in `{viewer, editor,
    /// admin}`. Any failure returns no identity; no side effects.
    pub fn verify(&self, token: &str) -> Option<Identity> {
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<TokenClaims>(token, &key, &validation).ok()?;
        Some(Identity {
            user_id: data.claims.sub,
            username: data.claims.username,
            role: data.claims.role,
        })
    }

    /// Mint a 24h token for a freshly logged-in or looked-up user.
    pub fn issue(&self, identity: &Identity) -> Result<String> {
        let claims = TokenClaims {
            sub: identity.user_id.clone(),
            username: identity.username.clone(),
            role: identity.role,
            exp: (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp(),
        };
        let key = EncodingKey::from_secret(self.secret.as_bytes());
        encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|err| Error::Internal(format!("failed to mint token: {err}")))
    }
}

/// In-memory user directory backing the login bootstrap endpoint.
///
/// The real user store would persist this,
/// but login/user-management is an out-of-scope collaborator here — this
/// registry exists only to make the first-user-becomes-admin rule and
/// `POST /api/auth/login` observable end to end (see DESIGN.md).
#[derive(Default)]
pub struct UserDirectory {
    users: Mutex<HashMap<String, Identity>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing user by username, or create one. The very first
    /// user ever created becomes `admin`; everyone after starts as `viewer`.
    /// Preserved verbatim first open question.
    pub async fn login(&self, username: &str) -> Identity {
        let mut users = self.users.lock().await;
        if let Some(existing) = users.get(username) {
            return existing.clone();
        }
        let role = if users.is_empty() {
            Role::Admin
        } else {
            Role::Viewer
        };
        let identity = Identity {
            user_id: format!("user:{}", uuid::Uuid::new_v4()),
            username: username.to_string(),
            role,
        };
        users.insert(username.to_string(), identity.clone());
        identity
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct LoginUser {
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: LoginUser,
}

/// `POST /api/auth/login {username}`.
pub async fn login(
    axum::extract::State(state): axum::extract::State<
        crate::state::AppState<crate::config::CollabConfig>,
    >,
    axum::Json(body): axum::Json<LoginRequest>,
) -> Result<axum::Json<LoginResponse>> {
    let collab = state.collab();
    if collab.shutting_down.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(Error::ServiceUnavailable("server is shutting down".into()));
    }
    let username = body.username.trim();
    if username.is_empty() {
        return Err(Error::BadRequest("username must not be empty".into()));
    }

    let identity = collab.users.login(username).await;
    let token = collab.verifier.issue(&identity)?;

    Ok(axum::Json(LoginResponse {
        token,
        user: LoginUser {
            username: identity.username,
            role: identity.role,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_user_becomes_admin() {
        let directory = UserDirectory::new();
        let first = directory.login("alice").await;
        let second = directory.login("bob").await;
        assert_eq!(first.role, Role::Admin);
        assert_eq!(second.role, Role::Viewer);
    }

    #[tokio::test]
    async fn repeat_login_returns_same_identity() {
        let directory = UserDirectory::new();
        let first = directory.login("alice").await;
        let again = directory.login("alice").await;
        assert_eq!(first, again);
    }

    #[test]
    fn verifier_round_trips_a_token() {
        let verifier = TokenVerifier::new(Arc::from("test-secret"));
        let identity = Identity {
            user_id: "user:1".into(),
            username: "alice".into(),
            role: Role::Editor,
        };
        let token = verifier.issue(&identity).unwrap();
        let verified = verifier.verify(&token).unwrap();
        assert_eq!(verified, identity);
    }

    #[test]
    fn verifier_rejects_tampered_token() {
        let verifier = TokenVerifier::new(Arc::from("test-secret"));
        let other = TokenVerifier::new(Arc::from("other-secret"));
        let identity = Identity {
            user_id: "user:1".into(),
            username: "alice".into(),
            role: Role::Viewer,
        };
        let token = other.issue(&identity).unwrap();
        assert!(verifier.verify(&token).is_none());
    }
}
