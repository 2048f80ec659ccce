//! Basic-Auth gate, credential storage, and the password policy.
//!
//! The device has exactly one operator account. Every route is gated by
//! [`auth_middleware`]; a missing or failed `Authorization` header yields a
//! 401 with a `WWW-Authenticate: Basic` challenge and no hint about which
//! part of the credential was wrong.

use axum::body::Body;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum::middleware;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{MAX_CREDENTIAL_BYTES, WebConfig};
use crate::error::ApiError;
use crate::frames::read_bounded_json;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    /// 64 lowercase hex characters (SHA-256 digest).
    pub password_hash: String,
    pub first_login: bool,
}

impl From<&WebConfig> for Credentials {
    fn from(web: &WebConfig) -> Self {
        Self {
            username: web.username.clone(),
            password_hash: web.password_hash.clone(),
            first_login: web.first_login,
        }
    }
}

/// Holds the single operator credential for the lifetime of the process.
pub struct CredentialStore {
    inner: RwLock<Credentials>,
}

impl CredentialStore {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(credentials),
        }
    }

    pub async fn snapshot(&self) -> Credentials {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, credentials: Credentials) {
        *self.inner.write().await = credentials;
    }
}

/// SHA-256 digest of the input, lowercase hex.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Hashes `password` and compares against a stored hex digest,
/// case-insensitively.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    hash_password(password).eq_ignore_ascii_case(stored_hash)
}

/// Returns the first violated password rule, or `None` when the password is
/// acceptable. Rules are checked in a fixed order so the operator always
/// sees the same message for the same password.
pub fn password_policy_error(password: &str) -> Option<&'static str> {
    if password.len() < 8 {
        return Some("Password must be at least 8 characters");
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Some("Password must contain at least 1 uppercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Some("Password must contain at least 1 lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Some("Password must contain at least 1 digit");
    }
    None
}

pub fn is_password_strong(password: &str) -> bool {
    password_policy_error(password).is_none()
}

/// Validates a raw `Authorization` header value against the stored
/// credential. All failure modes are indistinguishable to the caller.
pub fn check_basic_auth(header: Option<&str>, credentials: &Credentials) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return false;
    };
    let encoded = encoded.trim();

    // Bound the decoded size before touching the payload.
    if encoded.len() / 4 * 3 + 3 > MAX_CREDENTIAL_BYTES {
        return false;
    }
    let Ok(decoded) = BASE64.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((username, password)) = decoded.split_once(':') else {
        return false;
    };

    username.as_bytes() == credentials.username.as_bytes()
        && verify_password(password, &credentials.password_hash)
}

fn challenge() -> ApiError {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(r#"Basic realm="dispenserd""#),
    );
    ApiError::Unauthorized {
        headers,
        message: "unauthorized".to_string(),
    }
}

/// Gate in front of every route.
pub async fn auth_middleware(
    Extension(state): Extension<Arc<AppState>>,
    req: Request<Body>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let credentials = state.credentials.snapshot().await;
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if check_basic_auth(header, &credentials) {
        Ok(next.run(req).await)
    } else {
        warn!(path = req.uri().path(), "rejected unauthenticated request");
        Err(challenge())
    }
}

/// Current account state for the management UI.
pub async fn auth_status(Extension(state): Extension<Arc<AppState>>) -> Response {
    let credentials = state.credentials.snapshot().await;
    JsonResponse(json!({
        "username": credentials.username,
        "first_login": credentials.first_login,
        "password_change_required": credentials.first_login,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub(crate) struct ChangePasswordRequest {
    #[serde(default)]
    current_password: String,
    #[serde(default)]
    new_password: String,
    username: Option<String>,
}

/// Changes the operator credential. Requires the current password, enforces
/// the strength policy on the new one, and persists before acknowledging.
pub async fn change_password(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let request: ChangePasswordRequest = read_bounded_json(body).await?;
    let credentials = state.credentials.snapshot().await;

    if !verify_password(&request.current_password, &credentials.password_hash) {
        return Err(ApiError::Unauthorized {
            headers: HeaderMap::new(),
            message: "current password is incorrect".to_string(),
        });
    }
    if let Some(rule) = password_policy_error(&request.new_password) {
        return Err(ApiError::BadRequest(rule.to_string()));
    }

    let username = request
        .username
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(credentials.username);
    let password_hash = hash_password(&request.new_password);

    let updated = Credentials {
        username: username.clone(),
        password_hash: password_hash.clone(),
        first_login: false,
    };
    state
        .config
        .update(|doc| {
            doc.web.username = username.clone();
            doc.web.password_hash = password_hash.clone();
            doc.web.first_login = false;
        })
        .await?;
    state.credentials.replace(updated).await;
    info!(username, "operator credential changed");

    Ok(JsonResponse(json!({
        "status": "ok",
        "message": "Password changed successfully",
        "username": username,
        "first_login": false,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_credentials(password: &str) -> Credentials {
        Credentials {
            username: "admin".to_string(),
            password_hash: hash_password(password),
            first_login: false,
        }
    }

    fn basic_header(username: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
    }

    #[test]
    fn hash_is_deterministic_lowercase_hex() {
        let first = hash_password("Valid123");
        let second = hash_password("Valid123");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(verify_password("Valid123", &first));
    }

    #[test]
    fn verify_is_case_insensitive_on_stored_hash() {
        let hash = hash_password("Valid123").to_uppercase();
        assert!(verify_password("Valid123", &hash));
    }

    #[test]
    fn known_digest_for_factory_password() {
        assert_eq!(
            hash_password("admin"),
            "8c6976e5b5410415bde908bd4dee15dfb167a9c873fc4bb8a81f6f2ab448a918"
        );
    }

    #[test]
    fn password_policy_reports_first_violated_rule() {
        assert_eq!(
            password_policy_error("short1A"),
            Some("Password must be at least 8 characters")
        );
        assert_eq!(
            password_policy_error("alllowercase1"),
            Some("Password must contain at least 1 uppercase letter")
        );
        assert_eq!(
            password_policy_error("ALLUPPER1"),
            Some("Password must contain at least 1 lowercase letter")
        );
        assert_eq!(
            password_policy_error("NoDigitsHere"),
            Some("Password must contain at least 1 digit")
        );
        assert_eq!(password_policy_error("Valid123"), None);
        assert!(is_password_strong("Valid123"));
    }

    #[test]
    fn accepts_correct_credential() {
        let credentials = make_credentials("Valid123");
        let header = basic_header("admin", "Valid123");
        assert!(check_basic_auth(Some(&header), &credentials));
    }

    #[test]
    fn missing_header_and_wrong_scheme_are_rejected() {
        let credentials = make_credentials("Valid123");
        assert!(!check_basic_auth(None, &credentials));
        assert!(!check_basic_auth(Some("Bearer token"), &credentials));
    }

    #[test]
    fn wrong_user_and_wrong_password_are_indistinguishable() {
        let credentials = make_credentials("Valid123");
        let wrong_user = basic_header("root", "Valid123");
        let wrong_password = basic_header("admin", "Wrong123");
        assert!(!check_basic_auth(Some(&wrong_user), &credentials));
        assert!(!check_basic_auth(Some(&wrong_password), &credentials));
    }

    #[test]
    fn payload_without_separator_is_rejected() {
        let credentials = make_credentials("Valid123");
        let header = format!("Basic {}", BASE64.encode("no-separator"));
        assert!(!check_basic_auth(Some(&header), &credentials));
    }

    #[test]
    fn oversized_payload_is_rejected_before_decoding() {
        let credentials = make_credentials("Valid123");
        let oversized = format!("Basic {}", BASE64.encode("a".repeat(512)));
        assert!(!check_basic_auth(Some(&oversized), &credentials));
    }

    #[tokio::test]
    async fn rejected_requests_carry_the_basic_challenge() {
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::get;
        use tower::ServiceExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let state = crate::state::testing::app_state(temp.path()).await;
        let app = Router::new()
            .route("/api/status", get(|| async { "ok" }))
            .layer(middleware::from_fn(auth_middleware))
            .layer(Extension(state));

        let wrong_password = Request::builder()
            .uri("/api/status")
            .header(header::AUTHORIZATION, basic_header("admin", "Wrong123"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(wrong_password).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            r#"Basic realm="dispenserd""#
        );

        let missing_header = Request::builder()
            .uri("/api/status")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(missing_header).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let valid = Request::builder()
            .uri("/api/status")
            .header(header::AUTHORIZATION, basic_header("admin", "admin"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(valid).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn change_password_persists_before_acknowledging() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = crate::state::testing::app_state(temp.path()).await;

        let body = Body::from(
            r#"{"current_password": "admin", "new_password": "Valid123"}"#,
        );
        change_password(Extension(state.clone()), body)
            .await
            .expect("change password");

        let stored = state
            .storage
            .read_file("/config.json")
            .await
            .expect("persisted document");
        let doc: crate::config::DeviceConfig =
            serde_json::from_slice(&stored).expect("parse document");
        assert_eq!(doc.web.password_hash, hash_password("Valid123"));
        assert!(!doc.web.first_login);

        let credentials = state.credentials.snapshot().await;
        assert!(verify_password("Valid123", &credentials.password_hash));
        assert!(!credentials.first_login);
    }

    #[tokio::test]
    async fn change_password_rejects_wrong_current_password() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = crate::state::testing::app_state(temp.path()).await;

        let body = Body::from(
            r#"{"current_password": "nope", "new_password": "Valid123"}"#,
        );
        let result = change_password(Extension(state.clone()), body).await;
        assert!(matches!(result, Err(ApiError::Unauthorized { .. })));

        // Nothing was persisted.
        assert!(!state.storage.exists("/config.json").await);
    }

    #[tokio::test]
    async fn change_password_enforces_the_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = crate::state::testing::app_state(temp.path()).await;

        let body = Body::from(
            r#"{"current_password": "admin", "new_password": "weak"}"#,
        );
        let result = change_password(Extension(state), body).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
