//! Vendor account login and on-disk token persistence.
//!
//! The login endpoint is form-encoded and prefixes its JSON body with a
//! `&&&START&&&` guard string. Tokens are cached in a small JSON file so
//! restarts reuse the session; a stale cache just fails the first request
//! and the renew path logs in again.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Guard prefix the account endpoint puts before its JSON body.
const BODY_GUARD: &str = "&&&START&&&";

/// Service identifier for the speaker API.
const SERVICE_SID: &str = "micoapi";

/// Tokens returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "serviceToken")]
    pub service_token: String,
}

/// JSON cache of [`AuthTokens`] at a fixed path.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load cached tokens. Missing or unreadable files count as a cache
    /// miss, not an error; the caller falls back to a fresh login.
    pub fn load(&self) -> Option<AuthTokens> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("token cache unreadable at {}: {e}", self.path.display());
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                warn!("token cache corrupt at {}: {e}", self.path.display());
                None
            }
        }
    }

    /// Persist tokens, creating parent directories as needed.
    pub fn save(&self, tokens: &AuthTokens) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(tokens)
            .map_err(|e| BridgeError::Auth(format!("token serialization: {e}")))?;
        fs::write(&self.path, json)?;
        debug!("token cache written to {}", self.path.display());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    #[serde(default)]
    code: i64,
    #[serde(rename = "userId", default)]
    user_id: Option<serde_json::Value>,
    #[serde(rename = "serviceToken", default)]
    service_token: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Log in with account credentials and return session tokens.
pub async fn login(
    http: &reqwest::Client,
    account_url: &str,
    account: &str,
    password: &str,
) -> Result<AuthTokens> {
    let url = format!("{account_url}/pass/serviceLoginAuth2");
    let hash = password_hash(password);
    let form = [
        ("user", account),
        ("hash", hash.as_str()),
        ("sid", SERVICE_SID),
        ("_json", "true"),
    ];

    let response = http
        .post(&url)
        .form(&form)
        .send()
        .await
        .map_err(|e| BridgeError::Auth(format!("login request: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(BridgeError::Auth(format!("login HTTP {status}")));
    }

    let body = response
        .text()
        .await
        .map_err(|e| BridgeError::Auth(format!("login body: {e}")))?;
    let json = body.strip_prefix(BODY_GUARD).unwrap_or(&body);
    let reply: LoginReply = serde_json::from_str(json)
        .map_err(|e| BridgeError::Auth(format!("login reply malformed: {e}")))?;

    if reply.code != 0 {
        let detail = reply.description.unwrap_or_else(|| "unknown".into());
        return Err(BridgeError::Auth(format!(
            "login rejected (code {}): {detail}",
            reply.code
        )));
    }
    let user_id = reply
        .user_id
        .as_ref()
        .and_then(value_to_string)
        .ok_or_else(|| BridgeError::Auth("login reply missing userId".into()))?;
    let service_token = reply
        .service_token
        .ok_or_else(|| BridgeError::Auth("login reply missing serviceToken".into()))?;

    debug!("login succeeded for user {user_id}");
    Ok(AuthTokens {
        user_id,
        service_token,
    })
}

/// Hex digest of the account password, as the login endpoint expects.
fn password_hash(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{b:02X}")).collect()
}

/// The endpoint serves `userId` as either a number or a string.
fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
