//! HMAC-SHA256 signing primitive.
//!
//! A signature is `base64url(HMAC(secret, canonical + ":" + expires)) + ":" + expires`.
//! `expires` is unix seconds; `0` never expires. Verification recomputes the MAC and
//! compares in constant time.

use std::borrow::Cow;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    #[error("signature expired")]
    Expired,
    #[error("signature malformed")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
    #[error("request timestamp outside the replay window")]
    Stale,
}

impl From<SignError> for AppError {
    fn from(e: SignError) -> Self {
        match e {
            SignError::Expired => AppError::sign_expired("sign_expired", e.to_string()),
            _ => AppError::credential_invalid("credential_invalid", e.to_string()),
        }
    }
}

/// Deterministic canonical form of the signed fields.
#[derive(Serialize)]
struct Canonical<'a> {
    path: &'a str,
    policy: &'a str,
    body: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

pub fn canonical(path: &str, policy: &str, body: &[u8], timestamp: Option<i64>) -> String {
    let c = Canonical { path, policy, body: String::from_utf8_lossy(body), timestamp };
    // Serializing borrowed strings and an integer cannot fail.
    serde_json::to_string(&c).unwrap_or_default()
}

#[derive(Clone)]
pub struct HmacAuth {
    secret: Arc<[u8]>,
}

impl std::fmt::Debug for HmacAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacAuth").field("secret", &"<redacted>").finish()
    }
}

pub fn now_unix() -> i64 { chrono::Utc::now().timestamp() }

impl HmacAuth {
    pub fn new(secret: impl AsRef<[u8]>) -> Self { Self { secret: Arc::from(secret.as_ref()) } }

    fn mac(&self, body: &str, expires: i64) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret).unwrap_or_else(|_| unreachable!());
        mac.update(body.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    /// The bare base64 digest, as carried in the `sign` query parameter.
    pub fn digest(&self, body: &str, expires: i64) -> String {
        URL_SAFE.encode(self.mac(body, expires).finalize().into_bytes())
    }

    /// Full `digest:expires` token, as carried in the `Authorization` header.
    pub fn sign(&self, body: &str, expires: i64) -> String {
        format!("{}:{}", self.digest(body, expires), expires)
    }

    pub fn check(&self, body: &str, sign: &str) -> Result<(), SignError> { self.check_at(body, sign, now_unix()) }

    pub fn check_at(&self, body: &str, sign: &str, now: i64) -> Result<(), SignError> {
        let (digest, exp) = sign.rsplit_once(':').ok_or(SignError::Malformed)?;
        let expires = exp.parse::<i64>().map_err(|_| SignError::Malformed)?;
        self.verify_digest_at(body, digest, expires, now)
    }

    pub fn verify_digest_at(&self, body: &str, digest: &str, expires: i64, now: i64) -> Result<(), SignError> {
        if expires != 0 && now > expires { return Err(SignError::Expired); }
        let raw = URL_SAFE.decode(digest.as_bytes()).map_err(|_| SignError::Malformed)?;
        self.mac(body, expires).verify_slice(&raw).map_err(|_| SignError::Mismatch)
    }
}

/// `sign(secret, path, policy, body, expires)` over the canonical form.
pub fn sign_fields(auth: &HmacAuth, path: &str, policy: &str, body: &[u8], expires: i64) -> String {
    auth.sign(&canonical(path, policy, body, None), expires)
}

pub fn verify_fields_at(auth: &HmacAuth, path: &str, policy: &str, body: &[u8], sign: &str, now: i64) -> Result<(), SignError> {
    auth.check_at(&canonical(path, policy, body, None), sign, now)
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod signature_tests;
