//! Signed URLs and signed HTTP requests built on [`HmacAuth`].
//!
//! URLs carry `sign` and `expires` query parameters over the URL path. Requests carry
//! `Authorization: Bearer <digest:expires>` plus an `X-Cumulus-Timestamp` header that is part of
//! the signed canonical form, so a captured request stops verifying once its timestamp
//! leaves the replay window even when the signature itself never expires.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use super::signature::{canonical, now_unix, HmacAuth, SignError};

pub const TIMESTAMP_HEADER: &str = "X-Cumulus-Timestamp";
pub const POLICY_HEADER: &str = "X-Policy";
pub const FILENAME_HEADER: &str = "X-FileName";
pub const OVERWRITE_HEADER: &str = "X-Overwrite";

/// Headers that are signed alongside `X-Policy` when it is present.
const META_HEADERS: [&str; 3] = [FILENAME_HEADER, OVERWRITE_HEADER, "Content-Length"];

/// Append `sign`/`expires` to `url`. Only the path component is signed.
pub fn sign_url(auth: &HmacAuth, url: &str, expires: i64) -> String {
    let path = url_path(url);
    let digest = auth.digest(&canonical(path, "", b"", None), expires);
    let sep = if url.contains('?') { '&' } else { '?' };
    let mut out = format!("{}{}sign={}", url, sep, urlencoding::encode(&digest));
    if expires != 0 { out.push_str(&format!("&expires={}", expires)); }
    out
}

pub fn check_url_at(auth: &HmacAuth, path: &str, sign: &str, expires: Option<i64>, now: i64) -> Result<(), SignError> {
    auth.verify_digest_at(&canonical(path, "", b"", None), sign, expires.unwrap_or(0), now)
}

pub fn check_url(auth: &HmacAuth, path: &str, sign: &str, expires: Option<i64>) -> Result<(), SignError> {
    check_url_at(auth, path, sign, expires, now_unix())
}

pub(crate) fn url_path(url: &str) -> &str {
    let no_query = url.split_once('?').map(|(p, _)| p).unwrap_or(url);
    match no_query.find("://") {
        Some(i) => {
            let rest = &no_query[i + 3..];
            rest.find('/').map(|j| &rest[j..]).unwrap_or("/")
        }
        None => no_query,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn request_canonical(path: &str, headers: &HeaderMap, body: &[u8], timestamp: i64) -> String {
    let policy = header_str(headers, POLICY_HEADER);
    if policy.is_empty() {
        canonical(path, "", body, Some(timestamp))
    } else {
        let meta = META_HEADERS.iter().map(|h| header_str(headers, h)).collect::<Vec<_>>().join("\n");
        canonical(path, policy, meta.as_bytes(), Some(timestamp))
    }
}

/// Sign an outgoing request in place. `ttl == 0` produces a non-expiring signature that
/// is still bounded by the timestamp replay window on the receiving side.
pub fn sign_request(auth: &HmacAuth, path: &str, headers: &mut HeaderMap, body: &[u8], ttl: i64) {
    let now = now_unix();
    let expires = if ttl > 0 { now + ttl } else { 0 };
    if let Ok(v) = HeaderValue::from_str(&now.to_string()) { headers.insert(TIMESTAMP_HEADER, v); }
    let sig = auth.sign(&request_canonical(path, headers, body, now), expires);
    if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", sig)) { headers.insert(AUTHORIZATION, v); }
}

pub fn check_request_at(auth: &HmacAuth, path: &str, headers: &HeaderMap, body: &[u8], replay_window: i64, now: i64) -> Result<(), SignError> {
    let token = header_str(headers, AUTHORIZATION.as_str()).strip_prefix("Bearer ").ok_or(SignError::Malformed)?;
    let ts = header_str(headers, TIMESTAMP_HEADER).parse::<i64>().map_err(|_| SignError::Malformed)?;
    if now.abs_diff(ts) > replay_window.unsigned_abs() { return Err(SignError::Stale); }
    auth.check_at(&request_canonical(path, headers, body, ts), token, now)
}

pub fn check_request(auth: &HmacAuth, path: &str, headers: &HeaderMap, body: &[u8], replay_window: i64) -> Result<(), SignError> {
    check_request_at(auth, path, headers, body, replay_window, now_unix())
}

/// Token handed to a client for a direct upload to a slave. It covers the upload path and
/// the `X-Policy` value, and always expires.
pub fn sign_policy_token(auth: &HmacAuth, path: &str, policy: &str, expires: i64) -> String {
    auth.sign(&canonical(path, policy, b"", None), expires)
}

pub fn check_policy_token_at(auth: &HmacAuth, path: &str, headers: &HeaderMap, now: i64) -> Result<(), SignError> {
    let token = header_str(headers, AUTHORIZATION.as_str()).strip_prefix("Bearer ").ok_or(SignError::Malformed)?;
    let (_, exp) = token.rsplit_once(':').ok_or(SignError::Malformed)?;
    if exp.parse::<i64>().map_err(|_| SignError::Malformed)? == 0 { return Err(SignError::Malformed); }
    auth.check_at(&canonical(path, header_str(headers, POLICY_HEADER), b"", None), token, now)
}

/// Uploads arrive either from a master (timestamped request signature) or from a client
/// holding a policy token.
pub fn check_upload_at(auth: &HmacAuth, path: &str, headers: &HeaderMap, replay_window: i64, now: i64) -> Result<(), SignError> {
    if headers.contains_key(TIMESTAMP_HEADER) {
        check_request_at(auth, path, headers, b"", replay_window, now)
    } else {
        check_policy_token_at(auth, path, headers, now)
    }
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod request_tests;
