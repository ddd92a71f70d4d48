//! S3-compatible object storage (`s3`, `oss`, `cos`), signed with AWS Signature V4.
//!
//! Requests are header-signed with `UNSIGNED-PAYLOAD`; source links and upload credentials
//! are query-presigned. Listing parses the ListObjectsV2 XML reply.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tokio_util::io::{ReaderStream, StreamReader};

use super::{not_implemented, require, ByteStream, DeleteReport, Driver, DriverEnv, PutOptions, RawObject, SourceOptions, ThumbContent, TokenRequest, UploadCredential};
use crate::error::{AppError, AppResult};
use crate::models::{Policy, PolicyKind};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const DEFAULT_REGION: &str = "us-east-1";

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], msg: &str) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(msg.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String { hex::encode(Sha256::digest(data)) }

/// Percent-encode each segment of an object key, keeping `/`.
pub fn encode_key(key: &str) -> String { key.split('/').map(|s| urlencoding::encode(s).into_owned()).collect::<Vec<_>>().join("/") }

/// Credentials and scope for SigV4.
#[derive(Clone)]
pub struct SigV4 {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl SigV4 {
    pub fn new(access_key: &str, secret_key: &str, region: &str) -> Self {
        let region = if region.is_empty() { DEFAULT_REGION } else { region };
        Self { access_key: access_key.to_string(), secret_key: secret_key.to_string(), region: region.to_string(), service: "s3".to_string() }
    }

    fn scope(&self, date: &str) -> String { format!("{}/{}/{}/aws4_request", date, self.region, self.service) }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let k = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date);
        let k = hmac(&k, &self.region);
        let k = hmac(&k, &self.service);
        hmac(&k, "aws4_request")
    }

    fn signature(&self, canonical_request: &str, amz_date: &str) -> String {
        let date = &amz_date[..8];
        let to_sign = format!("{}\n{}\n{}\n{}", ALGORITHM, amz_date, self.scope(date), sha256_hex(canonical_request.as_bytes()));
        hex::encode(hmac(&self.signing_key(date), &to_sign))
    }

    fn canonical_query(params: &BTreeMap<String, String>) -> String {
        params.iter().map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))).collect::<Vec<_>>().join("&")
    }

    /// Query string (without `?`) that presigns `method uri` for `expires` seconds.
    pub fn presign(&self, method: &str, host: &str, uri: &str, mut params: BTreeMap<String, String>, expires: i64, now: DateTime<Utc>) -> String {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        params.insert("X-Amz-Algorithm".into(), ALGORITHM.into());
        params.insert("X-Amz-Credential".into(), format!("{}/{}", self.access_key, self.scope(&amz_date[..8])));
        params.insert("X-Amz-Date".into(), amz_date.clone());
        params.insert("X-Amz-Expires".into(), expires.to_string());
        params.insert("X-Amz-SignedHeaders".into(), "host".into());
        let query = Self::canonical_query(&params);
        let canonical = format!("{}\n{}\n{}\nhost:{}\n\nhost\n{}", method, uri, query, host, UNSIGNED_PAYLOAD);
        format!("{}&X-Amz-Signature={}", query, self.signature(&canonical, &amz_date))
    }

    /// Headers (`x-amz-date`, `x-amz-content-sha256`, `authorization`) for a header-signed request.
    pub fn sign_headers(&self, method: &str, host: &str, uri: &str, params: &BTreeMap<String, String>, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical = format!(
            "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            method,
            uri,
            Self::canonical_query(params),
            host,
            UNSIGNED_PAYLOAD,
            amz_date,
            signed_headers,
            UNSIGNED_PAYLOAD
        );
        let auth = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.access_key,
            self.scope(&amz_date[..8]),
            signed_headers,
            self.signature(&canonical, &amz_date)
        );
        vec![("x-amz-date", amz_date), ("x-amz-content-sha256", UNSIGNED_PAYLOAD.to_string()), ("authorization", auth)]
    }
}

/// Where a bucket lives: `scheme://host` plus an optional path-style bucket prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub origin: String,
    pub host: String,
    pub prefix: String,
}

impl Endpoint {
    pub fn for_policy(p: &Policy) -> AppResult<Self> {
        let region = if p.region.is_empty() { DEFAULT_REGION } else { p.region.as_str() };
        let (origin, prefix) = match p.kind {
            PolicyKind::S3 if p.server.is_empty() => (format!("https://{}.s3.{}.amazonaws.com", p.bucket_name, region), String::new()),
            PolicyKind::S3 => (p.server.trim_end_matches('/').to_string(), format!("/{}", p.bucket_name)),
            PolicyKind::Oss => (format!("https://{}.{}", p.bucket_name, strip_scheme(&p.server)), String::new()),
            PolicyKind::Cos => (p.server.trim_end_matches('/').to_string(), String::new()),
            other => return Err(AppError::internal_setting("unknown_policy_type", format!("{} is not an S3-compatible policy", other.as_str()))),
        };
        let host = strip_scheme(&origin).split('/').next().unwrap_or_default().to_string();
        Ok(Self { origin, host, prefix })
    }

    pub fn uri(&self, key: &str) -> String { format!("{}/{}", self.prefix, encode_key(key.trim_start_matches('/'))) }

    /// Bucket root; path-style buckets need a trailing slash for listing.
    fn bucket_uri(&self) -> String { if self.prefix.is_empty() { "/".to_string() } else { format!("{}/", self.prefix) } }
}

fn strip_scheme(s: &str) -> &str {
    let s = s.trim_end_matches('/');
    s.split_once("://").map(|(_, rest)| rest).unwrap_or(s)
}

static CONTENTS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<Contents>(.*?)</Contents>").unwrap_or_else(|_| unreachable!()));
static PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<CommonPrefixes>\s*<Prefix>(.*?)</Prefix>").unwrap_or_else(|_| unreachable!()));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<(Key|Size|LastModified)>(.*?)</(?:Key|Size|LastModified)>").unwrap_or_else(|_| unreachable!()));
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<NextContinuationToken>(.*?)</NextContinuationToken>").unwrap_or_else(|_| unreachable!()));

static ENTITY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|lt|gt|quot|apos|amp);").unwrap_or_else(|_| unreachable!()));

/// Decode named entities and numeric character references in one pass. A reference to an
/// invalid code point is left as written.
fn xml_unescape(s: &str) -> String {
    ENTITY_RE
        .replace_all(s, |c: &regex::Captures| {
            let entity = &c[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let num = &entity[1..];
                    let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => num.parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded.map(String::from).unwrap_or_else(|| c[0].to_string())
        })
        .into_owned()
}

/// One page of a ListObjectsV2 reply: objects, common prefixes, and the continuation token.
pub fn parse_list_page(xml: &str) -> (Vec<(String, u64, DateTime<Utc>)>, Vec<String>, Option<String>) {
    let mut objects = Vec::new();
    for c in CONTENTS_RE.captures_iter(xml) {
        let (mut key, mut size, mut modified) = (String::new(), 0u64, Utc::now());
        for t in TAG_RE.captures_iter(&c[1]) {
            match &t[1] {
                "Key" => key = xml_unescape(&t[2]),
                "Size" => size = t[2].trim().parse().unwrap_or(0),
                _ => modified = DateTime::parse_from_rfc3339(t[2].trim()).map(|d| d.with_timezone(&Utc)).unwrap_or(modified),
            }
        }
        objects.push((key, size, modified));
    }
    let prefixes = PREFIX_RE.captures_iter(xml).map(|c| xml_unescape(&c[1])).collect();
    let token = TOKEN_RE.captures(xml).map(|c| xml_unescape(&c[1]));
    (objects, prefixes, token)
}

pub struct S3Driver {
    policy: Policy,
    endpoint: Endpoint,
    signer: SigV4,
    env: DriverEnv,
}

impl S3Driver {
    pub fn new(policy: &Policy, env: &DriverEnv) -> AppResult<Self> {
        require("bucket_name", &policy.bucket_name, policy.kind)?;
        require("access_key", &policy.access_key, policy.kind)?;
        require("secret_key", &policy.secret_key, policy.kind)?;
        if policy.kind != PolicyKind::S3 { require("server", &policy.server, policy.kind)?; }
        Ok(Self {
            policy: policy.clone(),
            endpoint: Endpoint::for_policy(policy)?,
            signer: SigV4::new(&policy.access_key, &policy.secret_key, &policy.region),
            env: env.clone(),
        })
    }

    fn request(&self, method: Method, uri: &str, params: &BTreeMap<String, String>) -> AppResult<reqwest::RequestBuilder> {
        let mut headers = HeaderMap::new();
        for (name, value) in self.signer.sign_headers(method.as_str(), &self.endpoint.host, uri, params, Utc::now()) {
            let v = HeaderValue::from_str(&value).map_err(|e| AppError::encrypt("sigv4_header", e.to_string()))?;
            if name == "authorization" { headers.insert(AUTHORIZATION, v); } else { headers.insert(name, v); }
        }
        let query = SigV4::canonical_query(params);
        let url = if query.is_empty() { format!("{}{}", self.endpoint.origin, uri) } else { format!("{}{}?{}", self.endpoint.origin, uri, query) };
        Ok(self.env.http.request(method, url).headers(headers))
    }

    async fn check(resp: reqwest::Response, key: &str) -> AppResult<reqwest::Response> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(AppError::not_found("object_not_found", format!("'{}' not found in bucket", key))),
            StatusCode::FORBIDDEN => Err(AppError::credential_invalid("storage_forbidden", format!("bucket denied access to '{}'", key))),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(AppError::io("storage_request_failed", format!("{} for '{}': {}", s, key, body.chars().take(200).collect::<String>())))
            }
        }
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let resp = self.request(Method::HEAD, &self.endpoint.uri(key), &BTreeMap::new())?.send().await?;
        Ok(resp.status().is_success())
    }

    fn presigned_url(&self, method: &str, key: &str, params: BTreeMap<String, String>, ttl: i64) -> String {
        let uri = self.endpoint.uri(key);
        let q = self.signer.presign(method, &self.endpoint.host, &uri, params, ttl, Utc::now());
        format!("{}{}?{}", self.endpoint.origin, uri, q)
    }
}

#[async_trait]
impl Driver for S3Driver {
    fn kind(&self) -> PolicyKind { self.policy.kind }

    async fn get(&self, path: &str) -> AppResult<ByteStream> {
        let resp = self.request(Method::GET, &self.endpoint.uri(path), &BTreeMap::new())?.send().await?;
        let resp = Self::check(resp, path).await?;
        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn put(&self, stream: ByteStream, dst: &str, size: u64, opts: &PutOptions) -> AppResult<()> {
        if opts.disable_overwrite && self.exists(dst).await? {
            return Err(AppError::object_exist("object_exist", format!("'{}' already exists", dst)));
        }
        let mut req = self
            .request(Method::PUT, &self.endpoint.uri(dst), &BTreeMap::new())?
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(stream)));
        if let Some(mime) = &opts.mime_type { req = req.header(reqwest::header::CONTENT_TYPE, mime.as_str()); }
        Self::check(req.send().await?, dst).await?;
        Ok(())
    }

    async fn delete(&self, paths: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for p in paths {
            let res = match self.request(Method::DELETE, &self.endpoint.uri(p), &BTreeMap::new()) {
                Ok(req) => req.send().await.map_err(AppError::from),
                Err(e) => Err(e),
            };
            let outcome = match res {
                // S3 answers 204 for missing keys as well.
                Ok(resp) => Self::check(resp, p).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) | Err(AppError::NotFound { .. }) => {}
                Err(e) => {
                    report.failed.push(p.clone());
                    report.error = Some(e);
                }
            }
        }
        report
    }

    async fn thumb(&self, _path: &str) -> AppResult<ThumbContent> { Err(not_implemented(self.policy.kind, "thumb")) }

    async fn source(&self, path: &str, opts: &SourceOptions) -> AppResult<String> {
        if !self.policy.is_private && !opts.is_download {
            let base = if self.policy.base_url.is_empty() { self.endpoint.origin.as_str() } else { self.policy.base_url.trim_end_matches('/') };
            return Ok(format!("{}{}", base, self.endpoint.uri(path)));
        }
        let mut params = BTreeMap::new();
        if opts.is_download {
            let name = if opts.file_name.is_empty() { path.rsplit('/').next().unwrap_or(path) } else { opts.file_name.as_str() };
            params.insert("response-content-disposition".to_string(), format!("attachment; filename=\"{}\"", urlencoding::encode(name)));
        }
        // Presigned URLs are bounded to seven days.
        let ttl = if opts.ttl > 0 { opts.ttl.min(604_800) } else { 604_800 };
        Ok(self.presigned_url("GET", path, params, ttl))
    }

    async fn token(&self, req: &TokenRequest) -> AppResult<UploadCredential> {
        let ttl = if req.ttl > 0 { req.ttl.min(604_800) } else { self.env.settings.upload_credential_timeout as i64 };
        let url = self.presigned_url("PUT", &req.save_path, BTreeMap::new(), ttl);
        let site = self.env.settings.site_url.trim_end_matches('/');
        Ok(UploadCredential {
            token: url.clone(),
            path: req.save_path.clone(),
            ak: self.policy.access_key.clone(),
            callback: format!("{}/api/v3/callback/storage/{}", site, req.callback_key),
            key: req.callback_key.clone(),
            upload_url: url,
            ..Default::default()
        })
    }

    async fn list(&self, path: &str, recursive: bool) -> AppResult<Vec<RawObject>> {
        let base = path.trim_matches('/');
        let prefix = if base.is_empty() { String::new() } else { format!("{}/", base) };
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut params = BTreeMap::new();
            params.insert("list-type".to_string(), "2".to_string());
            params.insert("prefix".to_string(), prefix.clone());
            if !recursive { params.insert("delimiter".to_string(), "/".to_string()); }
            if let Some(t) = &token { params.insert("continuation-token".to_string(), t.clone()); }
            let resp = self.request(Method::GET, &self.endpoint.bucket_uri(), &params)?.send().await?;
            let xml = Self::check(resp, &prefix).await?.text().await?;
            let (objects, prefixes, next) = parse_list_page(&xml);
            for (key, size, modified) in objects {
                let rel = key.trim_start_matches(prefix.as_str());
                if rel.is_empty() { continue; }
                let (dir, name) = rel.rsplit_once('/').unwrap_or(("", rel));
                out.push(RawObject { name: name.to_string(), relative_path: dir.to_string(), source: key.clone(), size, is_dir: false, last_modify: modified });
            }
            for p in prefixes {
                let rel = p.trim_start_matches(prefix.as_str()).trim_end_matches('/');
                out.push(RawObject { name: rel.to_string(), relative_path: String::new(), source: p.clone(), size: 0, is_dir: true, last_modify: Utc::now() });
            }
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "s3_tests.rs"]
mod s3_tests;
