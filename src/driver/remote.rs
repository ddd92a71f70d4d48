//! Slave proxy backend: every raw operation becomes one signed HTTP request against a
//! slave node's `/api/v3/slave` surface.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use futures_util::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::io::{ReaderStream, StreamReader};

use super::{require, ByteStream, DeleteReport, Driver, DriverEnv, PutOptions, RawObject, SourceOptions, ThumbContent, TokenRequest, UploadCredential};
use crate::auth::request::{FILENAME_HEADER, OVERWRITE_HEADER, POLICY_HEADER};
use crate::auth::{now_unix, sign_policy_token, sign_request, sign_url, HmacAuth};
use crate::error::{AppError, AppResult};
use crate::models::{Policy, PolicyKind};

pub const SLAVE_PREFIX: &str = "/api/v3/slave";
/// Envelope code a slave returns when a batch only partially succeeded.
pub const CODE_NOT_FULLY_SUCCESSFUL: i32 = 203;
const GET_ATTEMPTS: usize = 3;

/// Constraints a slave enforces on an incoming upload, carried base64-encoded in `X-Policy`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    /// Directory on the slave, already expanded by the master.
    pub save_path: String,
    /// File name rule, applied only with `auto_rename`.
    pub file_name: String,
    pub auto_rename: bool,
    pub max_size: u64,
    pub allowed_extension: Vec<String>,
    /// Where the slave reports a finished client-direct upload. Empty for master-driven puts.
    pub callback_url: String,
}

impl UploadPolicy {
    pub fn encode(&self) -> AppResult<String> { Ok(STANDARD.encode(serde_json::to_vec(self)?)) }

    pub fn decode(raw: &str) -> AppResult<Self> {
        let bytes = STANDARD.decode(raw.trim()).map_err(|e| AppError::credential_invalid("invalid_upload_policy", e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| AppError::credential_invalid("invalid_upload_policy", e.to_string()))
    }
}

/// JSON envelope shared by master and slave responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub code: i32,
    pub data: JsonValue,
    pub msg: String,
}

impl Envelope {
    pub fn ok(data: JsonValue) -> Self { Self { code: 0, data, msg: String::new() } }

    fn into_result(self) -> AppResult<JsonValue> {
        if self.code == 0 { return Ok(self.data); }
        Err(error_from_envelope(&self))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRequest {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

/// Signed transport to one slave node.
#[derive(Clone)]
pub struct SlaveClient {
    base: String,
    auth: HmacAuth,
    http: reqwest::Client,
    timeout: Duration,
}

impl SlaveClient {
    pub fn new(server: &str, secret: &str, http: reqwest::Client, timeout: Duration) -> Self {
        Self { base: server.trim_end_matches('/').to_string(), auth: HmacAuth::new(secret), http, timeout }
    }

    pub fn route_path(route: &str) -> String { format!("{}/{}", SLAVE_PREFIX, route.trim_start_matches('/')) }

    pub fn url(&self, route: &str) -> String { format!("{}{}", self.base, Self::route_path(route)) }

    fn signed(&self, method: Method, route: &str, mut headers: HeaderMap, body: &[u8]) -> reqwest::RequestBuilder {
        sign_request(&self.auth, &Self::route_path(route), &mut headers, body, 0);
        self.http.request(method, self.url(route)).headers(headers).timeout(self.timeout)
    }

    async fn decode(resp: reqwest::Response) -> AppResult<Envelope> {
        let status = resp.status();
        let text = resp.text().await?;
        serde_json::from_str::<Envelope>(&text).map_err(|_| AppError::io("slave_bad_response", format!("slave replied {} with an unreadable body", status)))
    }

    /// POST a JSON body and decode the envelope.
    pub async fn post_json<T: Serialize + ?Sized>(&self, route: &str, body: &T) -> AppResult<Envelope> {
        let body = serde_json::to_vec(body)?;
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let resp = self.signed(Method::POST, route, headers, &body).body(body).send().await?;
        Self::decode(resp).await
    }

    pub async fn ping(&self) -> AppResult<JsonValue> { self.post_json("ping", &serde_json::json!({})).await?.into_result() }

    pub async fn upload(&self, stream: ByteStream, size: u64, name: &str, policy: &UploadPolicy, overwrite: bool) -> AppResult<()> {
        let mut headers = HeaderMap::new();
        headers.insert(POLICY_HEADER, header(&policy.encode()?)?);
        headers.insert(FILENAME_HEADER, header(&urlencoding::encode(name))?);
        headers.insert(OVERWRITE_HEADER, HeaderValue::from_static(if overwrite { "true" } else { "false" }));
        headers.insert(CONTENT_LENGTH, header(&size.to_string())?);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(stream));
        // Streams of unknown duration are not bound by the API timeout.
        sign_request(&self.auth, &Self::route_path("upload"), &mut headers, b"", 0);
        let resp = self.http.post(self.url("upload")).headers(headers).body(body).send().await?;
        let env = Self::decode(resp).await?;
        if env.code == 0 { return Ok(()); }
        Err(error_from_envelope(&env))
    }

    pub async fn delete(&self, files: &[String]) -> AppResult<Envelope> { self.post_json("delete", &DeleteRequest { files: files.to_vec() }).await }

    pub async fn list(&self, path: &str, recursive: bool) -> AppResult<Vec<RawObject>> {
        let data = self.post_json("list", &ListRequest { path: path.to_string(), recursive }).await?.into_result()?;
        Ok(serde_json::from_value(data)?)
    }

    /// Signed URL for a GET route; the signature covers the path only.
    pub fn signed_url(&self, route: &str, ttl: i64) -> String {
        let expires = if ttl > 0 { now_unix() + ttl } else { 0 };
        sign_url(&self.auth, &self.url(route), expires)
    }

    /// GETs are idempotent and retried on transport errors and 5xx replies.
    pub async fn get_with_retry(&self, url: &str) -> AppResult<reqwest::Response> {
        let mut last = None;
        for attempt in 0..GET_ATTEMPTS {
            match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    last = Some(AppError::io("slave_unavailable", format!("slave replied {}", resp.status())));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => last = Some(e.into()),
            }
            tracing::debug!(attempt, url = %url, "slave_get_retry");
            tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
        }
        Err(last.unwrap_or_else(|| AppError::io("slave_unavailable", "slave did not answer")))
    }

    pub fn auth(&self) -> &HmacAuth { &self.auth }
}

fn header(v: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(v).map_err(|e| AppError::upload_failed("invalid_header", e.to_string()))
}

/// Rebuild a typed error from a slave envelope using the shared wire codes.
pub fn error_from_envelope(env: &Envelope) -> AppError {
    let msg = env.msg.clone();
    match env.code {
        404 => AppError::not_found("slave_not_found", msg),
        40001 => AppError::credential_invalid("slave_credential_invalid", msg),
        40002 => AppError::upload_failed("slave_upload_failed", msg),
        40004 => AppError::object_exist("slave_object_exist", msg),
        40005 => AppError::sign_expired("slave_sign_expired", msg),
        40006 => AppError::policy_not_allowed("slave_policy_not_allowed", msg),
        _ => AppError::io("slave_error", format!("slave returned {}: {}", env.code, msg)),
    }
}

async fn into_stream(resp: reqwest::Response) -> AppResult<ByteStream> {
    match resp.status() {
        s if s.is_success() => {}
        StatusCode::NOT_FOUND => return Err(AppError::not_found("object_not_found", "object not found on slave")),
        _ => {
            let env = SlaveClient::decode(resp).await?;
            return Err(error_from_envelope(&env));
        }
    }
    let stream = resp.bytes_stream().map_err(std::io::Error::other);
    Ok(Box::new(StreamReader::new(Box::pin(stream))))
}

pub struct RemoteDriver {
    policy: Policy,
    client: SlaveClient,
    env: DriverEnv,
}

impl RemoteDriver {
    pub fn new(policy: &Policy, env: &DriverEnv) -> AppResult<Self> {
        require("server", &policy.server, PolicyKind::Remote)?;
        require("secret_key", &policy.secret_key, PolicyKind::Remote)?;
        let timeout = Duration::from_secs(env.settings.slave_api_timeout.max(1));
        let client = SlaveClient::new(&policy.server, &policy.secret_key, env.http.clone(), timeout);
        Ok(Self { policy: policy.clone(), client, env: env.clone() })
    }

    pub fn client(&self) -> &SlaveClient { &self.client }

    fn delivery_route(kind: &str, speed: u64, path: &str, name: &str) -> String {
        format!("{}/{}/{}/{}", kind, speed, URL_SAFE.encode(path), urlencoding::encode(name))
    }
}

#[async_trait]
impl Driver for RemoteDriver {
    fn kind(&self) -> PolicyKind { PolicyKind::Remote }

    async fn get(&self, path: &str) -> AppResult<ByteStream> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let url = self.client.signed_url(&Self::delivery_route("download", 0, path, name), 60);
        let resp = self.client.get_with_retry(&url).await?;
        into_stream(resp).await
    }

    async fn put(&self, stream: ByteStream, dst: &str, size: u64, opts: &PutOptions) -> AppResult<()> {
        let (dir, name) = match dst.rsplit_once('/') {
            Some((d, n)) => (d.to_string(), n.to_string()),
            None => (String::new(), dst.to_string()),
        };
        let policy = UploadPolicy { save_path: dir, max_size: self.policy.max_size, ..Default::default() };
        self.client.upload(stream, size, &name, &policy, !opts.disable_overwrite).await
    }

    async fn delete(&self, paths: &[String]) -> DeleteReport {
        match self.client.delete(paths).await {
            Ok(env) if env.code == 0 => DeleteReport::default(),
            Ok(env) if env.code == CODE_NOT_FULLY_SUCCESSFUL => {
                let failed = serde_json::from_value::<DeleteRequest>(env.data.clone()).map(|d| d.files).unwrap_or_else(|_| paths.to_vec());
                DeleteReport { failed, error: Some(AppError::io("slave_delete_partial", env.msg)) }
            }
            Ok(env) => DeleteReport::all_failed(paths, error_from_envelope(&env)),
            Err(e) => DeleteReport::all_failed(paths, e),
        }
    }

    async fn thumb(&self, path: &str) -> AppResult<ThumbContent> {
        let route = format!("thumb/{}", URL_SAFE.encode(path));
        Ok(ThumbContent::Redirect(self.client.signed_url(&route, self.env.settings.preview_timeout as i64)))
    }

    async fn source(&self, path: &str, opts: &SourceOptions) -> AppResult<String> {
        let kind = if opts.is_download { "download" } else { "source" };
        let name = if opts.file_name.is_empty() { path.rsplit('/').next().unwrap_or(path) } else { opts.file_name.as_str() };
        Ok(self.client.signed_url(&Self::delivery_route(kind, opts.speed, path, name), opts.ttl))
    }

    async fn token(&self, req: &TokenRequest) -> AppResult<UploadCredential> {
        let site = self.env.settings.site_url.trim_end_matches('/');
        let callback = format!("{}/api/v3/callback/remote/{}", site, req.callback_key);
        let upload_policy = UploadPolicy {
            save_path: req.save_path.clone(),
            file_name: self.policy.file_name_rule.clone(),
            auto_rename: self.policy.auto_rename,
            max_size: self.policy.max_size,
            allowed_extension: self.policy.allowed_extensions.clone(),
            callback_url: callback.clone(),
        };
        let encoded = upload_policy.encode()?;
        let ttl = if req.ttl > 0 { req.ttl } else { self.env.settings.upload_credential_timeout as i64 };
        let token = sign_policy_token(self.client.auth(), &SlaveClient::route_path("upload"), &encoded, now_unix() + ttl);
        Ok(UploadCredential {
            token,
            policy: encoded,
            path: req.save_path.clone(),
            callback,
            key: req.callback_key.clone(),
            upload_url: self.policy.upload_url(),
            ..Default::default()
        })
    }

    async fn list(&self, path: &str, recursive: bool) -> AppResult<Vec<RawObject>> { self.client.list(path, recursive).await }
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod remote_tests;
