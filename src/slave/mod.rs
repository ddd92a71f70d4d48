//! Slave node HTTP surface under `/api/v3/slave`.
//!
//! A slave keeps no sessions: every request is authenticated by its signature alone. POST
//! routes carry a timestamped request signature; GET delivery routes carry a signed URL.
//! Uploads run through the same pipeline as the master, bound to local disk.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use futures_util::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::auth::request::{FILENAME_HEADER, OVERWRITE_HEADER, POLICY_HEADER};
use crate::auth::{check_request, check_upload_at, check_url, now_unix, HmacAuth};
use crate::driver::remote::{DeleteRequest, Envelope, ListRequest, UploadPolicy, CODE_NOT_FULLY_SUCCESSFUL, SLAVE_PREFIX};
use crate::driver::{ByteStream, Driver, ThumbContent};
use crate::error::{AppError, AppResult};
use crate::filesystem::validator::normalize_name;
use crate::filesystem::{FileHeader, FileSystem, UploadOptions};
use crate::models::{Policy, PolicyKind};
use crate::services::Services;
use crate::util::join;

#[derive(Clone)]
pub struct SlaveState {
    pub services: Services,
    pub auth: HmacAuth,
    /// Seconds of clock skew tolerated on signed requests.
    pub replay_window: i64,
}

impl SlaveState {
    pub fn new(services: Services) -> Self {
        let auth = HmacAuth::new(&services.slave.secret);
        let replay_window = services.slave.replay_window as i64;
        Self { services, auth, replay_window }
    }

    /// Policy every slave-side operation runs under.
    fn local_policy(&self) -> Policy { Policy::new(0, "slave", PolicyKind::Local) }

    fn driver(&self) -> AppResult<std::sync::Arc<dyn Driver>> { self.services.resolve_driver(&self.local_policy()) }

    fn check_body(&self, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
        check_request(&self.auth, uri.path(), headers, body, self.replay_window)?;
        Ok(())
    }
}

pub fn router(state: SlaveState) -> Router {
    Router::new()
        .route(&format!("{}/ping", SLAVE_PREFIX), post(ping))
        .route(&format!("{}/upload", SLAVE_PREFIX), post(upload))
        .route(&format!("{}/delete", SLAVE_PREFIX), post(delete))
        .route(&format!("{}/list", SLAVE_PREFIX), post(list))
        .route(&format!("{}/download/{{speed}}/{{path}}/{{name}}", SLAVE_PREFIX), get(download))
        .route(&format!("{}/source/{{speed}}/{{path}}/{{name}}", SLAVE_PREFIX), get(source))
        .route(&format!("{}/thumb/{{path}}", SLAVE_PREFIX), get(thumb))
        .with_state(state)
}

pub(crate) fn ok(data: JsonValue) -> Response { (StatusCode::OK, Json(Envelope::ok(data))).into_response() }

pub(crate) fn fail(e: AppError) -> Response {
    if e.is_auth_rejection() {
        tracing::debug!(error = %e, "slave_request_rejected");
    } else {
        tracing::warn!(error = %e, "slave_request_failed");
    }
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(Envelope { code: e.code_num(), data: JsonValue::Null, msg: e.message().to_string() })).into_response()
}

fn reply(result: AppResult<JsonValue>) -> Response {
    match result {
        Ok(v) => ok(v),
        Err(e) => fail(e),
    }
}

async fn ping(State(state): State<SlaveState>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    reply(state.check_body(&uri, &headers, &body).map(|_| serde_json::json!({ "version": env!("CARGO_PKG_VERSION") })))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str { headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("") }

async fn upload(State(state): State<SlaveState>, uri: Uri, headers: HeaderMap, body: Body) -> Response {
    reply(handle_upload(&state, &uri, &headers, body).await.map(|_| JsonValue::Null))
}

async fn handle_upload(state: &SlaveState, uri: &Uri, headers: &HeaderMap, body: Body) -> AppResult<()> {
    check_upload_at(&state.auth, uri.path(), headers, state.replay_window, now_unix())?;
    let upload_policy = UploadPolicy::decode(header_str(headers, POLICY_HEADER))?;
    let name = urlencoding::decode(header_str(headers, FILENAME_HEADER))
        .map_err(|e| AppError::upload_failed("invalid_file_name", e.to_string()))?;
    // The stored object and the callback report must carry the same name.
    let name = normalize_name(&name);
    let size = header_str(headers, header::CONTENT_LENGTH.as_str())
        .parse::<u64>()
        .map_err(|_| AppError::upload_failed("missing_content_length", "upload requires Content-Length"))?;
    let overwrite = header_str(headers, OVERWRITE_HEADER) == "true";

    let policy = Policy {
        max_size: upload_policy.max_size,
        allowed_extensions: upload_policy.allowed_extension.clone(),
        auto_rename: upload_policy.auto_rename,
        file_name_rule: upload_policy.file_name.clone(),
        ..state.local_policy()
    };
    let mut fs = FileSystem::new_for_slave(&state.services, policy)?;
    let save_path = join(&upload_policy.save_path, &fs.policy.generate_file_name(0, &name)).trim_start_matches('/').to_string();
    let callback_url = Some(upload_policy.callback_url.clone()).filter(|u| !u.is_empty());
    let virtual_path = format!("/{}", upload_policy.save_path.trim_start_matches('/'));
    fs.use_slave_upload_stack(upload_policy);

    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let stream: ByteStream = Box::new(StreamReader::new(Box::pin(stream)));
    let file = FileHeader { stream, mime_type: header_str(headers, header::CONTENT_TYPE.as_str()).to_string(), size, name, virtual_path };
    let options = UploadOptions { disable_overwrite: !overwrite, callback_url, save_path: Some(save_path), ..Default::default() };
    fs.upload(file, options).await?;
    Ok(())
}

async fn delete(State(state): State<SlaveState>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = state.check_body(&uri, &headers, &body) { return fail(e); }
    let req: DeleteRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return fail(e.into()),
    };
    let driver = match state.driver() {
        Ok(d) => d,
        Err(e) => return fail(e),
    };
    let report = driver.delete(&req.files).await;
    if report.failed.is_empty() {
        return ok(JsonValue::Null);
    }
    let msg = report.error.map(|e| e.to_string()).unwrap_or_default();
    tracing::warn!(failed = report.failed.len(), "slave_delete_partial");
    let data = serde_json::to_value(DeleteRequest { files: report.failed }).unwrap_or_default();
    (StatusCode::OK, Json(Envelope { code: CODE_NOT_FULLY_SUCCESSFUL, data, msg })).into_response()
}

async fn list(State(state): State<SlaveState>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let result = async {
        state.check_body(&uri, &headers, &body)?;
        let req: ListRequest = serde_json::from_slice(&body)?;
        let objects = state.driver()?.list(&req.path, req.recursive).await?;
        Ok::<_, AppError>(serde_json::to_value(objects)?)
    };
    reply(result.await)
}

#[derive(Debug, Deserialize)]
pub(crate) struct SignQuery {
    #[serde(default)]
    pub sign: String,
    pub expires: Option<i64>,
}

fn decode_path(raw: &str) -> AppResult<String> {
    let bytes = URL_SAFE.decode(raw).map_err(|e| AppError::not_found("object_not_found", e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| AppError::not_found("object_not_found", e.to_string()))
}

/// Stream out, sleeping after each chunk so the rate stays near `speed` bytes/s.
fn throttled(stream: ByteStream, speed: u64) -> Body {
    if speed == 0 {
        return Body::from_stream(ReaderStream::new(stream));
    }
    let chunks = ReaderStream::with_capacity(stream, speed.clamp(1024, 64 * 1024) as usize);
    Body::from_stream(chunks.then(move |chunk| async move {
        if let Ok(bytes) = &chunk {
            tokio::time::sleep(Duration::from_millis(bytes.len() as u64 * 1000 / speed)).await;
        }
        chunk
    }))
}

async fn deliver(state: &SlaveState, uri: &Uri, q: &SignQuery, speed: u64, path: &str, name: &str, attachment: bool) -> AppResult<Response> {
    check_url(&state.auth, uri.path(), &q.sign, q.expires)?;
    let path = decode_path(path)?;
    let stream = state.driver()?.get(&path).await?;
    Ok(file_response(stream, speed, name, attachment))
}

/// Octet-stream response; `attachment` makes browsers save it as `name`.
pub(crate) fn file_response(stream: ByteStream, speed: u64, name: &str, attachment: bool) -> Response {
    let mut resp = Response::new(throttled(stream, speed));
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    if attachment {
        let encoded = urlencoding::encode(name);
        let value = format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", encoded, encoded);
        if let Ok(v) = HeaderValue::from_str(&value) { headers.insert(header::CONTENT_DISPOSITION, v); }
    }
    resp
}

async fn download(State(state): State<SlaveState>, uri: Uri, Path((speed, path, name)): Path<(u64, String, String)>, Query(q): Query<SignQuery>) -> Response {
    deliver(&state, &uri, &q, speed, &path, &name, true).await.unwrap_or_else(fail)
}

async fn source(State(state): State<SlaveState>, uri: Uri, Path((speed, path, name)): Path<(u64, String, String)>, Query(q): Query<SignQuery>) -> Response {
    deliver(&state, &uri, &q, speed, &path, &name, false).await.unwrap_or_else(fail)
}

async fn thumb(State(state): State<SlaveState>, uri: Uri, Path(path): Path<String>, Query(q): Query<SignQuery>) -> Response {
    let result = async {
        check_url(&state.auth, uri.path(), &q.sign, q.expires)?;
        match state.driver()?.thumb(&decode_path(&path)?).await? {
            ThumbContent::Stream(s) => Ok::<_, AppError>(Response::new(Body::from_stream(ReaderStream::new(s)))),
            ThumbContent::Redirect(url) => Ok(axum::response::Redirect::temporary(&url).into_response()),
        }
    };
    result.await.unwrap_or_else(fail)
}

/// Bind and serve the slave API until the process stops.
pub async fn serve(state: SlaveState, listen: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "slave_listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
