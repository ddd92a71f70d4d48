//! Master HTTP surface: signed delivery links and upload callbacks.
//!
//! Every route here is reached through a link or callback the engine itself issued, so
//! authentication is the signature (or the unguessable callback key), never a session.

use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use crate::auth::{check_request, check_url, HmacAuth};
use crate::config::{Config, Mode};
use crate::error::{AppError, AppResult};
use crate::filesystem::archive::ArchiveHandle;
use crate::filesystem::hooks::CallbackReport;
use crate::filesystem::{FileSystem, UploadSession};
use crate::services::Services;
use crate::slave::{self, fail, file_response, ok, SignQuery, SlaveState};

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v3/site/ping", get(ping))
        .route("/api/v3/file/download/{id}", get(download))
        .route("/api/v3/file/get/{id}/{name}", get(source))
        .route("/api/v3/file/archive/{id}/archive.zip", get(archive))
        .route("/api/v3/callback/remote/{key}", post(remote_callback))
        .route("/api/v3/callback/storage/{key}", post(storage_callback))
        .with_state(state)
}

async fn ping() -> Response { ok(json!(env!("CARGO_PKG_VERSION"))) }

fn session_for(services: &Services, uid: u64) -> AppResult<FileSystem> {
    let user = services.db.get_user(uid)?;
    FileSystem::new(services, user)
}

async fn download(State(state): State<AppState>, uri: Uri, Path(id): Path<String>, Query(q): Query<SignQuery>) -> Response {
    let result = async {
        check_url(state.services.signer(), uri.path(), &q.sign, q.expires)?;
        let file_id = state
            .services
            .cache
            .get_str(&id)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| AppError::not_found("download_session_expired", "download session expired"))?;
        let owner = state.services.db.get_file(file_id)?.user_id;
        let (file, stream) = session_for(&state.services, owner)?.download(file_id).await?;
        Ok::<_, AppError>(file_response(stream, 0, &file.name, true))
    };
    result.await.unwrap_or_else(fail)
}

async fn source(State(state): State<AppState>, uri: Uri, Path((id, name)): Path<(u64, String)>, Query(q): Query<SignQuery>) -> Response {
    let result = async {
        check_url(state.services.signer(), uri.path(), &q.sign, q.expires)?;
        let file = state.services.db.get_file(id)?;
        if file.name != name {
            return Err(AppError::not_found("object_not_found", format!("file '{}' not found", name)));
        }
        let (file, stream) = session_for(&state.services, file.user_id)?.download(id).await?;
        Ok::<_, AppError>(file_response(stream, 0, &file.name, false))
    };
    result.await.unwrap_or_else(fail)
}

async fn archive(State(state): State<AppState>, uri: Uri, Path(id): Path<String>, Query(q): Query<SignQuery>) -> Response {
    let result = async {
        check_url(state.services.signer(), uri.path(), &q.sign, q.expires)?;
        let file = ArchiveHandle::open(&state.services.cache, &id).await?;
        Ok::<_, AppError>(file_response(Box::new(file), 0, "archive.zip", true))
    };
    result.await.unwrap_or_else(fail)
}

fn upload_session(services: &Services, key: &str) -> AppResult<UploadSession> {
    services
        .cache
        .get_json::<UploadSession>(&UploadSession::cache_key(key))
        .ok_or_else(|| AppError::not_found("upload_session_expired", "upload session expired or unknown"))
}

/// A slave reports a client-direct upload, signed with the policy's shared secret.
async fn remote_callback(State(state): State<AppState>, uri: Uri, Path(key): Path<String>, headers: HeaderMap, body: Bytes) -> Response {
    let result = async {
        let session = upload_session(&state.services, &key)?;
        let policy = state.services.db.get_policy(session.policy_id)?;
        check_request(&HmacAuth::new(&policy.secret_key), uri.path(), &headers, &body, state.services.slave.replay_window as i64)?;
        let report: CallbackReport = serde_json::from_slice(&body)?;
        let mut fs = session_for(&state.services, session.uid)?;
        let file = fs.add_file_from_callback(&session, report.size, &report.source_name, &report.pic_info).await?;
        state.services.cache.delete(&UploadSession::cache_key(&key));
        Ok::<_, AppError>(json!({ "id": file.id }))
    };
    match result.await {
        Ok(v) => ok(v),
        Err(e) => fail(e),
    }
}

/// The client finished a direct upload to object storage.
async fn storage_callback(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let result = async {
        let session = upload_session(&state.services, &key)?;
        let mut fs = session_for(&state.services, session.uid)?;
        let file = fs.confirm_direct_upload(&session).await?;
        state.services.cache.delete(&UploadSession::cache_key(&key));
        Ok::<_, AppError>(json!({ "id": file.id }))
    };
    match result.await {
        Ok(v) => ok(v),
        Err(e) => fail(e),
    }
}

pub async fn serve(state: AppState, listen: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await.with_context(|| format!("binding {}", listen))?;
    tracing::info!(addr = %listener.local_addr()?, "master_listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Build the shared services for `cfg` and serve the role it names.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    cfg.validate()?;
    let services = Services::new(&cfg);
    services.seed(&cfg.seed).context("loading seed records")?;
    let _sweeper = services.cache.spawn_sweeper(Duration::from_secs(5));
    match cfg.system.mode {
        Mode::Master => serve(AppState { services }, &cfg.system.listen).await,
        Mode::Slave => slave::serve(SlaveState::new(services), &cfg.system.listen).await,
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod server_tests;
