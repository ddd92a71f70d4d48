//! Storage drivers: the raw capability set every backend implements, and the registry that
//! binds a [`PolicyKind`] to one implementation at startup.

pub mod local;
pub mod onedrive;
pub mod registry;
pub mod remote;
pub mod s3;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::auth::HmacAuth;
use crate::cache::Cache;
use crate::config::SiteSettings;
use crate::error::{AppError, AppResult};
use crate::models::PolicyKind;

pub use registry::{factory, DriverFactory, DriverRegistry};

/// The bytes flowing into or out of a backend.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Fail with `ObjectExist` instead of replacing an existing object.
    pub disable_overwrite: bool,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub base_url: String,
    /// Seconds; `0` yields a non-expiring URL where the backend allows it.
    pub ttl: i64,
    pub is_download: bool,
    /// Bytes per second; `0` is unlimited.
    pub speed: u64,
    pub file_id: u64,
    pub file_name: String,
}

/// Input to [`Driver::token`] for client-direct uploads.
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    pub ttl: i64,
    pub callback_key: String,
    /// Pre-generated physical path; empty when the backend names the object itself.
    pub save_path: String,
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadCredential {
    pub token: String,
    pub policy: String,
    pub path: String,
    pub ak: String,
    pub key_time: String,
    pub callback: String,
    pub key: String,
    pub upload_url: String,
}

pub enum ThumbContent {
    Stream(ByteStream),
    Redirect(String),
}

impl std::fmt::Debug for ThumbContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThumbContent::Stream(_) => f.write_str("ThumbContent::Stream(..)"),
            ThumbContent::Redirect(u) => f.debug_tuple("ThumbContent::Redirect").field(u).finish(),
        }
    }
}

/// Result of a batch delete: the paths that could not be removed, and the last error seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteReport {
    pub failed: Vec<String>,
    pub error: Option<AppError>,
}

impl DeleteReport {
    pub fn all_failed(paths: &[String], error: AppError) -> Self { Self { failed: paths.to_vec(), error: Some(error) } }
}

/// Physical listing entry as seen by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    pub name: String,
    pub relative_path: String,
    pub source: String,
    pub size: u64,
    pub is_dir: bool,
    pub last_modify: DateTime<Utc>,
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> PolicyKind;

    async fn get(&self, path: &str) -> AppResult<ByteStream>;

    async fn put(&self, stream: ByteStream, dst: &str, size: u64, opts: &PutOptions) -> AppResult<()>;

    async fn delete(&self, paths: &[String]) -> DeleteReport;

    async fn thumb(&self, path: &str) -> AppResult<ThumbContent>;

    async fn source(&self, path: &str, opts: &SourceOptions) -> AppResult<String>;

    async fn token(&self, req: &TokenRequest) -> AppResult<UploadCredential>;

    async fn list(&self, path: &str, recursive: bool) -> AppResult<Vec<RawObject>>;
}

/// Process-wide collaborators a driver may need at construction.
#[derive(Clone)]
pub struct DriverEnv {
    pub settings: Arc<SiteSettings>,
    pub cache: Cache,
    pub http: reqwest::Client,
    /// Signs master-issued URLs (local downloads, archive links).
    pub signer: HmacAuth,
}

impl DriverEnv {
    pub fn new(settings: Arc<SiteSettings>, cache: Cache, signer: HmacAuth) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { settings, cache, http, signer }
    }
}

pub(crate) fn not_implemented(kind: PolicyKind, op: &str) -> AppError {
    AppError::not_implemented("not_implemented", format!("{} is not supported by the {} driver", op, kind.as_str()))
}

pub(crate) fn require(field: &str, value: &str, kind: PolicyKind) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::internal_setting("policy_incomplete", format!("{} policy requires '{}'", kind.as_str(), field)));
    }
    Ok(())
}
