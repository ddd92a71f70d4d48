//! Local disk backend. Physical paths are relative to `data_dir` and may never escape it.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use path_absolutize::Absolutize;
use tokio::io::AsyncWriteExt;

use super::{ByteStream, DeleteReport, Driver, DriverEnv, PutOptions, RawObject, SourceOptions, ThumbContent, TokenRequest, UploadCredential};
use crate::auth::{now_unix, sign_url};
use crate::cache::{keys, CacheValue};
use crate::error::{AppError, AppResult};
use crate::models::{Policy, PolicyKind};
use crate::util::rand_string;

pub struct LocalDriver {
    policy: Policy,
    root: PathBuf,
    env: DriverEnv,
}

impl LocalDriver {
    pub fn new(policy: &Policy, env: &DriverEnv) -> AppResult<Self> {
        let root = Path::new(&env.settings.data_dir).absolutize()?.to_path_buf();
        Ok(Self { policy: policy.clone(), root, env: env.clone() })
    }

    pub fn root(&self) -> &Path { &self.root }

    /// Map a physical path onto the data directory.
    pub fn resolve(&self, path: &str) -> AppResult<PathBuf> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(AppError::policy_not_allowed("illegal_path", format!("path '{}' escapes the storage root", path)));
        }
        Ok(self.root.join(rel))
    }

    fn thumb_path(&self, path: &str) -> String { format!("{}{}", path, self.env.settings.thumb_suffix) }

    fn expires(ttl: i64) -> i64 { if ttl > 0 { now_unix() + ttl } else { 0 } }
}

#[async_trait]
impl Driver for LocalDriver {
    fn kind(&self) -> PolicyKind { PolicyKind::Local }

    async fn get(&self, path: &str) -> AppResult<ByteStream> {
        let file = tokio::fs::File::open(self.resolve(path)?).await?;
        Ok(Box::new(file))
    }

    async fn put(&self, mut stream: ByteStream, dst: &str, size: u64, opts: &PutOptions) -> AppResult<()> {
        let full = self.resolve(dst)?;
        if opts.disable_overwrite && tokio::fs::try_exists(&full).await.unwrap_or(false) {
            return Err(AppError::object_exist("object_exist", format!("'{}' already exists", dst)));
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(&full).await?;
        let written = match tokio::io::copy(&mut stream, &mut out).await {
            Ok(n) => n,
            Err(e) => {
                drop(out);
                let _ = tokio::fs::remove_file(&full).await;
                return Err(match e.kind() {
                    std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => AppError::upload_failed("size_mismatch", e.to_string()),
                    _ => AppError::io("write_failed", e.to_string()),
                });
            }
        };
        out.flush().await?;
        if written != size {
            drop(out);
            let _ = tokio::fs::remove_file(&full).await;
            return Err(AppError::upload_failed("size_mismatch", format!("expected {} bytes, received {}", size, written)));
        }
        Ok(())
    }

    async fn delete(&self, paths: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for p in paths {
            let full = match self.resolve(p) {
                Ok(f) => f,
                Err(e) => {
                    report.failed.push(p.clone());
                    report.error = Some(e);
                    continue;
                }
            };
            match tokio::fs::remove_file(&full).await {
                Ok(()) => {}
                // Already gone counts as deleted.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!(path = %p, error = %e, "local_delete_failed");
                    report.failed.push(p.clone());
                    report.error = Some(e.into());
                    continue;
                }
            }
            if let Ok(thumb) = self.resolve(&self.thumb_path(p)) {
                let _ = tokio::fs::remove_file(thumb).await;
            }
        }
        report
    }

    async fn thumb(&self, path: &str) -> AppResult<ThumbContent> {
        let file = tokio::fs::File::open(self.resolve(&self.thumb_path(path))?).await?;
        Ok(ThumbContent::Stream(Box::new(file)))
    }

    async fn source(&self, _path: &str, opts: &SourceOptions) -> AppResult<String> {
        let base = if opts.base_url.is_empty() { self.env.settings.site_url.as_str() } else { opts.base_url.as_str() };
        let base = base.trim_end_matches('/');
        let url = if opts.is_download {
            let id = format!("{}{}", keys::DOWNLOAD, rand_string(16));
            let ttl = Duration::from_secs(self.env.settings.download_timeout);
            self.env.cache.set(id.clone(), CacheValue::Str(opts.file_id.to_string()), Some(ttl));
            format!("{}/api/v3/file/download/{}", base, id)
        } else {
            format!("{}/api/v3/file/get/{}/{}", base, opts.file_id, urlencoding::encode(&opts.file_name))
        };
        Ok(sign_url(&self.env.signer, &url, Self::expires(opts.ttl)))
    }

    /// Local uploads stream through the master's own upload endpoint.
    async fn token(&self, req: &TokenRequest) -> AppResult<UploadCredential> {
        Ok(UploadCredential { path: req.save_path.clone(), key: req.callback_key.clone(), upload_url: self.policy.upload_url(), ..Default::default() })
    }

    async fn list(&self, path: &str, recursive: bool) -> AppResult<Vec<RawObject>> {
        let base = self.resolve(path)?;
        let mut out = Vec::new();
        let mut queue = vec![base.clone()];
        while let Some(dir) = queue.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir == base => return Ok(out),
                Err(e) => return Err(e.into()),
            };
            while let Some(ent) = entries.next_entry().await? {
                let meta = ent.metadata().await?;
                let full = ent.path();
                let name = ent.file_name().to_string_lossy().to_string();
                if !meta.is_dir() && name.ends_with(&self.env.settings.thumb_suffix) { continue; }
                let rel_dir = dir.strip_prefix(&base).unwrap_or(Path::new("")).to_string_lossy().replace('\\', "/");
                let source = full.strip_prefix(&self.root).unwrap_or(&full).to_string_lossy().replace('\\', "/");
                let modified: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
                if meta.is_dir() && recursive { queue.push(full.clone()); }
                out.push(RawObject {
                    name,
                    relative_path: rel_dir,
                    source,
                    size: if meta.is_dir() { 0 } else { meta.len() },
                    is_dir: meta.is_dir(),
                    last_modify: modified,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod local_tests;
