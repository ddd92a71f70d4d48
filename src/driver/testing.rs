//! In-memory backend for session tests. Objects live in a shared map so a test can bind the
//! backend into a registry and inspect what the session wrote.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use super::{factory, ByteStream, DeleteReport, Driver, DriverFactory, PutOptions, RawObject, SourceOptions, ThumbContent, TokenRequest, UploadCredential};
use crate::error::{AppError, AppResult};
use crate::models::PolicyKind;

#[derive(Clone, Default)]
pub(crate) struct MemoryBackend {
    pub objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    /// Paths whose delete is reported as failed.
    pub fail_delete: Arc<Mutex<HashSet<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }

    pub fn factory(&self, kind: PolicyKind) -> DriverFactory {
        let backend = self.clone();
        factory(move |_, _| Ok(MemoryDriver { kind, backend: backend.clone() }))
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> { self.objects.lock().get(path).cloned() }

    pub fn insert(&self, path: &str, bytes: &[u8]) { self.objects.lock().insert(path.to_string(), bytes.to_vec()); }
}

pub(crate) struct MemoryDriver {
    kind: PolicyKind,
    backend: MemoryBackend,
}

#[async_trait]
impl Driver for MemoryDriver {
    fn kind(&self) -> PolicyKind { self.kind }

    async fn get(&self, path: &str) -> AppResult<ByteStream> {
        let bytes = self.backend.get(path).ok_or_else(|| AppError::not_found("object_not_found", path.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn put(&self, mut stream: ByteStream, dst: &str, _size: u64, opts: &PutOptions) -> AppResult<()> {
        if opts.disable_overwrite && self.backend.get(dst).is_some() {
            return Err(AppError::object_exist("object_exist", dst.to_string()));
        }
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        self.backend.insert(dst, &buf);
        Ok(())
    }

    async fn delete(&self, paths: &[String]) -> DeleteReport {
        let fail = self.backend.fail_delete.lock().clone();
        let mut report = DeleteReport::default();
        for p in paths {
            if fail.contains(p) {
                report.failed.push(p.clone());
                report.error = Some(AppError::io("delete_failed", format!("cannot delete {}", p)));
                continue;
            }
            self.backend.objects.lock().remove(p);
        }
        report
    }

    async fn thumb(&self, _path: &str) -> AppResult<ThumbContent> { Err(super::not_implemented(self.kind, "thumb")) }

    async fn source(&self, path: &str, _opts: &SourceOptions) -> AppResult<String> { Ok(format!("memory://{}", path)) }

    async fn token(&self, req: &TokenRequest) -> AppResult<UploadCredential> {
        Ok(UploadCredential { path: req.save_path.clone(), key: req.callback_key.clone(), ..Default::default() })
    }

    async fn list(&self, path: &str, _recursive: bool) -> AppResult<Vec<RawObject>> {
        let prefix = path.trim_matches('/');
        Ok(self
            .backend
            .objects
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| RawObject {
                name: k.rsplit('/').next().unwrap_or(k).to_string(),
                relative_path: k.trim_start_matches(prefix).trim_start_matches('/').rsplit_once('/').map(|(d, _)| d.to_string()).unwrap_or_default(),
                source: k.clone(),
                size: v.len() as u64,
                is_dir: false,
                last_modify: Utc::now(),
            })
            .collect())
    }
}
