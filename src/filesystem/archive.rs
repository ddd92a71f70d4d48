//! Zip compress and decompress over the driver layer.
//!
//! Bytes are always read and written through each file's own policy driver, so an archive
//! can mix objects from local disk, slaves and object storage. Zip encoding is synchronous
//! and runs on the blocking pool; driver streams are bridged into it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::io::SyncIoBridge;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::upload::UploadOptions;
use super::FileSystem;
use crate::auth::{now_unix, sign_url};
use crate::cache::{keys, Cache};
use crate::error::{AppError, AppResult};
use crate::models::File;
use crate::util::{join, rand_string};

/// What an archive download id resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveHandle {
    pub path: String,
    /// Consumed by the first download.
    pub one_time: bool,
}

impl ArchiveHandle {
    pub fn cache_key(id: &str) -> String { format!("{}{}", keys::ARCHIVE, id) }

    pub fn lookup(cache: &Cache, id: &str) -> Option<Self> { cache.get_json(&Self::cache_key(id)) }

    /// Open the archive behind `id`. A one-time handle is consumed only once the file has
    /// opened, and a download that loses the race for it sees `NotFound`.
    pub async fn open(cache: &Cache, id: &str) -> AppResult<tokio::fs::File> {
        let expired = || AppError::not_found("archive_expired", "archive link expired");
        let handle = Self::lookup(cache, id).ok_or_else(expired)?;
        let file = tokio::fs::File::open(&handle.path).await?;
        if handle.one_time && cache.take(&Self::cache_key(id)).is_none() {
            return Err(expired());
        }
        Ok(file)
    }
}

/// One archive member: a directory when `file` is `None`.
struct Member {
    name: String,
    file: Option<File>,
}

struct Extracted {
    name: String,
    local: PathBuf,
    size: u64,
    is_dir: bool,
}

fn zip_err(e: zip::result::ZipError) -> AppError { AppError::io("archive_failed", e.to_string()) }

async fn blocking<T, F>(f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| AppError::io("archive_task_failed", e.to_string()))?
}

fn extract_zip(src: &Path, dst: &Path) -> AppResult<Vec<Extracted>> {
    let mut archive = ZipArchive::new(std::fs::File::open(src)?).map_err(zip_err)?;
    let mut out = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_err)?;
        // Entries that would escape the extraction root are dropped.
        let Some(rel) = entry.enclosed_name() else { continue };
        let local = dst.join(&rel);
        let name = rel.to_string_lossy().replace('\\', "/");
        if entry.is_dir() {
            std::fs::create_dir_all(&local)?;
            out.push(Extracted { name, local, size: 0, is_dir: true });
            continue;
        }
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&local)?;
        let size = std::io::copy(&mut entry, &mut file)?;
        out.push(Extracted { name, local, size, is_dir: false });
    }
    Ok(out)
}

impl FileSystem {
    fn work_dir(&self, kind: &str) -> PathBuf {
        Path::new(&self.services.settings().temp_path).join(kind)
    }

    fn archive_members(&self) -> AppResult<Vec<Member>> {
        let db = &self.services.db;
        let mut out = Vec::new();
        for root in &self.dir_target {
            let base = db.folder_path(root.parent_id.unwrap_or(root.id))?;
            for folder in db.recursive_child_folders(&[root.id], self.user.id, true) {
                let full = db.folder_path(folder.id)?;
                let rel = full.strip_prefix(base.as_str()).unwrap_or(&full).trim_matches('/').to_string();
                if !rel.is_empty() {
                    out.push(Member { name: format!("{}/", rel), file: None });
                }
                for f in db.child_files(folder.id) {
                    let name = if rel.is_empty() { f.name.clone() } else { format!("{}/{}", rel, f.name) };
                    out.push(Member { name, file: Some(f) });
                }
            }
        }
        out.extend(self.file_target.iter().map(|f| Member { name: f.name.clone(), file: Some(f.clone()) }));
        Ok(out)
    }

    async fn write_archive(&self, zip_path: &Path, members: Vec<Member>) -> AppResult<()> {
        let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut writer = ZipWriter::new(std::fs::File::create(zip_path)?);
        for Member { name, file } in members {
            writer = match file {
                None => {
                    blocking(move || {
                        writer.add_directory(name, opts).map_err(zip_err)?;
                        Ok(writer)
                    })
                    .await?
                }
                Some(f) => {
                    let (_, driver) = self.driver_for(f.policy_id)?;
                    let stream = match driver.get(&f.source_name).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(file = f.id, error = %e, "archive_member_skipped");
                            continue;
                        }
                    };
                    let mut bridge = SyncIoBridge::new(stream);
                    blocking(move || {
                        writer.start_file(name, opts).map_err(zip_err)?;
                        std::io::copy(&mut bridge, &mut writer)?;
                        Ok(writer)
                    })
                    .await?
                }
            };
        }
        blocking(move || writer.finish().map(|_| ()).map_err(zip_err)).await
    }

    /// Zip the selected folders and files into a local temp file and return its path.
    pub async fn compress(&mut self, dir_ids: &[u64], file_ids: &[u64]) -> AppResult<PathBuf> {
        self.set_targets(dir_ids, file_ids);
        if self.dir_target.is_empty() && self.file_target.is_empty() {
            return Err(AppError::not_found("object_not_found", "nothing to compress"));
        }
        let members = self.archive_members()?;
        let dir = self.work_dir("archive");
        tokio::fs::create_dir_all(&dir).await?;
        let zip_path = dir.join(format!("archive_{}.zip", uuid::Uuid::new_v4().simple()));
        if let Err(e) = self.write_archive(&zip_path, members).await {
            let _ = tokio::fs::remove_file(&zip_path).await;
            return Err(e);
        }
        tracing::info!(uid = self.user.id, path = %zip_path.display(), "archive_created");
        Ok(zip_path)
    }

    /// Compress and register a download handle; returns the signed archive URL.
    pub async fn create_archive(&mut self, dir_ids: &[u64], file_ids: &[u64]) -> AppResult<String> {
        if !self.user.group.archive_download {
            return Err(AppError::group_not_allowed("archive_download_disabled", "this group cannot download archives"));
        }
        let path = self.compress(dir_ids, file_ids).await?;
        let settings = self.services.settings();
        let id = rand_string(16);
        let handle = ArchiveHandle { path: path.to_string_lossy().to_string(), one_time: self.user.group.one_time_download };
        self.services.cache.set_json(ArchiveHandle::cache_key(&id), &handle, Some(Duration::from_secs(settings.archive_timeout)))?;
        let url = format!("{}/api/v3/file/archive/{}/archive.zip", settings.site_url.trim_end_matches('/'), id);
        Ok(sign_url(self.services.signer(), &url, now_unix() + settings.archive_timeout as i64))
    }

    /// Compress the selection and store the archive as `dst_path/name` in the drive.
    pub async fn compress_into(&mut self, dir_ids: &[u64], file_ids: &[u64], dst_path: &str, name: &str) -> AppResult<File> {
        let zip_path = self.compress(dir_ids, file_ids).await?;
        let result = self.store_local_file(&zip_path, &join(dst_path, name)).await;
        let _ = tokio::fs::remove_file(&zip_path).await;
        result?.record.ok_or_else(|| AppError::database("record_missing", "archive produced no file record"))
    }

    async fn store_local_file(&mut self, local: &Path, virtual_path: &str) -> AppResult<super::Uploaded> {
        let (dir, _) = crate::util::split_dir(virtual_path);
        let policy_id = self.policy_for_path(&dir)?;
        self.switch_policy(policy_id)?;
        let file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        self.upload_to(Box::new(file), virtual_path, size, UploadOptions::default()).await
    }

    /// Extract an archive file from the drive into `dst_path`. Each member is uploaded with
    /// its own capacity reservation; members that fail are logged and skipped.
    pub async fn decompress(&mut self, file_id: u64, dst_path: &str) -> AppResult<usize> {
        self.folder_by_path(dst_path)?;
        let (_, mut stream) = self.download(file_id).await?;
        let work = self.work_dir("decompress").join(uuid::Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&work).await?;

        let zip_path = work.join("source.zip");
        let fetched = async {
            let mut out = tokio::fs::File::create(&zip_path).await?;
            tokio::io::copy(&mut stream, &mut out).await?;
            out.flush().await?;
            Ok::<(), AppError>(())
        }
        .await;
        let result = match fetched {
            Ok(()) => self.extract_and_store(&work, zip_path, dst_path).await,
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_dir_all(&work).await;
        result
    }

    async fn extract_and_store(&mut self, work: &Path, zip_path: PathBuf, dst_path: &str) -> AppResult<usize> {
        let target = work.join("extracted");
        let members = blocking(move || extract_zip(&zip_path, &target)).await?;
        let mut stored = 0;
        for m in members {
            let virtual_path = join(dst_path, &m.name);
            if m.is_dir {
                self.ensure_directory(&virtual_path)?;
                continue;
            }
            match self.store_local_file(&m.local, &virtual_path).await {
                Ok(_) => stored += 1,
                Err(e) => tracing::warn!(path = %virtual_path, size = m.size, error = %e, "decompress_member_skipped"),
            }
        }
        tracing::info!(uid = self.user.id, dst = %dst_path, stored, "archive_extracted");
        Ok(stored)
    }
}

#[cfg(test)]
#[path = "archive_tests.rs"]
mod archive_tests;
