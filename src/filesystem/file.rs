//! Reading files back out, signed links, and client-direct upload sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::hooks::Stage;
use super::upload::UploadContext;
use super::validator::{check_upload, normalize_name};
use super::FileSystem;
use crate::cache::keys;
use crate::driver::{ByteStream, SourceOptions, ThumbContent, TokenRequest, UploadCredential};
use crate::error::{AppError, AppResult};
use crate::models::File;
use crate::util::{join, rand_string, split_dir};

/// A pending client-direct upload, parked in the cache under `callback_<key>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub uid: u64,
    pub policy_id: u64,
    pub virtual_path: String,
    pub name: String,
    pub size: u64,
    pub save_path: String,
    pub callback_key: String,
}

impl UploadSession {
    pub fn cache_key(key: &str) -> String { format!("{}{}", keys::CALLBACK, key) }
}

impl FileSystem {
    /// Open a file's content through its own policy's driver.
    pub async fn download(&self, file_id: u64) -> AppResult<(File, ByteStream)> {
        let file = self.owned_file(file_id)?;
        let (_, driver) = self.driver_for(file.policy_id)?;
        let stream = driver.get(&file.source_name).await?;
        Ok((file, stream))
    }

    pub async fn sign_url(&self, file_id: u64, ttl: i64, is_download: bool) -> AppResult<String> {
        let file = self.owned_file(file_id)?;
        let (policy, driver) = self.driver_for(file.policy_id)?;
        let opts = SourceOptions { base_url: policy.base_url.clone(), ttl, is_download, speed: 0, file_id: file.id, file_name: file.name.clone() };
        driver.source(&file.source_name, &opts).await
    }

    /// Attachment URL valid for the configured download timeout.
    pub async fn get_download_url(&self, file_id: u64) -> AppResult<String> {
        self.sign_url(file_id, self.services.settings().download_timeout as i64, true).await
    }

    pub async fn thumb(&self, file_id: u64) -> AppResult<ThumbContent> {
        let file = self.owned_file(file_id)?;
        let (policy, driver) = self.driver_for(file.policy_id)?;
        if !policy.is_thumb_exist(&file.name) {
            return Err(AppError::not_found("thumb_not_exist", format!("no thumbnail for '{}'", file.name)));
        }
        driver.thumb(&file.source_name).await
    }

    /// Credential for uploading `name` (`size` bytes) straight to the backend of `path`.
    pub async fn get_upload_token(&mut self, path: &str, size: u64, name: &str, ttl: i64) -> AppResult<UploadCredential> {
        let policy_id = self.policy_for_path(path)?;
        self.switch_policy(policy_id)?;
        let name = normalize_name(name);
        check_upload(&name, size, self.policy.max_size, &self.policy.allowed_extensions)?;
        let remaining = self.services.ledger.remaining(self.user.id)?;
        if size > remaining {
            return Err(AppError::quota_exceeded("quota_exceeded", format!("{} bytes requested, {} available", size, remaining)));
        }

        let callback_key = rand_string(16);
        let dir = self.policy.generate_path(self.user.id, path);
        let save_path = if self.policy.is_path_generate_needed() {
            join(&dir, &self.policy.generate_file_name(self.user.id, &name)).trim_start_matches('/').to_string()
        } else {
            dir
        };
        let session = UploadSession {
            uid: self.user.id,
            policy_id,
            virtual_path: path.to_string(),
            name: name.clone(),
            size,
            save_path: save_path.clone(),
            callback_key: callback_key.clone(),
        };
        let timeout = Duration::from_secs(self.services.settings().upload_session_timeout);
        self.services.cache.set_json(UploadSession::cache_key(&callback_key), &session, Some(timeout))?;

        let req = TokenRequest { ttl, callback_key, save_path, file_name: name, size };
        self.driver.token(&req).await
    }

    /// Create the record for a finished client-direct upload. `source_name` is where the
    /// backend actually stored the object.
    pub async fn add_file_from_callback(&mut self, session: &UploadSession, size: u64, source_name: &str, pic_info: &str) -> AppResult<File> {
        self.switch_policy(session.policy_id)?;
        self.clean_hooks();
        self.use_add_file_stack();
        let mut ctx = UploadContext::for_existing(&session.name, &session.virtual_path, size, source_name);
        ctx.pic_info = pic_info.to_string();
        if let Err(e) = self.trigger(Stage::BeforeAddFile, &mut ctx).await {
            self.trigger(Stage::BeforeAddFileFailed, &mut ctx).await?;
            return Err(e);
        }
        tracing::info!(uid = self.user.id, path = %source_name, size, "callback_file_added");
        ctx.record.ok_or_else(|| AppError::database("record_missing", "callback produced no file record"))
    }

    /// Object-storage callback: look the object up in the backend and record it.
    pub async fn confirm_direct_upload(&mut self, session: &UploadSession) -> AppResult<File> {
        self.switch_policy(session.policy_id)?;
        let (dir, _) = split_dir(&format!("/{}", session.save_path));
        let objects = self.driver.list(&dir, false).await?;
        let found = objects
            .into_iter()
            .find(|o| !o.is_dir && o.source.trim_start_matches('/') == session.save_path)
            .ok_or_else(|| AppError::not_found("object_not_found", format!("'{}' was not uploaded", session.save_path)))?;
        self.add_file_from_callback(session, found.size, &session.save_path, "").await
    }
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod file_tests;
