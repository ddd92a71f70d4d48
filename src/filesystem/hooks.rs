//! Named extension points around state-changing operations.
//!
//! Handlers run in registration order. In a regular stage the first error stops the stage
//! and is returned; cleanup stages run every handler and only log failures, so one broken
//! cleanup step never prevents capacity from being given back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::upload::UploadContext;
use super::validator::{check_upload, normalize_name};
use super::FileSystem;
use crate::auth::request::url_path;
use crate::auth::{sign_request, HmacAuth};
use crate::driver::remote::{Envelope, UploadPolicy};
use crate::driver::PutOptions;
use crate::error::{AppError, AppResult};
use crate::models::File;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    BeforeUpload,
    AfterUpload,
    AfterUploadCanceled,
    AfterUploadFailed,
    AfterValidateFailed,
    BeforeAddFile,
    BeforeAddFileFailed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BeforeUpload => "BeforeUpload",
            Stage::AfterUpload => "AfterUpload",
            Stage::AfterUploadCanceled => "AfterUploadCanceled",
            Stage::AfterUploadFailed => "AfterUploadFailed",
            Stage::AfterValidateFailed => "AfterValidateFailed",
            Stage::BeforeAddFile => "BeforeAddFile",
            Stage::BeforeAddFileFailed => "BeforeAddFileFailed",
        }
    }

    pub fn is_cleanup(&self) -> bool {
        matches!(self, Stage::AfterUploadCanceled | Stage::AfterUploadFailed | Stage::AfterValidateFailed | Stage::BeforeAddFileFailed)
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &'static str;
    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()>;
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    stages: HashMap<Stage, Vec<Arc<dyn Hook>>>,
}

impl HookRegistry {
    pub fn add(&mut self, stage: Stage, hook: Arc<dyn Hook>) { self.stages.entry(stage).or_default().push(hook); }

    pub fn handlers(&self, stage: Stage) -> Vec<Arc<dyn Hook>> { self.stages.get(&stage).cloned().unwrap_or_default() }

    pub fn names(&self, stage: Stage) -> Vec<&'static str> { self.stages.get(&stage).map(|v| v.iter().map(|h| h.name()).collect()).unwrap_or_default() }

    pub fn clear(&mut self) { self.stages.clear(); }
}

impl FileSystem {
    /// Run every handler of `stage` in order.
    pub async fn trigger(&mut self, stage: Stage, ctx: &mut UploadContext) -> AppResult<()> {
        for hook in self.hooks.handlers(stage) {
            if let Err(e) = hook.call(self, ctx).await {
                if !stage.is_cleanup() { return Err(e); }
                tracing::warn!(stage = stage.as_str(), hook = hook.name(), error = %e, "cleanup_hook_failed");
            }
        }
        Ok(())
    }

    /// Master stack for uploads that stream through this node.
    pub fn use_upload_stack(&mut self) {
        self.use_hook(Stage::BeforeUpload, ValidateFile);
        self.use_hook(Stage::BeforeUpload, ValidateCapacity);
        self.use_hook(Stage::AfterUploadCanceled, DeleteTempFile);
        self.use_hook(Stage::AfterUploadCanceled, GiveBackCapacity);
        self.use_hook(Stage::AfterUpload, GenericAfterUpload);
        self.use_hook(Stage::AfterValidateFailed, DeleteTempFile);
        self.use_hook(Stage::AfterValidateFailed, GiveBackCapacity);
        self.use_hook(Stage::AfterUploadFailed, GiveBackCapacity);
    }

    /// Slave stack: validate against the master's upload policy, report back on success.
    pub fn use_slave_upload_stack(&mut self, policy: UploadPolicy) {
        self.use_hook(Stage::BeforeUpload, SlaveUploadValidate(policy));
        self.use_hook(Stage::AfterUploadCanceled, DeleteTempFile);
        self.use_hook(Stage::AfterUpload, SlaveAfterUpload);
        self.use_hook(Stage::AfterValidateFailed, DeleteTempFile);
    }

    /// Stack for a record created after a client-direct upload.
    pub fn use_add_file_stack(&mut self) {
        self.use_hook(Stage::BeforeAddFile, ValidateFile);
        self.use_hook(Stage::BeforeAddFile, ValidateCapacity);
        self.use_hook(Stage::BeforeAddFile, GenericAfterUpload);
        self.use_hook(Stage::BeforeAddFileFailed, DeleteTempFile);
        self.use_hook(Stage::BeforeAddFileFailed, GiveBackCapacity);
    }

    /// Stack for replacing the content of an existing file in place.
    pub fn use_update_stack(&mut self) {
        self.use_hook(Stage::BeforeUpload, ValidateFile);
        self.use_hook(Stage::BeforeUpload, ValidateCapacityWithoutIncrease);
        self.use_hook(Stage::AfterUpload, UpdateSourceName);
        self.use_hook(Stage::AfterUpload, GenericAfterUpdate);
        for stage in [Stage::AfterValidateFailed, Stage::AfterUploadFailed, Stage::AfterUploadCanceled] {
            self.use_hook(stage, CleanFileContent);
            self.use_hook(stage, ClearFileSize);
        }
    }
}

/// Name, size and extension against the session policy. Normalizes the name first.
pub struct ValidateFile;

#[async_trait]
impl Hook for ValidateFile {
    fn name(&self) -> &'static str { "validate_file" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        ctx.name = normalize_name(&ctx.name);
        check_upload(&ctx.name, ctx.size, fs.policy.max_size, &fs.policy.allowed_extensions)
    }
}

/// Reserve the upload's bytes through the request's guard.
pub struct ValidateCapacity;

#[async_trait]
impl Hook for ValidateCapacity {
    fn name(&self) -> &'static str { "validate_capacity" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        ctx.options.capacity_guard.reserve(&fs.services.ledger, fs.user.id, ctx.size)?;
        Ok(())
    }
}

/// Only the growth of a replaced file must fit; nothing is reserved.
pub struct ValidateCapacityWithoutIncrease;

#[async_trait]
impl Hook for ValidateCapacityWithoutIncrease {
    fn name(&self) -> &'static str { "validate_capacity_without_increase" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        let old = ctx.original.as_ref().map(|f| f.size).unwrap_or(0);
        let growth = ctx.size.saturating_sub(old);
        let remaining = fs.services.ledger.remaining(fs.user.id)?;
        if growth > remaining {
            return Err(AppError::quota_exceeded("quota_exceeded", format!("{} more bytes needed, {} available", growth, remaining)));
        }
        Ok(())
    }
}

/// Remove whatever was written at the save path.
pub struct DeleteTempFile;

#[async_trait]
impl Hook for DeleteTempFile {
    fn name(&self) -> &'static str { "delete_temp_file" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        if ctx.save_path.is_empty() { return Ok(()); }
        let report = fs.driver.delete(std::slice::from_ref(&ctx.save_path)).await;
        match report.error {
            Some(e) if !report.failed.is_empty() => Err(e),
            _ => Ok(()),
        }
    }
}

/// Release the guard's reservation. Settled guards make this a no-op.
pub struct GiveBackCapacity;

#[async_trait]
impl Hook for GiveBackCapacity {
    fn name(&self) -> &'static str { "give_back_capacity" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        ctx.options.capacity_guard.release(&fs.services.ledger)?;
        Ok(())
    }
}

pub struct CommitCapacity;

#[async_trait]
impl Hook for CommitCapacity {
    fn name(&self) -> &'static str { "commit_capacity" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        ctx.options.capacity_guard.commit(&fs.services.ledger)?;
        Ok(())
    }
}

/// Create the parent folder if needed, insert the record and commit the reservation.
pub struct GenericAfterUpload;

#[async_trait]
impl Hook for GenericAfterUpload {
    fn name(&self) -> &'static str { "generic_after_upload" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        let folder = fs.ensure_directory(&ctx.virtual_path)?;
        let db = fs.services.db.clone();
        if db.child_file(folder.id, &ctx.name).is_some() || db.child_folder(folder.id, &ctx.name).is_some() {
            return Err(AppError::object_exist("object_exist", format!("'{}' already exists in '{}'", ctx.name, ctx.virtual_path)));
        }
        let now = chrono::Utc::now();
        let record = db.create_file(File {
            id: 0,
            name: ctx.name.clone(),
            source_name: ctx.save_path.clone(),
            user_id: fs.user.id,
            size: ctx.size,
            pic_info: ctx.pic_info.clone(),
            folder_id: folder.id,
            policy_id: fs.policy.id,
            created_at: now,
            updated_at: now,
        })?;
        if let Err(e) = ctx.options.capacity_guard.commit(&fs.services.ledger) {
            db.delete_files(&[record.id]);
            return Err(e);
        }
        ctx.record = Some(record);
        Ok(())
    }
}

/// Slave-side check against the policy the master signed into `X-Policy`.
pub struct SlaveUploadValidate(pub UploadPolicy);

#[async_trait]
impl Hook for SlaveUploadValidate {
    fn name(&self) -> &'static str { "slave_upload_validate" }

    async fn call(&self, _fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        ctx.name = normalize_name(&ctx.name);
        check_upload(&ctx.name, ctx.size, self.0.max_size, &self.0.allowed_extension)
    }
}

/// Body a slave posts to the master once a client-direct upload lands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackReport {
    pub name: String,
    pub source_name: String,
    pub pic_info: String,
    pub size: u64,
}

/// Report a finished upload to the master's callback URL, signed with the slave secret.
pub struct SlaveAfterUpload;

#[async_trait]
impl Hook for SlaveAfterUpload {
    fn name(&self) -> &'static str { "slave_after_upload" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        let Some(url) = ctx.options.callback_url.clone().filter(|u| !u.is_empty()) else { return Ok(()) };
        let report = CallbackReport { name: ctx.name.clone(), source_name: ctx.save_path.clone(), pic_info: ctx.pic_info.clone(), size: ctx.size };
        let body = serde_json::to_vec(&report)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HmacAuth::new(&fs.services.slave.secret);
        sign_request(&auth, url_path(&url), &mut headers, &body, fs.services.slave.signature_ttl as i64);
        let resp = fs
            .services
            .env
            .http
            .post(&url)
            .headers(headers)
            .body(body)
            .timeout(Duration::from_secs(fs.services.slave.callback_timeout.max(1)))
            .send()
            .await
            .map_err(|e| AppError::callback("callback_failed", e.to_string()))?;
        let env: Envelope = resp.json().await.map_err(|e| AppError::callback("callback_failed", e.to_string()))?;
        if env.code != 0 {
            return Err(AppError::callback("callback_rejected", format!("master rejected callback: {}", env.msg)));
        }
        Ok(())
    }
}

/// Truncate a file whose in-place update failed, so content and size stay consistent.
pub struct CleanFileContent;

#[async_trait]
impl Hook for CleanFileContent {
    fn name(&self) -> &'static str { "clean_file_content" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        let Some(original) = ctx.original.as_ref().filter(|_| ctx.written) else { return Ok(()) };
        fs.driver.put(Box::new(tokio::io::empty()), &original.source_name, 0, &PutOptions::default()).await
    }
}

/// Zero the record's size and give its bytes back.
pub struct ClearFileSize;

#[async_trait]
impl Hook for ClearFileSize {
    fn name(&self) -> &'static str { "clear_file_size" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        let Some(original) = ctx.original.as_ref().filter(|_| ctx.written) else { return Ok(()) };
        let old = fs.services.db.get_file(original.id)?.size;
        fs.services.db.update_file(original.id, |f| f.size = 0)?;
        fs.services.ledger.deduct(fs.user.id, old)
    }
}

/// Point the record at the path the new content was written to.
pub struct UpdateSourceName;

#[async_trait]
impl Hook for UpdateSourceName {
    fn name(&self) -> &'static str { "update_source_name" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        let Some(original) = &ctx.original else { return Ok(()) };
        if original.source_name != ctx.save_path {
            let source = ctx.save_path.clone();
            fs.services.db.update_file(original.id, move |f| f.source_name = source)?;
        }
        Ok(())
    }
}

/// Apply the new size to the record and charge or refund the difference.
pub struct GenericAfterUpdate;

#[async_trait]
impl Hook for GenericAfterUpdate {
    fn name(&self) -> &'static str { "generic_after_update" }

    async fn call(&self, fs: &mut FileSystem, ctx: &mut UploadContext) -> AppResult<()> {
        let original = ctx.original.clone().ok_or_else(|| AppError::not_found("file_not_found", "no file to update"))?;
        let old = fs.services.db.get_file(original.id)?.size;
        let (size, pic) = (ctx.size, ctx.pic_info.clone());
        let updated = fs.services.db.update_file(original.id, move |f| {
            f.size = size;
            f.pic_info = pic;
        })?;
        if size >= old {
            fs.services.ledger.increase_unchecked(fs.user.id, size - old)?;
        } else {
            fs.services.ledger.deduct(fs.user.id, old - size)?;
        }
        ctx.record = Some(updated);
        Ok(())
    }
}

#[cfg(test)]
#[path = "hooks_tests.rs"]
mod hooks_tests;
