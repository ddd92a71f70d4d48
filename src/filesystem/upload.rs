//! The upload state machine: validate, reserve, write, commit, with a cleanup stage for
//! every failure exit.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::hooks::Stage;
use super::FileSystem;
use crate::driver::{ByteStream, PutOptions};
use crate::error::{AppError, AppResult};
use crate::ledger::CapacityGuard;
use crate::models::File;
use crate::util::{join, split_dir};

/// Per-request knobs. The guard is what makes reservation single-use across hooks.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub capacity_guard: CapacityGuard,
    pub disable_overwrite: bool,
    pub cancel: CancellationToken,
    /// Slave only: where to report a finished client-direct upload.
    pub callback_url: Option<String>,
    /// Physical destination; generated from the policy rules when absent.
    pub save_path: Option<String>,
}

/// An incoming file: the bytes plus what the client claims about them.
pub struct FileHeader {
    pub stream: ByteStream,
    pub mime_type: String,
    pub size: u64,
    pub name: String,
    /// Virtual directory the file lands in, e.g. `/docs`.
    pub virtual_path: String,
}

/// State handed to every hook of one upload.
pub struct UploadContext {
    pub stream: Option<ByteStream>,
    pub mime_type: String,
    pub size: u64,
    pub name: String,
    pub virtual_path: String,
    pub save_path: String,
    pub options: UploadOptions,
    /// The record being replaced by an in-place update.
    pub original: Option<File>,
    /// The record created or updated on success.
    pub record: Option<File>,
    pub pic_info: String,
    /// Set once the driver write has started, so cleanup knows bytes may exist.
    pub written: bool,
}

impl UploadContext {
    pub fn new(header: FileHeader, options: UploadOptions) -> Self {
        Self {
            stream: Some(header.stream),
            mime_type: header.mime_type,
            size: header.size,
            name: header.name,
            virtual_path: header.virtual_path,
            save_path: String::new(),
            options,
            original: None,
            record: None,
            pic_info: String::new(),
            written: false,
        }
    }

    /// Context for a file that already sits in the backend (client-direct uploads).
    pub fn for_existing(name: &str, virtual_path: &str, size: u64, save_path: &str) -> Self {
        Self {
            stream: None,
            mime_type: String::new(),
            size,
            name: name.to_string(),
            virtual_path: virtual_path.to_string(),
            save_path: save_path.to_string(),
            options: UploadOptions::default(),
            original: None,
            record: None,
            pic_info: String::new(),
            written: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Uploaded {
    pub save_path: String,
    pub size: u64,
    pub record: Option<File>,
}

impl FileSystem {
    /// Run the registered upload stages for one file.
    pub async fn upload(&mut self, header: FileHeader, options: UploadOptions) -> AppResult<Uploaded> {
        let ctx = UploadContext::new(header, options);
        self.run_upload(ctx).await
    }

    /// Upload `stream` to the virtual file path `path` with the default master stack.
    pub async fn upload_to(&mut self, stream: ByteStream, path: &str, size: u64, options: UploadOptions) -> AppResult<Uploaded> {
        let (dir, name) = split_dir(path);
        self.clean_hooks();
        self.use_upload_stack();
        let header = FileHeader { stream, mime_type: String::new(), size, name, virtual_path: dir };
        self.upload(header, options).await
    }

    async fn run_upload(&mut self, mut ctx: UploadContext) -> AppResult<Uploaded> {
        if let Err(e) = self.trigger(Stage::BeforeUpload, &mut ctx).await {
            self.trigger(Stage::AfterValidateFailed, &mut ctx).await?;
            return Err(e);
        }

        // A generated path never replaces an existing object.
        let generated = ctx.options.save_path.is_none();
        ctx.save_path = match ctx.options.save_path.clone() {
            Some(p) => p,
            None => join(&self.policy.generate_path(self.user.id, &ctx.virtual_path), &self.policy.generate_file_name(self.user.id, &ctx.name))
                .trim_start_matches('/')
                .to_string(),
        };

        let stream = ctx.stream.take().ok_or_else(|| AppError::upload_failed("empty_stream", "upload has no content stream"))?;
        let stream: ByteStream = Box::new(ExactSize::new(stream, ctx.size));
        let put_opts = PutOptions {
            disable_overwrite: ctx.options.disable_overwrite || generated,
            mime_type: Some(ctx.mime_type.clone()).filter(|m| !m.is_empty()),
        };
        let driver = self.driver.clone();
        let cancel = ctx.options.cancel.clone();
        ctx.written = true;
        let put = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::canceled("upload_canceled", "upload canceled by client")),
            r = driver.put(stream, &ctx.save_path, ctx.size, &put_opts) => r,
        };
        match put {
            Ok(()) => {}
            Err(e @ AppError::Canceled { .. }) => {
                tracing::debug!(path = %ctx.save_path, "upload_canceled");
                self.trigger(Stage::AfterUploadCanceled, &mut ctx).await?;
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(path = %ctx.save_path, error = %e, "upload_write_failed");
                self.trigger(Stage::AfterUploadFailed, &mut ctx).await?;
                return Err(e);
            }
        }

        if let Err(e) = self.trigger(Stage::AfterUpload, &mut ctx).await {
            self.trigger(Stage::AfterValidateFailed, &mut ctx).await?;
            return Err(e);
        }
        tracing::info!(uid = self.user.id, path = %ctx.save_path, size = ctx.size, "upload_complete");
        Ok(Uploaded { save_path: ctx.save_path, size: ctx.size, record: ctx.record })
    }

    /// Replace the bytes of an existing file, keeping its record and physical path.
    pub async fn update_content(&mut self, file_id: u64, stream: ByteStream, size: u64) -> AppResult<File> {
        let original = self.owned_file(file_id)?;
        self.switch_policy(original.policy_id)?;
        self.clean_hooks();
        self.use_update_stack();
        let virtual_path = self.services.db.folder_path(original.folder_id)?;
        let header = FileHeader { stream, mime_type: String::new(), size, name: original.name.clone(), virtual_path };
        let options = UploadOptions { save_path: Some(original.source_name.clone()), ..Default::default() };
        let mut ctx = UploadContext::new(header, options);
        ctx.original = Some(original);
        let done = self.run_upload(ctx).await?;
        done.record.ok_or_else(|| AppError::database("update_lost", "updated record missing"))
    }
}

/// Yields exactly `expected` bytes. Hooks validated and reserved the declared size, so a
/// stream that runs past it fails before the extra bytes reach the driver, and one that ends
/// early fails at EOF.
pub(crate) struct ExactSize {
    inner: ByteStream,
    expected: u64,
    seen: u64,
}

impl ExactSize {
    pub(crate) fn new(inner: ByteStream, expected: u64) -> Self { Self { inner, expected, seen: 0 } }
}

impl AsyncRead for ExactSize {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let room = buf.remaining();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = (buf.filled().len() - before) as u64;
        this.seen += n;
        if this.seen > this.expected {
            buf.set_filled(before);
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, format!("stream exceeds declared size of {} bytes", this.expected))));
        }
        if n == 0 && room > 0 && this.seen < this.expected {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!("expected {} bytes, received {}", this.expected, this.seen))));
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
#[path = "upload_tests.rs"]
mod upload_tests;
