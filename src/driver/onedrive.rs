//! OneDrive backend over Microsoft Graph. The policy's `access_key` carries the bearer
//! token; `server`, when set, replaces the Graph drive root.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};

use super::{require, ByteStream, DeleteReport, Driver, DriverEnv, PutOptions, RawObject, SourceOptions, ThumbContent, TokenRequest, UploadCredential};
use crate::error::{AppError, AppResult};
use crate::models::{Policy, PolicyKind};
use super::s3::encode_key as encode_path;

const GRAPH_DRIVE: &str = "https://graph.microsoft.com/v1.0/me/drive";
/// Graph accepts single-request uploads below 4 MiB.
pub const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;
/// Upload session chunks must be multiples of 320 KiB.
const CHUNK_SIZE: usize = 32 * 320 * 1024;

#[derive(Debug, Deserialize)]
struct DriveItem {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    folder: Option<serde_json::Value>,
    #[serde(rename = "lastModifiedDateTime")]
    last_modified: Option<DateTime<Utc>>,
    #[serde(rename = "@microsoft.graph.downloadUrl", default)]
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadSession {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
    #[serde(rename = "expirationDateTime")]
    expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

pub struct OneDriveDriver {
    policy: Policy,
    base: String,
    env: DriverEnv,
}

impl OneDriveDriver {
    pub fn new(policy: &Policy, env: &DriverEnv) -> AppResult<Self> {
        require("access_key", &policy.access_key, PolicyKind::OneDrive)?;
        let base = if policy.server.is_empty() { GRAPH_DRIVE.to_string() } else { policy.server.trim_end_matches('/').to_string() };
        Ok(Self { policy: policy.clone(), base, env: env.clone() })
    }

    /// Item address for a drive path, e.g. `/root:/a/b.txt:`.
    pub fn item_url(&self, path: &str, suffix: &str) -> String {
        let p = path.trim_matches('/');
        if p.is_empty() {
            format!("{}/root{}", self.base, suffix.trim_start_matches(':'))
        } else {
            format!("{}/root:/{}:{}", self.base, encode_path(p), suffix)
        }
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.env.http.request(method, url).bearer_auth(&self.policy.access_key)
    }

    async fn check(resp: reqwest::Response) -> AppResult<reqwest::Response> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(AppError::not_found("object_not_found", "item not found in drive")),
            StatusCode::CONFLICT => Err(AppError::object_exist("object_exist", "item already exists in drive")),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AppError::credential_invalid("drive_token_rejected", "graph rejected the access token")),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(AppError::io("graph_request_failed", format!("{}: {}", s, body.chars().take(200).collect::<String>())))
            }
        }
    }

    async fn create_session(&self, path: &str, overwrite: bool) -> AppResult<UploadSession> {
        let behavior = if overwrite { "replace" } else { "fail" };
        let body = json!({ "item": { "@microsoft.graph.conflictBehavior": behavior } });
        let resp = self.request(Method::POST, &self.item_url(path, ":/createUploadSession")).json(&body).send().await?;
        Ok(Self::check(resp).await?.json::<UploadSession>().await?)
    }

    async fn upload_chunks(&self, mut stream: ByteStream, upload_url: &str, size: u64) -> AppResult<()> {
        let mut offset = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while offset < size {
            let want = ((size - offset) as usize).min(CHUNK_SIZE);
            stream.read_exact(&mut buf[..want]).await?;
            let end = offset + want as u64 - 1;
            // The session URL is pre-authorized; no bearer token.
            let resp = self
                .env
                .http
                .put(upload_url)
                .header(CONTENT_LENGTH, want)
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end, size))
                .body(buf[..want].to_vec())
                .send()
                .await?;
            Self::check(resp).await?;
            offset += want as u64;
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> AppResult<Vec<DriveItem>> {
        let mut url = Some(self.item_url(path, ":/children"));
        let mut items = Vec::new();
        while let Some(u) = url.take() {
            let page = Self::check(self.request(Method::GET, &u).send().await?).await?.json::<ItemPage>().await?;
            items.extend(page.value);
            url = page.next;
        }
        Ok(items)
    }
}

#[async_trait]
impl Driver for OneDriveDriver {
    fn kind(&self) -> PolicyKind { PolicyKind::OneDrive }

    async fn get(&self, path: &str) -> AppResult<ByteStream> {
        let resp = Self::check(self.request(Method::GET, &self.item_url(path, ":/content")).send().await?).await?;
        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn put(&self, stream: ByteStream, dst: &str, size: u64, opts: &PutOptions) -> AppResult<()> {
        if size < SIMPLE_UPLOAD_LIMIT {
            let behavior = if opts.disable_overwrite { "fail" } else { "replace" };
            let url = format!("{}?@microsoft.graph.conflictBehavior={}", self.item_url(dst, ":/content"), behavior);
            let resp = self
                .request(Method::PUT, &url)
                .header(CONTENT_LENGTH, size)
                .body(reqwest::Body::wrap_stream(ReaderStream::new(stream)))
                .send()
                .await?;
            Self::check(resp).await?;
            return Ok(());
        }
        let session = self.create_session(dst, !opts.disable_overwrite).await?;
        self.upload_chunks(stream, &session.upload_url, size).await
    }

    async fn delete(&self, paths: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for p in paths {
            let res = match self.request(Method::DELETE, &self.item_url(p, "")).send().await {
                Ok(resp) => Self::check(resp).await.map(|_| ()),
                Err(e) => Err(e.into()),
            };
            match res {
                Ok(()) | Err(AppError::NotFound { .. }) => {}
                Err(e) => {
                    report.failed.push(p.clone());
                    report.error = Some(e);
                }
            }
        }
        report
    }

    async fn thumb(&self, path: &str) -> AppResult<ThumbContent> {
        let resp = Self::check(self.request(Method::GET, &self.item_url(path, ":/thumbnails/0/large")).send().await?).await?;
        Ok(ThumbContent::Redirect(resp.json::<Thumbnail>().await?.url))
    }

    async fn source(&self, path: &str, _opts: &SourceOptions) -> AppResult<String> {
        let resp = Self::check(self.request(Method::GET, &self.item_url(path, "")).send().await?).await?;
        resp.json::<DriveItem>()
            .await?
            .download_url
            .ok_or_else(|| AppError::not_found("source_unavailable", "drive item has no download url"))
    }

    async fn token(&self, req: &TokenRequest) -> AppResult<UploadCredential> {
        let session = self.create_session(&req.save_path, false).await?;
        let site = self.env.settings.site_url.trim_end_matches('/');
        Ok(UploadCredential {
            path: req.save_path.clone(),
            key_time: session.expiration.map(|t| t.timestamp().to_string()).unwrap_or_default(),
            callback: format!("{}/api/v3/callback/storage/{}", site, req.callback_key),
            key: req.callback_key.clone(),
            upload_url: session.upload_url,
            ..Default::default()
        })
    }

    async fn list(&self, path: &str, recursive: bool) -> AppResult<Vec<RawObject>> {
        let base = path.trim_matches('/').to_string();
        let mut out = Vec::new();
        let mut queue = vec![String::new()];
        while let Some(rel) = queue.pop() {
            let dir = [base.as_str(), rel.as_str()].iter().filter(|s| !s.is_empty()).copied().collect::<Vec<_>>().join("/");
            for item in self.children(&dir).await? {
                let is_dir = item.folder.is_some();
                let source = if dir.is_empty() { item.name.clone() } else { format!("{}/{}", dir, item.name) };
                if is_dir && recursive {
                    queue.push(if rel.is_empty() { item.name.clone() } else { format!("{}/{}", rel, item.name) });
                }
                out.push(RawObject {
                    name: item.name,
                    relative_path: rel.clone(),
                    source,
                    size: item.size,
                    is_dir,
                    last_modify: item.last_modified.unwrap_or_else(Utc::now),
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "onedrive_tests.rs"]
mod onedrive_tests;
