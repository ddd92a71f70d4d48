//! Storage policies: which backend holds the bytes, its credentials, limits and naming rules.

use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::util::{clean_path, file_ext, rand_string};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Local,
    Remote,
    S3,
    Oss,
    Cos,
    OneDrive,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Local => "local",
            PolicyKind::Remote => "remote",
            PolicyKind::S3 => "s3",
            PolicyKind::Oss => "oss",
            PolicyKind::Cos => "cos",
            PolicyKind::OneDrive => "onedrive",
        }
    }
}

impl FromStr for PolicyKind {
    type Err = AppError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(PolicyKind::Local),
            "remote" => Ok(PolicyKind::Remote),
            "s3" => Ok(PolicyKind::S3),
            "oss" => Ok(PolicyKind::Oss),
            "cos" => Ok(PolicyKind::Cos),
            "onedrive" => Ok(PolicyKind::OneDrive),
            other => Err(AppError::internal_setting("unknown_policy_type", format!("unknown storage policy type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PolicyKind,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Bytes; `0` means unlimited.
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub auto_rename: bool,
    #[serde(default)]
    pub dir_name_rule: String,
    #[serde(default)]
    pub file_name_rule: String,
    /// Lowercase, without the dot. Empty allows every extension.
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub region: String,
}

const IMAGE_THUMB_EXTS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

impl Policy {
    pub fn new(id: u64, name: &str, kind: PolicyKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            server: String::new(),
            bucket_name: String::new(),
            is_private: true,
            base_url: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            max_size: 0,
            auto_rename: false,
            dir_name_rule: "uploads/{uid}/{path}".to_string(),
            file_name_rule: "{randomkey8}_{originname}".to_string(),
            allowed_extensions: vec![],
            region: String::new(),
        }
    }

    /// Expand the directory rule for an upload into `origin_path` (a virtual directory).
    pub fn generate_path(&self, uid: u64, origin_path: &str) -> String {
        let now = Local::now();
        let mut out = expand_common(&self.dir_name_rule, uid, &now);
        let origin = origin_path.trim_start_matches('/');
        out = out.replace("{path}", &format!("{}/", origin));
        clean_path(&out).trim_start_matches('/').to_string()
    }

    /// Expand the file name rule. Without `auto_rename` the origin name is kept.
    pub fn generate_file_name(&self, uid: u64, origin: &str) -> String {
        let origin = self.origin_name_rule(origin);
        if !self.auto_rename { return origin; }
        let now = Local::now();
        expand_common(&self.file_name_rule, uid, &now).replace("{originname}", &origin)
    }

    /// Providers substitute their own placeholder when the client name is not yet known.
    fn origin_name_rule(&self, origin: &str) -> String {
        if origin.is_empty() {
            match self.kind {
                PolicyKind::Oss | PolicyKind::Cos => return "${filename}".to_string(),
                _ => {}
            }
        }
        origin.to_string()
    }

    pub fn is_thumb_exist(&self, name: &str) -> bool {
        match self.kind {
            PolicyKind::OneDrive => true,
            PolicyKind::Local | PolicyKind::Remote | PolicyKind::Cos | PolicyKind::Oss => {
                file_ext(name).map(|e| IMAGE_THUMB_EXTS.contains(&e.as_str())).unwrap_or(false)
            }
            PolicyKind::S3 => false,
        }
    }

    /// Whether an upload of `size` bytes must stream through this service.
    pub fn is_transit_upload(&self, size: u64) -> bool {
        match self.kind {
            PolicyKind::Local => true,
            PolicyKind::OneDrive => size < 4 * 1024 * 1024,
            _ => false,
        }
    }

    /// Save paths are pre-generated for everything except slaves, which name files themselves.
    pub fn is_path_generate_needed(&self) -> bool { self.kind != PolicyKind::Remote }
    pub fn is_thumb_generate_needed(&self) -> bool { self.kind == PolicyKind::Local }
    pub fn can_structure_be_listed(&self) -> bool { !matches!(self.kind, PolicyKind::Local | PolicyKind::Remote) }

    pub fn upload_url(&self) -> String {
        match self.kind {
            PolicyKind::Local | PolicyKind::OneDrive => "/api/v3/file/upload".to_string(),
            PolicyKind::Remote => format!("{}/api/v3/slave/upload", self.server.trim_end_matches('/')),
            PolicyKind::Oss => format!("https://{}.{}", self.bucket_name, self.server),
            PolicyKind::Cos => self.server.clone(),
            PolicyKind::S3 => {
                if self.server.is_empty() {
                    format!("https://{}.s3.{}.amazonaws.com/", self.bucket_name, self.region)
                } else {
                    format!("{}/{}", self.server.trim_end_matches('/'), self.bucket_name)
                }
            }
        }
    }
}

fn expand_common(rule: &str, uid: u64, now: &DateTime<Local>) -> String {
    rule.replace("{randomkey16}", &rand_string(16))
        .replace("{randomkey8}", &rand_string(8))
        .replace("{timestamp_nano}", &now.timestamp_nanos_opt().unwrap_or_default().to_string())
        .replace("{timestamp}", &now.timestamp().to_string())
        .replace("{uid}", &uid.to_string())
        .replace("{datetime}", &now.format("%Y%m%d%H%M%S").to_string())
        .replace("{date}", &now.format("%Y%m%d").to_string())
        .replace("{year}", &now.format("%Y").to_string())
        .replace("{month}", &now.format("%m").to_string())
        .replace("{day}", &now.format("%d").to_string())
        .replace("{hour}", &now.format("%H").to_string())
        .replace("{minute}", &now.format("%M").to_string())
        .replace("{second}", &now.format("%S").to_string())
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod policy_tests;
