//! Unified application error model and mapping helpers.
//! Every session operation, driver and hook returns `AppError`; the numeric codes are the
//! wire codes carried in JSON envelopes between master, slave and clients.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    NotFound { code: String, message: String },
    ObjectExist { code: String, message: String },
    CredentialInvalid { code: String, message: String },
    SignExpired { code: String, message: String },
    UploadFailed { code: String, message: String },
    CreateFolderFailed { code: String, message: String },
    PolicyNotAllowed { code: String, message: String },
    GroupNotAllowed { code: String, message: String },
    QuotaExceeded { code: String, message: String },
    Canceled { code: String, message: String },
    NotImplemented { code: String, message: String },
    Database { code: String, message: String },
    Encrypt { code: String, message: String },
    Io { code: String, message: String },
    InternalSetting { code: String, message: String },
    Cache { code: String, message: String },
    Callback { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::NotFound { code, .. }
            | AppError::ObjectExist { code, .. }
            | AppError::CredentialInvalid { code, .. }
            | AppError::SignExpired { code, .. }
            | AppError::UploadFailed { code, .. }
            | AppError::CreateFolderFailed { code, .. }
            | AppError::PolicyNotAllowed { code, .. }
            | AppError::GroupNotAllowed { code, .. }
            | AppError::QuotaExceeded { code, .. }
            | AppError::Canceled { code, .. }
            | AppError::NotImplemented { code, .. }
            | AppError::Database { code, .. }
            | AppError::Encrypt { code, .. }
            | AppError::Io { code, .. }
            | AppError::InternalSetting { code, .. }
            | AppError::Cache { code, .. }
            | AppError::Callback { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::NotFound { message, .. }
            | AppError::ObjectExist { message, .. }
            | AppError::CredentialInvalid { message, .. }
            | AppError::SignExpired { message, .. }
            | AppError::UploadFailed { message, .. }
            | AppError::CreateFolderFailed { message, .. }
            | AppError::PolicyNotAllowed { message, .. }
            | AppError::GroupNotAllowed { message, .. }
            | AppError::QuotaExceeded { message, .. }
            | AppError::Canceled { message, .. }
            | AppError::NotImplemented { message, .. }
            | AppError::Database { message, .. }
            | AppError::Encrypt { message, .. }
            | AppError::Io { message, .. }
            | AppError::InternalSetting { message, .. }
            | AppError::Cache { message, .. }
            | AppError::Callback { message, .. } => message.as_str(),
        }
    }

    pub fn not_found<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn object_exist<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::ObjectExist { code: code.into(), message: msg.into() } }
    pub fn credential_invalid<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::CredentialInvalid { code: code.into(), message: msg.into() } }
    pub fn sign_expired<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::SignExpired { code: code.into(), message: msg.into() } }
    pub fn upload_failed<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::UploadFailed { code: code.into(), message: msg.into() } }
    pub fn create_folder_failed<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::CreateFolderFailed { code: code.into(), message: msg.into() } }
    pub fn policy_not_allowed<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::PolicyNotAllowed { code: code.into(), message: msg.into() } }
    pub fn group_not_allowed<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::GroupNotAllowed { code: code.into(), message: msg.into() } }
    pub fn quota_exceeded<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::QuotaExceeded { code: code.into(), message: msg.into() } }
    pub fn canceled<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Canceled { code: code.into(), message: msg.into() } }
    pub fn not_implemented<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::NotImplemented { code: code.into(), message: msg.into() } }
    pub fn database<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Database { code: code.into(), message: msg.into() } }
    pub fn encrypt<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Encrypt { code: code.into(), message: msg.into() } }
    pub fn io<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal_setting<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::InternalSetting { code: code.into(), message: msg.into() } }
    pub fn cache<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Cache { code: code.into(), message: msg.into() } }
    pub fn callback<C: Into<String>, M: Into<String>>(code: C, msg: M) -> Self { AppError::Callback { code: code.into(), message: msg.into() } }

    /// Numeric wire code used in JSON response envelopes.
    pub fn code_num(&self) -> i32 {
        match self {
            AppError::NotFound { .. } => 404,
            AppError::CredentialInvalid { .. } => 40001,
            AppError::UploadFailed { .. } | AppError::QuotaExceeded { .. } | AppError::Canceled { .. } => 40002,
            AppError::CreateFolderFailed { .. } => 40003,
            AppError::ObjectExist { .. } => 40004,
            AppError::SignExpired { .. } => 40005,
            AppError::PolicyNotAllowed { .. } | AppError::NotImplemented { .. } => 40006,
            AppError::GroupNotAllowed { .. } => 40007,
            AppError::Database { .. } => 50001,
            AppError::Encrypt { .. } => 50002,
            AppError::Io { .. } => 50004,
            AppError::InternalSetting { .. } => 50005,
            AppError::Cache { .. } => 50006,
            AppError::Callback { .. } => 50007,
        }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::NotFound { .. } => 404,
            AppError::ObjectExist { .. } => 409,
            AppError::CredentialInvalid { .. } | AppError::SignExpired { .. } => 403,
            AppError::PolicyNotAllowed { .. } | AppError::GroupNotAllowed { .. } => 403,
            AppError::UploadFailed { .. } | AppError::CreateFolderFailed { .. } => 400,
            AppError::QuotaExceeded { .. } => 413,
            AppError::Canceled { .. } => 499,
            AppError::NotImplemented { .. } => 501,
            AppError::Io { .. } => 503,
            AppError::Database { .. }
            | AppError::Encrypt { .. }
            | AppError::InternalSetting { .. }
            | AppError::Cache { .. }
            | AppError::Callback { .. } => 500,
        }
    }

    /// Signature and TTL failures are expected on replays; log them quietly.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, AppError::CredentialInvalid { .. } | AppError::SignExpired { .. })
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Io { code: "io_failed".into(), message: err.to_string() }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound { code: "object_not_found".into(), message: err.to_string() },
            std::io::ErrorKind::AlreadyExists => AppError::ObjectExist { code: "object_exist".into(), message: err.to_string() },
            _ => AppError::Io { code: "io_failed".into(), message: err.to_string() },
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Io { code: "http_request_failed".into(), message: err.to_string() }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Io { code: "decode_failed".into(), message: err.to_string() }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
