//! Object name, size and extension checks applied before any byte is written.

use unicode_normalization::UnicodeNormalization;

use crate::error::{AppError, AppResult};
use crate::util::file_ext;

const RESERVED: [char; 9] = ['\\', '?', '*', '<', '"', ':', '>', '/', '|'];

/// Canonical (NFC) form of a user-supplied name.
pub fn normalize_name(name: &str) -> String { name.nfc().collect() }

pub fn is_legal_name(name: &str) -> bool {
    !name.is_empty() && name.chars().count() < 256 && !name.ends_with(' ') && !name.contains(&RESERVED[..]) && name != "." && name != ".."
}

/// `max_size == 0` is unlimited.
pub fn is_size_allowed(size: u64, max_size: u64) -> bool { max_size == 0 || size <= max_size }

/// Case-insensitive allow-list; an empty list allows everything.
pub fn is_extension_allowed(name: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() { return true; }
    match file_ext(name) {
        Some(ext) => allowed.iter().any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(&ext)),
        None => false,
    }
}

pub fn check_name(name: &str) -> AppResult<()> {
    if !is_legal_name(name) {
        return Err(AppError::policy_not_allowed("illegal_object_name", format!("'{}' is not a valid object name", name)));
    }
    Ok(())
}

pub fn check_upload(name: &str, size: u64, max_size: u64, allowed: &[String]) -> AppResult<()> {
    check_name(name)?;
    if !is_size_allowed(size, max_size) {
        return Err(AppError::upload_failed("file_too_large", format!("{} bytes exceeds the {} byte limit", size, max_size)));
    }
    if !is_extension_allowed(name, allowed) {
        return Err(AppError::policy_not_allowed("file_type_not_allowed", format!("'{}' has a disallowed extension", name)));
    }
    Ok(())
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod validator_tests;
