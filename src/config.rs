//! Process configuration: a JSON file layered with `CUMULUS_*` environment overrides.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{Policy, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode { Master, Slave }

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Mode::Master),
            "slave" => Ok(Mode::Slave),
            other => anyhow::bail!("unknown mode '{}' (expected master|slave)", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemConfig {
    pub mode: Mode,
    pub listen: String,
    pub debug: bool,
    /// Secret used for master-issued signed URLs.
    pub session_secret: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self { mode: Mode::Master, listen: "0.0.0.0:5212".to_string(), debug: false, session_secret: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlaveConfig {
    /// Shared secret; the master's remote policy carries the same value as `secret_key`.
    pub secret: String,
    /// Seconds allowed for the upload-complete callback to the master.
    pub callback_timeout: u64,
    /// Lifetime of a signature the slave issues on its own callbacks.
    pub signature_ttl: u64,
    /// Maximum skew between a signed request's timestamp and local time.
    pub replay_window: u64,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self { secret: String::new(), callback_timeout: 20, signature_ttl: 60, replay_window: 300 }
    }
}

/// Site-wide settings that the engine reads on every operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SiteSettings {
    pub site_url: String,
    pub temp_path: String,
    /// Root directory of the local driver; physical paths are resolved beneath it.
    pub data_dir: String,
    pub archive_timeout: u64,
    pub download_timeout: u64,
    pub preview_timeout: u64,
    pub upload_credential_timeout: u64,
    pub upload_session_timeout: u64,
    pub slave_api_timeout: u64,
    pub thumb_suffix: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            site_url: "http://localhost:5212".to_string(),
            temp_path: "temp".to_string(),
            data_dir: "uploads".to_string(),
            archive_timeout: 30,
            download_timeout: 60,
            preview_timeout: 60,
            upload_credential_timeout: 3_600,
            upload_session_timeout: 86_400,
            slave_api_timeout: 60,
            thumb_suffix: "._thumb".to_string(),
        }
    }
}

/// Records loaded into the metadata store at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Seed {
    pub policies: Vec<Policy>,
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub system: SystemConfig,
    pub slave: SlaveConfig,
    pub site: SiteSettings,
    pub seed: Seed,
}

impl Config {
    /// Load from `CUMULUS_CONFIG` (default `cumulus.json`), then apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CUMULUS_CONFIG").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("cumulus.json"));
        let mut cfg = Self::from_file(&path)?;
        cfg.apply_overrides(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// Missing file yields defaults; a malformed file is an error.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() { return Ok(Self::default()); }
        let bytes = std::fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
        let cfg = serde_json::from_slice::<Config>(&bytes).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, get: F) -> anyhow::Result<()> {
        if let Some(m) = get("CUMULUS_MODE") { self.system.mode = m.parse()?; }
        if let Some(l) = get("CUMULUS_LISTEN") { self.system.listen = l; }
        if let Some(s) = get("CUMULUS_SLAVE_SECRET") { self.slave.secret = s; }
        if let Some(d) = get("CUMULUS_DATA_DIR") { self.site.data_dir = d; }
        if let Some(s) = get("CUMULUS_SESSION_SECRET") { self.system.session_secret = s; }
        Ok(())
    }

    /// Slave mode cannot run without a shared secret.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.system.mode == Mode::Slave && self.slave.secret.is_empty() {
            anyhow::bail!("slave mode requires slave.secret (or CUMULUS_SLAVE_SECRET)");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
