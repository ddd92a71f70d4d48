//! Process-wide mail dispatcher.
//!
//! The active [`Mailer`] sits behind a global lock so it can be swapped when settings
//! change. Callers clone the handle out of the lock before sending, so a reload never
//! waits on an in-flight send.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{AppError, AppResult};

#[async_trait]
pub trait Mailer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, to: &str, title: &str, body: &str) -> AppResult<()>;

    /// Release connections before the mailer is replaced.
    fn close(&self) {}
}

/// Drops every message.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    fn name(&self) -> &'static str { "noop" }

    async fn send(&self, _to: &str, _title: &str, _body: &str) -> AppResult<()> { Ok(()) }
}

/// Writes messages to the log instead of delivering them.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &'static str { "log" }

    async fn send(&self, to: &str, title: &str, body: &str) -> AppResult<()> {
        if to.is_empty() {
            return Err(AppError::internal_setting("mail_no_recipient", "mail has no recipient"));
        }
        tracing::info!(to, title, bytes = body.len(), "mail_sent");
        Ok(())
    }
}

static MAILER: Lazy<RwLock<Arc<dyn Mailer>>> = Lazy::new(|| RwLock::new(Arc::new(NoopMailer)));

pub fn init(mailer: Arc<dyn Mailer>) {
    *MAILER.write() = mailer;
}

/// Swap in a new mailer, closing the old one.
pub fn reload(mailer: Arc<dyn Mailer>) {
    let old = std::mem::replace(&mut *MAILER.write(), mailer);
    old.close();
    tracing::info!(from = old.name(), to = current().name(), "mailer_reloaded");
}

/// Close the active mailer and fall back to [`NoopMailer`].
pub fn teardown() {
    let old = std::mem::replace(&mut *MAILER.write(), Arc::new(NoopMailer));
    old.close();
}

pub fn current() -> Arc<dyn Mailer> { MAILER.read().clone() }

pub async fn send(to: &str, title: &str, body: &str) -> AppResult<()> {
    let mailer = current();
    mailer.send(to, title, body).await
}

#[cfg(test)]
#[path = "mail_tests.rs"]
mod mail_tests;
