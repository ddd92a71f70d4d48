use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use cumulus::config::Config;
use cumulus::mail::{self, LogMailer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let cfg = Config::load()?;
    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "cumulus",
        "cumulus starting: RUST_LOG='{}', mode={:?}, listen={}, data_dir='{}'",
        rust_log, cfg.system.mode, cfg.system.listen, cfg.site.data_dir
    );
    if cfg.system.debug {
        mail::init(Arc::new(LogMailer));
    }

    let result = cumulus::server::run(cfg).await;
    mail::teardown();
    result
}
