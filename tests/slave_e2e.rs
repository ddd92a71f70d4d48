//! Master and slave on loopback: a client-direct upload lands on the slave, the slave
//! reports back through the signed callback, and the master reads and deletes through the
//! remote driver.

use anyhow::Result;
use tempfile::tempdir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use cumulus::config::{Config, Mode};
use cumulus::driver::UploadCredential;
use cumulus::filesystem::FileSystem;
use cumulus::models::{Group, Policy, PolicyKind, User};
use cumulus::server::{self, AppState};
use cumulus::services::Services;
use cumulus::slave::{self, SlaveState};

const SECRET: &str = "e2e-shared-secret";

struct Cluster {
    master: Services,
    _dir: tempfile::TempDir,
    slave_dir: std::path::PathBuf,
}

async fn start() -> Result<Cluster> {
    let dir = tempdir()?;
    let master_listener = TcpListener::bind("127.0.0.1:0").await?;
    let slave_listener = TcpListener::bind("127.0.0.1:0").await?;
    let master_url = format!("http://{}", master_listener.local_addr()?);
    let slave_url = format!("http://{}", slave_listener.local_addr()?);

    let mut slave_cfg = Config::default();
    slave_cfg.system.mode = Mode::Slave;
    slave_cfg.slave.secret = SECRET.to_string();
    slave_cfg.site.data_dir = dir.path().join("slave").to_string_lossy().to_string();
    slave_cfg.validate()?;
    let slave_state = SlaveState::new(Services::new(&slave_cfg));
    tokio::spawn(async move { axum::serve(slave_listener, slave::router(slave_state)).await });

    let mut master_cfg = Config::default();
    master_cfg.system.session_secret = "master-secret".to_string();
    master_cfg.site.site_url = master_url;
    master_cfg.site.data_dir = dir.path().join("master").to_string_lossy().to_string();
    master_cfg.site.temp_path = dir.path().join("temp").to_string_lossy().to_string();
    let master = Services::new(&master_cfg);
    let mut policy = Policy::new(1, "slave", PolicyKind::Remote);
    policy.server = slave_url;
    policy.secret_key = SECRET.to_string();
    policy.allowed_extensions = vec!["txt".to_string()];
    master.db.insert_policy(policy);
    master.create_user(User { id: 7, email: "u@example.com".into(), nick: "u".into(), group: Group::new(1, "users", 1, 1 << 20) })?;
    let state = AppState { services: master.clone() };
    tokio::spawn(async move { axum::serve(master_listener, server::router(state)).await });

    let slave_dir = dir.path().join("slave");
    Ok(Cluster { master, _dir: dir, slave_dir })
}

fn session(c: &Cluster) -> Result<FileSystem> {
    let user = c.master.db.get_user(7)?;
    Ok(FileSystem::new(&c.master, user)?)
}

/// What a browser does with an upload credential for a slave.
async fn client_upload(cred: &UploadCredential, token: &str, name: &str, body: &'static [u8]) -> Result<reqwest::Response> {
    let resp = reqwest::Client::new()
        .post(&cred.upload_url)
        .header("Authorization", format!("Bearer {}", token))
        .header("X-Policy", &cred.policy)
        .header("X-FileName", urlencoding::encode(name).into_owned())
        .body(body)
        .send()
        .await?;
    Ok(resp)
}

#[tokio::test]
async fn direct_upload_round_trip() -> Result<()> {
    let c = start().await?;
    let mut fs = session(&c)?;
    let cred = fs.get_upload_token("/inbox", 5, "a.txt", 60).await?;
    assert_eq!(cred.path, "uploads/7/inbox");

    let resp = client_upload(&cred, &cred.token, "a.txt", b"hello").await?;
    assert_eq!(resp.status(), 200, "{}", resp.text().await?);
    assert_eq!(std::fs::read(c.slave_dir.join("uploads/7/inbox/a.txt"))?, b"hello");

    let file = fs.file_by_path("/inbox/a.txt")?;
    assert_eq!((file.size, file.source_name.as_str()), (5, "uploads/7/inbox/a.txt"));
    assert_eq!(c.master.ledger.used(7)?, 5);

    let (_, mut stream) = fs.download(file.id).await?;
    let mut body = String::new();
    stream.read_to_string(&mut body).await?;
    assert_eq!(body, "hello");

    let outcome = fs.delete(&[], &[file.id], false).await?;
    assert!(outcome.is_fully_successful());
    assert!(!c.slave_dir.join("uploads/7/inbox/a.txt").exists());
    assert_eq!(c.master.ledger.used(7)?, 0);
    Ok(())
}

#[tokio::test]
async fn forged_token_is_rejected_by_the_slave() -> Result<()> {
    let c = start().await?;
    let mut fs = session(&c)?;
    let cred = fs.get_upload_token("/", 5, "a.txt", 60).await?;

    let (digest, expires) = cred.token.rsplit_once(':').unwrap_or_default();
    let forged = format!("{}x:{}", digest, expires);
    let resp = client_upload(&cred, &forged, "a.txt", b"hello").await?;
    assert_eq!(resp.status(), 403);
    assert!(!c.slave_dir.join("uploads/7/a.txt").exists());
    assert!(fs.file_by_path("/a.txt").is_err());
    Ok(())
}

#[tokio::test]
async fn slave_enforces_the_signed_policy() -> Result<()> {
    let c = start().await?;
    let mut fs = session(&c)?;
    let cred = fs.get_upload_token("/", 5, "a.txt", 60).await?;
    // The extension allow-list travels in the signed policy.
    let resp = client_upload(&cred, &cred.token, "a.exe", b"hello").await?;
    assert_eq!(resp.status(), 403);
    assert!(fs.file_by_path("/a.exe").is_err());
    Ok(())
}

#[tokio::test]
async fn master_streams_uploads_through_the_slave() -> Result<()> {
    let c = start().await?;
    let mut fs = session(&c)?;
    let body: &'static [u8] = b"streamed through the master";
    let done = fs.upload_to(Box::new(body), "/docs/b.txt", body.len() as u64, Default::default()).await?;
    assert_eq!(std::fs::read(c.slave_dir.join(&done.save_path))?, body);
    assert!(fs.list("/docs")?.iter().any(|o| o.name == "b.txt"));
    Ok(())
}
