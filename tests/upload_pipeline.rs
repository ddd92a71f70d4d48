//! Upload pipeline against the local driver through the public API.

use anyhow::Result;
use tempfile::tempdir;

use cumulus::config::Config;
use cumulus::error::AppError;
use cumulus::filesystem::{FileSystem, UploadOptions};
use cumulus::models::{Group, Policy, PolicyKind, User};
use cumulus::services::Services;

fn services(dir: &std::path::Path, limit: u64) -> Result<Services> {
    let mut cfg = Config::default();
    cfg.system.session_secret = "pipeline".to_string();
    cfg.site.data_dir = dir.join("data").to_string_lossy().to_string();
    cfg.site.temp_path = dir.join("temp").to_string_lossy().to_string();
    let s = Services::new(&cfg);
    s.db.insert_policy(Policy::new(1, "local", PolicyKind::Local));
    s.create_user(User { id: 1, email: "a@example.com".into(), nick: "a".into(), group: Group::new(1, "users", 1, limit) })?;
    Ok(s)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_never_overshoot_the_quota() -> Result<()> {
    let dir = tempdir()?;
    let s = services(dir.path(), 550)?;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let s = s.clone();
        tasks.push(tokio::spawn(async move {
            let mut fs = FileSystem::new(&s, s.db.get_user(1)?)?;
            let body: Vec<u8> = vec![i as u8; 100];
            fs.upload_to(Box::new(std::io::Cursor::new(body)), &format!("/f{}.bin", i), 100, UploadOptions::default()).await
        }));
    }
    let mut ok = 0;
    for r in futures::future::join_all(tasks).await {
        match r? {
            Ok(_) => ok += 1,
            Err(AppError::QuotaExceeded { .. }) => {}
            Err(e) => panic!("unexpected upload error: {}", e),
        }
    }
    assert_eq!(ok, 5);

    let stats = s.ledger.stats(1)?;
    assert_eq!(stats.used, 500);
    assert_eq!(stats.reserved_total, stats.committed_total + stats.released_total);

    let fs = FileSystem::new(&s, s.db.get_user(1)?)?;
    let listed = fs.list("/")?;
    assert_eq!(listed.len(), 5);
    assert_eq!(listed.iter().map(|o| o.size).sum::<u64>(), stats.used);
    Ok(())
}

#[tokio::test]
async fn delete_then_reupload_reuses_the_capacity() -> Result<()> {
    let dir = tempdir()?;
    let s = services(dir.path(), 10)?;
    let mut fs = FileSystem::new(&s, s.db.get_user(1)?)?;

    let first = fs.upload_to(Box::new(&b"0123456789"[..]), "/a.bin", 10, UploadOptions::default()).await?;
    assert!(fs.upload_to(Box::new(&b"x"[..]), "/b.bin", 1, UploadOptions::default()).await.is_err());

    let id = first.record.map(|f| f.id).unwrap_or_default();
    assert!(fs.delete(&[], &[id], false).await?.is_fully_successful());
    assert!(!dir.path().join("data").join(&first.save_path).exists());
    fs.upload_to(Box::new(&b"x"[..]), "/b.bin", 1, UploadOptions::default()).await?;
    assert_eq!(s.ledger.used(1)?, 1);
    Ok(())
}
