use super::*;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::auth::{check_url, HmacAuth};
use crate::cache::Cache;
use crate::config::SiteSettings;

fn driver(dir: &Path) -> LocalDriver {
    let settings = SiteSettings { data_dir: dir.to_string_lossy().to_string(), ..Default::default() };
    let env = DriverEnv::new(Arc::new(settings), Cache::new(), HmacAuth::new("site-secret"));
    LocalDriver::new(&Policy::new(1, "local", PolicyKind::Local), &env).unwrap()
}

fn bytes(b: &'static [u8]) -> ByteStream { Box::new(b) }

#[tokio::test]
async fn put_get_roundtrip_creates_parents() {
    let tmp = tempfile::tempdir().unwrap();
    let d = driver(tmp.path());
    d.put(bytes(b"hello"), "uploads/7/a.txt", 5, &PutOptions::default()).await.unwrap();
    let mut buf = String::new();
    d.get("uploads/7/a.txt").await.unwrap().read_to_string(&mut buf).await.unwrap();
    assert_eq!(buf, "hello");
}

#[tokio::test]
async fn put_respects_disable_overwrite_and_size() {
    let tmp = tempfile::tempdir().unwrap();
    let d = driver(tmp.path());
    d.put(bytes(b"one"), "a.txt", 3, &PutOptions::default()).await.unwrap();
    let opts = PutOptions { disable_overwrite: true, ..Default::default() };
    assert!(matches!(d.put(bytes(b"two"), "a.txt", 3, &opts).await, Err(AppError::ObjectExist { .. })));

    let err = d.put(bytes(b"short"), "b.txt", 10, &PutOptions::default()).await.unwrap_err();
    assert!(matches!(err, AppError::UploadFailed { .. }));
    assert!(!tmp.path().join("b.txt").exists());
}

#[tokio::test]
async fn paths_cannot_escape_root() {
    let tmp = tempfile::tempdir().unwrap();
    let d = driver(tmp.path());
    assert!(d.resolve("../etc/passwd").is_err());
    assert!(d.resolve("a/../../b").is_err());
    assert!(d.resolve("/a/b").unwrap().starts_with(d.root()));
}

#[tokio::test]
async fn delete_reports_only_real_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let d = driver(tmp.path());
    d.put(bytes(b"x"), "a.txt", 1, &PutOptions::default()).await.unwrap();
    d.put(bytes(b"t"), "a.txt._thumb", 1, &PutOptions::default()).await.unwrap();
    let report = d.delete(&["a.txt".to_string(), "missing.txt".to_string(), "../x".to_string()]).await;
    assert_eq!(report.failed, vec!["../x".to_string()]);
    assert!(!tmp.path().join("a.txt").exists());
    assert!(!tmp.path().join("a.txt._thumb").exists());
}

#[tokio::test]
async fn source_urls_are_signed() {
    let tmp = tempfile::tempdir().unwrap();
    let d = driver(tmp.path());
    let opts = SourceOptions { ttl: 60, file_id: 12, file_name: "a b.txt".into(), ..Default::default() };
    let url = d.source("uploads/a", &opts).await.unwrap();
    assert!(url.starts_with("http://localhost:5212/api/v3/file/get/12/a%20b.txt?sign="));
    let sign = url.split("sign=").nth(1).unwrap().split('&').next().unwrap();
    let sign = urlencoding::decode(sign).unwrap();
    let expires: i64 = url.rsplit("expires=").next().unwrap().parse().unwrap();
    check_url(&HmacAuth::new("site-secret"), "/api/v3/file/get/12/a%20b.txt", &sign, Some(expires)).unwrap();

    let dl = d.source("uploads/a", &SourceOptions { is_download: true, file_id: 12, ..opts }).await.unwrap();
    let key = dl.split("/api/v3/file/download/").nth(1).unwrap().split('?').next().unwrap();
    assert_eq!(d.env.cache.get_str(key).as_deref(), Some("12"));
}

#[tokio::test]
async fn list_walks_and_hides_thumbs() {
    let tmp = tempfile::tempdir().unwrap();
    let d = driver(tmp.path());
    d.put(bytes(b"1"), "root/a.txt", 1, &PutOptions::default()).await.unwrap();
    d.put(bytes(b"1"), "root/a.txt._thumb", 1, &PutOptions::default()).await.unwrap();
    d.put(bytes(b"22"), "root/sub/b.txt", 2, &PutOptions::default()).await.unwrap();

    let flat = d.list("root", false).await.unwrap();
    assert_eq!(flat.len(), 2);
    let mut deep = d.list("root", true).await.unwrap();
    deep.sort_by(|a, b| a.source.cmp(&b.source));
    let names: Vec<_> = deep.iter().map(|o| (o.source.as_str(), o.relative_path.as_str(), o.is_dir)).collect();
    assert_eq!(names, vec![("root/a.txt", "", false), ("root/sub", "", true), ("root/sub/b.txt", "sub", false)]);
    assert!(d.list("nope", true).await.unwrap().is_empty());
}
