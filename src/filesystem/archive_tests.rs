use super::*;
use std::collections::BTreeSet;
use std::io::Read;

use crate::filesystem::test_support::{put_file, Fixture};

fn zip_names(path: &Path) -> BTreeSet<String> {
    let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    (0..archive.len()).map(|i| archive.by_index(i).unwrap().name().to_string()).collect()
}

fn zip_entry(path: &Path, name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut buf = Vec::new();
    archive.by_name(name).unwrap().read_to_end(&mut buf).unwrap();
    buf
}

async fn seeded(fx: &Fixture) -> (FileSystem, u64, u64) {
    let mut fs = fx.fs();
    let d = fs.create_directory("/d").unwrap();
    put_file(&mut fs, "/d/a.txt", b"alpha").await;
    put_file(&mut fs, "/d/e/b.txt", b"beta").await;
    let top = put_file(&mut fs, "/top.txt", b"top").await;
    (fs, d.id, top.id)
}

#[tokio::test(flavor = "multi_thread")]
async fn compress_keeps_folder_structure() {
    let fx = Fixture::new(1 << 20);
    let (mut fs, dir, top) = seeded(&fx).await;
    let zip = fs.compress(&[dir], &[top]).await.unwrap();
    assert!(zip.starts_with(fx.tmp.path().join("temp").join("archive")));

    let expected: BTreeSet<String> = ["d/", "d/a.txt", "d/e/", "d/e/b.txt", "top.txt"].iter().map(|s| s.to_string()).collect();
    assert_eq!(zip_names(&zip), expected);
    assert_eq!(zip_entry(&zip, "d/e/b.txt"), b"beta");
}

#[tokio::test(flavor = "multi_thread")]
async fn compress_skips_unreadable_members() {
    let fx = Fixture::new(1 << 20);
    let (mut fs, _, top) = seeded(&fx).await;
    let gone = put_file(&mut fs, "/gone.txt", b"x").await;
    std::fs::remove_file(fx.tmp.path().join("data").join(&gone.source_name)).unwrap();
    let zip = fs.compress(&[], &[top, gone.id]).await.unwrap();
    assert_eq!(zip_names(&zip), BTreeSet::from(["top.txt".to_string()]));
}

#[tokio::test]
async fn empty_selection_is_not_found() {
    let fx = Fixture::new(1 << 20);
    let mut fs = fx.fs();
    assert!(matches!(fs.compress(&[], &[42]).await, Err(AppError::NotFound { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn archive_link_resolves_to_the_temp_file() {
    let fx = Fixture::new(1 << 20);
    let (mut fs, dir, _) = seeded(&fx).await;
    let url = fs.create_archive(&[dir], &[]).await.unwrap();
    assert!(url.starts_with("http://localhost:5212/api/v3/file/archive/"));
    assert!(url.contains("/archive.zip?sign="));

    let id = url.split('/').rev().nth(1).unwrap();
    let handle = ArchiveHandle::lookup(&fx.services.cache, id).unwrap();
    assert!(!handle.one_time);
    assert!(Path::new(&handle.path).exists());
    // Reusable until it expires.
    ArchiveHandle::open(&fx.services.cache, id).await.unwrap();
    assert!(ArchiveHandle::open(&fx.services.cache, id).await.is_ok());
}

#[tokio::test]
async fn one_time_handles_are_consumed_by_the_first_open() {
    let dir = tempfile::tempdir().unwrap();
    let zip = dir.path().join("x.zip");
    std::fs::write(&zip, b"PK").unwrap();
    let cache = Cache::new();
    let handle = ArchiveHandle { path: zip.to_string_lossy().to_string(), one_time: true };
    cache.set_json(ArchiveHandle::cache_key("abc"), &handle, None).unwrap();
    ArchiveHandle::open(&cache, "abc").await.unwrap();
    assert!(matches!(ArchiveHandle::open(&cache, "abc").await, Err(AppError::NotFound { .. })));
}

#[tokio::test]
async fn failed_open_keeps_a_one_time_handle() {
    let dir = tempfile::tempdir().unwrap();
    let zip = dir.path().join("late.zip");
    let cache = Cache::new();
    let handle = ArchiveHandle { path: zip.to_string_lossy().to_string(), one_time: true };
    cache.set_json(ArchiveHandle::cache_key("abc"), &handle, None).unwrap();

    assert!(ArchiveHandle::open(&cache, "abc").await.is_err());
    assert_eq!(ArchiveHandle::lookup(&cache, "abc"), Some(handle));
    std::fs::write(&zip, b"PK").unwrap();
    ArchiveHandle::open(&cache, "abc").await.unwrap();
    assert_eq!(ArchiveHandle::lookup(&cache, "abc"), None);
}

#[tokio::test]
async fn archive_download_needs_group_permission() {
    let fx = Fixture::new(1 << 20);
    let mut fs = fx.fs();
    fs.user.group.archive_download = false;
    let err = fs.create_archive(&[], &[1]).await.unwrap_err();
    assert!(matches!(err, AppError::GroupNotAllowed { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn compress_into_then_decompress_round_trips_the_tree() {
    let fx = Fixture::new(1 << 20);
    let (mut fs, dir, top) = seeded(&fx).await;
    let archive = fs.compress_into(&[dir], &[top], "/archives", "bundle.zip").await.unwrap();
    assert_eq!(fs.file_by_path("/archives/bundle.zip").unwrap().id, archive.id);
    let leftovers = std::fs::read_dir(fx.tmp.path().join("temp").join("archive")).unwrap().count();
    assert_eq!(leftovers, 0);

    fs.create_directory("/restored").unwrap();
    let stored = fs.decompress(archive.id, "/restored").await.unwrap();
    assert_eq!(stored, 3);
    let b = fs.file_by_path("/restored/d/e/b.txt").unwrap();
    assert_eq!(b.size, 4);
    assert!(fs.file_by_path("/restored/top.txt").is_ok());
    let work = std::fs::read_dir(fx.tmp.path().join("temp").join("decompress")).unwrap().count();
    assert_eq!(work, 0);

    let recorded: u64 = [("/d/a.txt", 5u64), ("/d/e/b.txt", 4), ("/top.txt", 3)].iter().map(|(_, s)| s * 2).sum();
    assert_eq!(fx.used(), recorded + archive.size);
}

#[tokio::test(flavor = "multi_thread")]
async fn decompress_skips_members_that_already_exist() {
    let fx = Fixture::new(1 << 20);
    let (mut fs, _, top) = seeded(&fx).await;
    let archive = fs.compress_into(&[], &[top], "/", "one.zip").await.unwrap();
    // `/top.txt` is still there, so its member is skipped.
    assert_eq!(fs.decompress(archive.id, "/").await.unwrap(), 0);
    assert!(matches!(fs.decompress(archive.id, "/nowhere").await, Err(AppError::NotFound { .. })));
}
