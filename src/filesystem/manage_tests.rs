use super::*;
use tokio::io::AsyncReadExt;

use crate::filesystem::test_support::{put_file, Fixture, LOCAL, MEMORY, UID};
use crate::models::ObjectKind;

async fn read_all(fs: &FileSystem, id: u64) -> Vec<u8> {
    let (_, mut stream) = fs.download(id).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    buf
}

fn sorted(mut v: Vec<u64>) -> Vec<u64> {
    v.sort_unstable();
    v
}

#[tokio::test]
async fn list_puts_folders_first_sorted_by_name() {
    let fx = Fixture::new(1_000);
    let mut fs = fx.fs();
    put_file(&mut fs, "/b.txt", b"b").await;
    put_file(&mut fs, "/a.txt", b"a").await;
    fs.create_directory("/zeta").unwrap();
    fs.create_directory("/alpha").unwrap();

    let names: Vec<(String, ObjectKind)> = fs.list("/").unwrap().into_iter().map(|o| (o.name, o.kind)).collect();
    assert_eq!(
        names,
        vec![
            ("alpha".to_string(), ObjectKind::Dir),
            ("zeta".to_string(), ObjectKind::Dir),
            ("a.txt".to_string(), ObjectKind::File),
            ("b.txt".to_string(), ObjectKind::File),
        ]
    );
    assert!(matches!(fs.list("/missing"), Err(AppError::NotFound { .. })));
}

#[test]
fn create_directory_builds_parents_once() {
    let fx = Fixture::new(1_000);
    let fs = fx.fs();
    let c = fs.create_directory("/a/b/c").unwrap();
    assert_eq!(fx.services.db.folder_path(c.id).unwrap(), "/a/b/c");
    assert!(matches!(fs.create_directory("/a/b/c"), Err(AppError::ObjectExist { .. })));
    assert!(matches!(fs.create_directory("/"), Err(AppError::ObjectExist { .. })));
    assert!(matches!(fs.create_directory("/a/b:c"), Err(AppError::PolicyNotAllowed { .. })));
    // Existing parents are reused.
    assert_eq!(fs.ensure_directory("/a/b").unwrap().id, c.parent_id.unwrap());
}

#[tokio::test]
async fn rename_exactly_one_object() {
    let fx = Fixture::with_local(1_000, |p| p.allowed_extensions = vec!["txt".into()]);
    let mut fs = fx.fs();
    let f = put_file(&mut fs, "/a.txt", b"a").await;
    let d = fs.create_directory("/docs").unwrap();

    fs.rename(&[], &[f.id], "b.txt").unwrap();
    assert!(fs.file_by_path("/b.txt").is_ok());
    assert!(matches!(fs.rename(&[], &[f.id], "b.exe"), Err(AppError::PolicyNotAllowed { .. })));
    assert!(matches!(fs.rename(&[d.id], &[f.id], "x"), Err(AppError::PolicyNotAllowed { .. })));
    assert!(matches!(fs.rename(&[d.id], &[], "b.txt"), Err(AppError::ObjectExist { .. })));
    fs.rename(&[d.id], &[], "papers").unwrap();
    assert!(fs.folder_by_path("/papers").is_ok());
}

#[tokio::test]
async fn move_within_policy_only_touches_records() {
    let fx = Fixture::new(1_000);
    let mut fs = fx.fs();
    let f = put_file(&mut fs, "/a.txt", b"abc").await;
    let d = fs.create_directory("/d").unwrap();
    fs.create_directory("/dst").unwrap();

    fs.move_objects(&[d.id], &[f.id], "/dst").await.unwrap();
    let moved = fs.file_by_path("/dst/a.txt").unwrap();
    assert_eq!(moved.source_name, f.source_name);
    assert!(fs.folder_by_path("/dst/d").is_ok());
    assert_eq!(fx.used(), 3);
}

#[tokio::test]
async fn cross_policy_move_relocates_bytes() {
    let fx = Fixture::new(1_000);
    let mut fs = fx.fs();
    let f = put_file(&mut fs, "/a.txt", b"payload").await;
    let s3 = fs.create_directory("/s3").unwrap();
    fx.services.db.set_folder_policy(s3.id, Some(MEMORY)).unwrap();

    fs.move_objects(&[], &[f.id], "/s3").await.unwrap();
    let moved = fx.services.db.get_file(f.id).unwrap();
    assert_eq!(moved.policy_id, MEMORY);
    assert_eq!(moved.folder_id, s3.id);
    assert_eq!(fx.memory.get(&moved.source_name).unwrap(), b"payload");
    assert!(!fx.tmp.path().join("data").join(&f.source_name).exists());
    assert_eq!(read_all(&fs, f.id).await, b"payload");
    assert_eq!(fx.used(), 7);
}

#[tokio::test]
async fn copy_shares_bytes_and_charges_usage() {
    let fx = Fixture::new(10);
    let mut fs = fx.fs();
    let f = put_file(&mut fs, "/a.txt", &[7; 8]).await;
    fs.create_directory("/dst").unwrap();

    // Copies bypass the limit check.
    fs.copy(&[], &[f.id], "/dst").await.unwrap();
    assert_eq!(fx.used(), 16);
    let copy = fs.file_by_path("/dst/a.txt").unwrap();
    assert_ne!(copy.id, f.id);
    assert_eq!(copy.source_name, f.source_name);

    // The shared object survives deleting the original.
    let outcome = fs.delete(&[], &[f.id], false).await.unwrap();
    assert!(outcome.is_fully_successful());
    assert_eq!(read_all(&fs, copy.id).await, vec![7; 8]);
    assert_eq!(fx.used(), 8);
}

#[tokio::test]
async fn copy_across_policies_writes_new_bytes() {
    let fx = Fixture::new(1_000);
    let mut fs = fx.fs();
    let f = put_file(&mut fs, "/a.txt", b"abc").await;
    let s3 = fs.create_directory("/s3").unwrap();
    fx.services.db.set_folder_policy(s3.id, Some(MEMORY)).unwrap();

    fs.copy(&[], &[f.id], "/s3").await.unwrap();
    let copy = fs.file_by_path("/s3/a.txt").unwrap();
    assert_eq!(copy.policy_id, MEMORY);
    assert_eq!(fx.memory.get(&copy.source_name).unwrap(), b"abc");
    assert_eq!(fx.services.db.get_file(f.id).unwrap().policy_id, LOCAL);
    assert_eq!(fx.used(), 6);
}

#[tokio::test]
async fn copy_folder_into_itself_is_refused() {
    let fx = Fixture::new(1_000);
    let mut fs = fx.fs();
    let d = fs.create_directory("/d").unwrap();
    fs.create_directory("/d/e").unwrap();
    let err = fs.copy(&[d.id], &[], "/d/e").await.unwrap_err();
    assert_eq!(err.code_str(), "copy_into_self");

    put_file(&mut fs, "/d/e/x.txt", b"xy").await;
    fs.create_directory("/backup").unwrap();
    fs.copy(&[d.id], &[], "/backup").await.unwrap();
    assert!(fs.file_by_path("/backup/d/e/x.txt").is_ok());
    assert_eq!(fx.used(), 4);
}

#[tokio::test]
async fn partial_delete_keeps_failed_records() {
    let fx = Fixture::new(1_000);
    let mut fs = fx.fs();
    fs.switch_policy(MEMORY).unwrap();
    let f1 = put_file(&mut fs, "/f1.bin", &[1; 10]).await;
    let f2 = put_file(&mut fs, "/f2.bin", &[2; 20]).await;
    let f3 = put_file(&mut fs, "/f3.bin", &[3; 30]).await;
    fx.memory.fail_delete.lock().insert(f2.source_name.clone());

    let outcome = fs.delete(&[], &[f1.id, f2.id, f3.id], false).await.unwrap();
    assert!(!outcome.is_fully_successful());
    assert_eq!(sorted(outcome.succeeded), vec![f1.id, f3.id]);
    assert_eq!(outcome.failed, vec![f2.id]);
    assert!(outcome.error.is_some());
    assert!(fx.services.db.get_file(f2.id).is_ok());
    assert!(fx.services.db.get_file(f1.id).is_err());
    assert_eq!(fx.used(), 20);

    let forced = fs.delete(&[], &[f2.id], true).await.unwrap();
    assert_eq!(forced.succeeded, vec![f2.id]);
    assert!(forced.failed.is_empty());
    assert_eq!(fx.used(), 0);
}

#[tokio::test]
async fn delete_folder_is_recursive() {
    let fx = Fixture::new(1_000);
    let mut fs = fx.fs();
    let d = fs.create_directory("/d").unwrap();
    let a = put_file(&mut fs, "/d/a.txt", b"aa").await;
    put_file(&mut fs, "/d/e/b.txt", b"bbb").await;
    let keep = put_file(&mut fs, "/keep.txt", b"k").await;

    let outcome = fs.delete(&[d.id], &[a.id], false).await.unwrap();
    assert_eq!(outcome.succeeded.len(), 2);
    assert!(fs.folder_by_path("/d").is_err());
    assert!(fs.folder_by_path("/d/e").is_err());
    assert!(!fx.tmp.path().join("data").join(&a.source_name).exists());
    assert!(fx.services.db.get_file(keep.id).is_ok());
    assert_eq!(fx.used(), 1);
}

#[tokio::test]
async fn folders_with_failed_files_are_kept() {
    let fx = Fixture::new(1_000);
    let mut fs = fx.fs();
    fs.switch_policy(MEMORY).unwrap();
    let d = fs.create_directory("/d").unwrap();
    let f = put_file(&mut fs, "/d/a.bin", b"abc").await;
    fx.memory.fail_delete.lock().insert(f.source_name.clone());

    let outcome = fs.delete(&[d.id], &[], false).await.unwrap();
    assert_eq!(outcome.failed, vec![f.id]);
    assert!(fs.folder_by_path("/d").is_ok());
}

#[tokio::test]
async fn root_cannot_be_deleted() {
    let fx = Fixture::new(1_000);
    let mut fs = fx.fs();
    let root = fx.services.db.root_folder(UID).unwrap();
    let err = fs.delete(&[root.id], &[], false).await.unwrap_err();
    assert_eq!(err.code_str(), "root_immutable");
}
