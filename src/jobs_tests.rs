use super::*;
use std::time::Duration;

use crate::filesystem::test_support::{put_file, Fixture, MEMORY, UID};

async fn wait_settled(jobs: &ChannelJobSubmitter, id: u64) -> JobStatus {
    for _ in 0..500 {
        match jobs.status(id) {
            Some(JobStatus::Queued) | Some(JobStatus::Running) | None => tokio::time::sleep(Duration::from_millis(10)).await,
            Some(done) => return done,
        }
    }
    panic!("job {} did not settle", id);
}

#[test]
fn job_spec_serializes_with_a_type_tag() {
    let spec = JobSpec::Decompress { uid: 7, file_id: 3, dst_path: "/x".into() };
    let v = serde_json::to_value(&spec).unwrap();
    assert_eq!(v["type"], "decompress");
    assert_eq!(serde_json::from_value::<JobSpec>(v).unwrap(), spec);
    assert_eq!(spec.uid(), 7);
    assert_eq!(spec.kind(), "decompress");
}

#[tokio::test]
async fn import_registers_backend_objects() {
    let fx = Fixture::new(10);
    fx.memory.insert("bucket/x/a.bin", &[1; 6]);
    fx.memory.insert("bucket/x/sub/b.bin", &[2; 8]);
    fx.memory.insert("bucket/x/bad|name", b"z");
    let mut fs = fx.fs();

    let n = import(&mut fs, MEMORY, "bucket/x", "/imported", true).await.unwrap();
    assert_eq!(n, 2);
    let b = fs.file_by_path("/imported/sub/b.bin").unwrap();
    assert_eq!((b.policy_id, b.source_name.as_str()), (MEMORY, "bucket/x/sub/b.bin"));
    // Imports are charged past the limit.
    assert_eq!(fx.used(), 14);

    assert_eq!(import(&mut fs, MEMORY, "bucket/x", "/imported", true).await.unwrap(), 0);
    assert_eq!(fx.used(), 14);
}

#[tokio::test]
async fn import_requires_a_group_policy() {
    let fx = Fixture::new(10);
    let mut fs = fx.fs();
    let err = import(&mut fs, 42, "/", "/", false).await.unwrap_err();
    assert!(matches!(err, AppError::PolicyNotAllowed { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_runs_jobs_and_records_status() {
    let fx = Fixture::new(1 << 20);
    let (jobs, worker) = ChannelJobSubmitter::spawn(fx.services.clone(), 4);
    let mut fs = fx.fs();
    let f = put_file(&mut fs, "/a.txt", b"alpha").await;
    fs.create_directory("/out").unwrap();

    let id = fs.submit_compress(&jobs, &[], &[f.id], "/out", "a.zip").await.unwrap();
    assert_eq!(wait_settled(&jobs, id).await, JobStatus::Done);
    assert!(fs.file_by_path("/out/a.zip").is_ok());

    let bad = jobs.submit(JobSpec::Decompress { uid: UID, file_id: 9_999, dst_path: "/".into() }).await.unwrap();
    assert!(matches!(wait_settled(&jobs, bad).await, JobStatus::Failed(_)));
    assert_ne!(id, bad);

    drop(jobs);
    tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn submission_is_validated_up_front() {
    let fx = Fixture::new(1 << 20);
    let (jobs, _worker) = ChannelJobSubmitter::spawn(fx.services.clone(), 1);
    let mut fs = fx.fs();
    let f = put_file(&mut fs, "/a.txt", b"a").await;

    assert!(matches!(fs.submit_compress(&jobs, &[], &[f.id], "/missing", "a.zip").await, Err(AppError::NotFound { .. })));
    assert!(matches!(fs.submit_compress(&jobs, &[], &[f.id], "/", "a/b.zip").await, Err(AppError::PolicyNotAllowed { .. })));
    assert!(matches!(fs.submit_decompress(&jobs, 9_999, "/").await, Err(AppError::NotFound { .. })));

    fs.user.group.archive_task = false;
    assert!(matches!(fs.submit_compress(&jobs, &[], &[f.id], "/", "a.zip").await, Err(AppError::GroupNotAllowed { .. })));
    assert!(matches!(fs.submit_decompress(&jobs, f.id, "/").await, Err(AppError::GroupNotAllowed { .. })));
    assert_eq!(jobs.status(1), None);
}
