//! Local File Backend Integration Tests
//!
//! Test Coverage:
//! - Temp file lifecycle and final rename
//! - Multi-chunk assembly
//! - Offset conflicts under concurrency
//! - Deletion of in-progress and finished uploads
//! - Recovery from a lost finishing commit, missing temp files, name clashes

mod common;

use bytes::Bytes;
use common::FlakyStore;
use std::sync::Arc;
use tempfile::TempDir;
use tus_uploadr::storage::{
    chunk_from_bytes, BusinessMeta, ChunkStream, LocalBackend, LocalMeta, MemoryUploadStore,
    StorageBackend, StorageError,
};
use tus_uploadr::tus::UploadMetadata;

fn local_meta(dir: &TempDir, id: &str) -> BusinessMeta {
    BusinessMeta::Local(LocalMeta {
        dir_path: dir.path().to_path_buf(),
        write_file_name: format!("report_{}.txt", &id[..4]),
        tmp_name: format!("{}.tmp", id),
    })
}

async fn setup(total: u64) -> (TempDir, Arc<LocalBackend>) {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(Arc::new(MemoryUploadStore::new())));
    backend
        .create("abcd-1", total, UploadMetadata::new(), local_meta(&dir, "abcd-1"))
        .await
        .unwrap();
    (dir, backend)
}

/// Test: a single chunk covering the upload lands under the final name
#[tokio::test]
async fn test_single_chunk_round_trip() {
    let (dir, backend) = setup(10).await;

    let record = backend
        .write_chunk("abcd-1", 0, 10, chunk_from_bytes(&b"0123456789"[..]))
        .await
        .unwrap();

    assert_eq!(record.offset, 10);
    assert!(record.finished);
    assert_eq!(
        std::fs::read(dir.path().join("report_abcd.txt")).unwrap(),
        b"0123456789"
    );
    assert!(!dir.path().join("abcd-1.tmp").exists());
}

/// Test: chunks accumulate in the temp file until the last one
#[tokio::test]
async fn test_multi_chunk_assembly() {
    let (dir, backend) = setup(9).await;

    let record = backend
        .write_chunk("abcd-1", 0, 4, chunk_from_bytes(&b"abcd"[..]))
        .await
        .unwrap();
    assert_eq!(record.offset, 4);
    assert!(!record.finished);
    assert!(dir.path().join("abcd-1.tmp").exists());
    assert!(!dir.path().join("report_abcd.txt").exists());

    // Body split across several frames
    let body: ChunkStream = Box::pin(futures::stream::iter(vec![
        Ok(Bytes::from_static(b"ef")),
        Ok(Bytes::from_static(b"ghi")),
    ]));
    let record = backend.write_chunk("abcd-1", 4, 5, body).await.unwrap();
    assert!(record.finished);
    assert_eq!(
        std::fs::read(dir.path().join("report_abcd.txt")).unwrap(),
        b"abcdefghi"
    );
}

/// Test: a write at the wrong offset is rejected without touching the file
#[tokio::test]
async fn test_offset_conflict() {
    let (_dir, backend) = setup(10).await;
    backend
        .write_chunk("abcd-1", 0, 5, chunk_from_bytes(&b"hello"[..]))
        .await
        .unwrap();

    let result = backend
        .write_chunk("abcd-1", 0, 5, chunk_from_bytes(&b"HELLO"[..]))
        .await;
    assert!(matches!(
        result,
        Err(StorageError::OffsetConflict {
            expected: 0,
            actual: 5,
            ..
        })
    ));
}

/// Test: two concurrent writers at the same offset, exactly one wins
#[tokio::test]
async fn test_concurrent_writers_same_offset() {
    let (dir, backend) = setup(10).await;

    let a = {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move {
            backend
                .write_chunk("abcd-1", 0, 5, chunk_from_bytes(&b"aaaaa"[..]))
                .await
        })
    };
    let b = {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move {
            backend
                .write_chunk("abcd-1", 0, 5, chunk_from_bytes(&b"bbbbb"[..]))
                .await
        })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(backend.get("abcd-1").await.unwrap().unwrap().offset, 5);

    let written = std::fs::read(dir.path().join("abcd-1.tmp")).unwrap();
    assert!(written == b"aaaaa" || written == b"bbbbb");
}

/// Test: creating into a missing directory fails
#[tokio::test]
async fn test_create_missing_directory() {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::new(Arc::new(MemoryUploadStore::new()));
    let meta = BusinessMeta::Local(LocalMeta {
        dir_path: dir.path().join("nope"),
        write_file_name: "a.txt".into(),
        tmp_name: "a.tmp".into(),
    });

    let result = backend.create("x", 10, UploadMetadata::new(), meta).await;
    assert!(matches!(result, Err(StorageError::DestinationMissing(_))));
    assert!(backend.get("x").await.unwrap().is_none());
}

/// Test: duplicate upload ids are rejected
#[tokio::test]
async fn test_create_duplicate_id() {
    let (dir, backend) = setup(10).await;
    let result = backend
        .create("abcd-1", 10, UploadMetadata::new(), local_meta(&dir, "abcd-1"))
        .await;
    assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
}

/// Test: deleting an in-progress upload removes the temp file and the record
#[tokio::test]
async fn test_delete_in_progress() {
    let (dir, backend) = setup(10).await;
    backend
        .write_chunk("abcd-1", 0, 5, chunk_from_bytes(&b"hello"[..]))
        .await
        .unwrap();

    backend.delete("abcd-1").await.unwrap();

    assert!(!dir.path().join("abcd-1.tmp").exists());
    assert!(backend.get("abcd-1").await.unwrap().is_none());
}

/// Test: deleting a finished upload removes the final file
#[tokio::test]
async fn test_delete_finished() {
    let (dir, backend) = setup(5).await;
    backend
        .write_chunk("abcd-1", 0, 5, chunk_from_bytes(&b"hello"[..]))
        .await
        .unwrap();

    backend.delete("abcd-1").await.unwrap();

    assert!(!dir.path().join("report_abcd.txt").exists());
    assert!(backend.get("abcd-1").await.unwrap().is_none());
}

/// Test: deleting an unknown upload reports not found
#[tokio::test]
async fn test_delete_unknown() {
    let (_dir, backend) = setup(5).await;
    assert!(matches!(
        backend.delete("missing").await,
        Err(StorageError::NotFound(_))
    ));
}

/// Test: a finished file whose record commit was lost is committed by the retry
#[tokio::test]
async fn test_retry_after_lost_finishing_commit() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore::new());
    let backend = LocalBackend::new(store.clone());
    backend
        .create("abcd-1", 10, UploadMetadata::new(), local_meta(&dir, "abcd-1"))
        .await
        .unwrap();
    backend
        .write_chunk("abcd-1", 0, 5, chunk_from_bytes(&b"abcde"[..]))
        .await
        .unwrap();

    store.fail_next_finishing_commit();
    let result = backend
        .write_chunk("abcd-1", 5, 5, chunk_from_bytes(&b"fghij"[..]))
        .await;
    assert!(matches!(result, Err(StorageError::RecordStore(_))));
    let record = backend.get("abcd-1").await.unwrap().unwrap();
    assert_eq!(record.offset, 5);
    assert!(!record.finished);

    let record = backend
        .write_chunk("abcd-1", 5, 5, chunk_from_bytes(&b"fghij"[..]))
        .await
        .unwrap();
    assert_eq!(record.offset, 10);
    assert!(record.finished);
    assert_eq!(
        std::fs::read(dir.path().join("report_abcd.txt")).unwrap(),
        b"abcdefghij"
    );
    assert!(!dir.path().join("abcd-1.tmp").exists());
}

/// Test: a chunk past offset 0 never recreates a vanished temp file
#[tokio::test]
async fn test_missing_temp_file_not_recreated() {
    let (dir, backend) = setup(10).await;
    backend
        .write_chunk("abcd-1", 0, 4, chunk_from_bytes(&b"abcd"[..]))
        .await
        .unwrap();
    std::fs::remove_file(dir.path().join("abcd-1.tmp")).unwrap();

    let result = backend
        .write_chunk("abcd-1", 4, 3, chunk_from_bytes(&b"efg"[..]))
        .await;

    assert!(matches!(result, Err(StorageError::DataMissing(_))));
    assert!(!dir.path().join("abcd-1.tmp").exists());
    assert_eq!(backend.get("abcd-1").await.unwrap().unwrap().offset, 4);
}

/// Test: finalization never replaces an existing file
#[tokio::test]
async fn test_final_name_taken() {
    let (dir, backend) = setup(4).await;
    std::fs::write(dir.path().join("report_abcd.txt"), b"someone else").unwrap();

    let result = backend
        .write_chunk("abcd-1", 0, 4, chunk_from_bytes(&b"mine"[..]))
        .await;

    assert!(matches!(result, Err(StorageError::DestinationExists(_))));
    assert_eq!(
        std::fs::read(dir.path().join("report_abcd.txt")).unwrap(),
        b"someone else"
    );
    let record = backend.get("abcd-1").await.unwrap().unwrap();
    assert_eq!(record.offset, 0);
    assert!(!record.finished);
}
