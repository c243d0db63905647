//! End-to-end upload scenarios driven through the upload service

use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use chunkyard_server::config::{CacheSettings, UploadConfig};
use chunkyard_server::db::{create_pool_at, SessionRepository};
use chunkyard_server::upload::{
    compute_hash, Collaborators, FinalizeRequest, InitRequest, ResumeRequest, UploadError,
    UploadService,
};

const ABCDEF_DIGEST: &str = "e9c0f8b575cbfcb42ab3b78ecc87efa3b011d9a5d10b09fa4e96f240bf6a82f5";

fn upload_config(temp_dir: &TempDir) -> UploadConfig {
    UploadConfig {
        chunk_dir: temp_dir.path().join("chunks"),
        artifact_dir: temp_dir.path().join("artifacts"),
        quarantine_dir: temp_dir.path().join("quarantine"),
        ..Default::default()
    }
}

fn service_with(config: &UploadConfig, repository: Option<SessionRepository>) -> UploadService {
    UploadService::new(config, &CacheSettings::default(), repository, Collaborators::default())
        .unwrap()
}

fn service(temp_dir: &TempDir) -> UploadService {
    service_with(&upload_config(temp_dir), None)
}

fn init_request(content: &[u8], chunk_size: u64, checksum: Option<String>) -> InitRequest {
    InitRequest {
        file_name: "upload.bin".to_string(),
        file_size: content.len() as u64,
        chunk_size: Some(chunk_size),
        checksum,
        ..Default::default()
    }
}

async fn start(service: &UploadService, request: InitRequest) -> String {
    let response = service.init_upload(request).await.unwrap();
    assert!(!response.cached);
    response.upload_id.unwrap()
}

fn chunk(content: &[u8], chunk_size: usize, index: usize) -> Bytes {
    Bytes::copy_from_slice(content.chunks(chunk_size).nth(index).unwrap())
}

fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut result = Vec::new();
    for (i, &first) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, first);
            result.push(tail);
        }
    }
    result
}

#[tokio::test]
async fn test_out_of_order_abcdef() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let content = b"ABCDEF";
    let id = start(&service, init_request(content, 2, Some(ABCDEF_DIGEST.to_string()))).await;

    let r = service.upload_chunk(&id, 2, Bytes::from_static(b"EF"), None).await.unwrap();
    assert!(!r.is_complete);
    let r = service.upload_chunk(&id, 0, Bytes::from_static(b"AB"), None).await.unwrap();
    assert!(!r.is_complete);
    let r = service.upload_chunk(&id, 1, Bytes::from_static(b"CD"), None).await.unwrap();
    assert!(r.is_complete);
    assert_eq!(r.completed_count, 3);

    let finalized = service
        .finalize_upload(&id, FinalizeRequest::default())
        .await
        .unwrap();
    assert_eq!(finalized.artifact.digest, ABCDEF_DIGEST);
    assert_eq!(finalized.artifact.size, 6);

    let stored = std::fs::read(temp_dir.path().join("artifacts").join(ABCDEF_DIGEST)).unwrap();
    assert_eq!(stored, content);
    assert!(matches!(
        service.get_status(&id).await,
        Err(UploadError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_every_arrival_order_reassembles_exactly() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = upload_config(&temp_dir);
    config.max_concurrent_sessions = 0;
    let service = service_with(&config, None);

    let content = b"ABCDEFG";
    for order in permutations(&[0, 1, 2, 3]) {
        let id = start(&service, init_request(content, 2, None)).await;
        for &index in &order {
            service
                .upload_chunk(&id, index, chunk(content, 2, index), None)
                .await
                .unwrap();
        }

        let finalized = service
            .finalize_upload(&id, FinalizeRequest::default())
            .await
            .unwrap();
        assert_eq!(finalized.artifact.digest, compute_hash(content), "order {:?}", order);
    }

    let stored = std::fs::read(
        temp_dir.path().join("artifacts").join(compute_hash(content)),
    )
    .unwrap();
    assert_eq!(stored, content);
}

#[tokio::test]
async fn test_resent_chunk_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let id = start(&service, init_request(b"ABCDEF", 2, None)).await;

    let first = service.upload_chunk(&id, 0, Bytes::from_static(b"AB"), None).await.unwrap();
    let again = service.upload_chunk(&id, 0, Bytes::from_static(b"AB"), None).await.unwrap();
    assert_eq!(first.completed_count, 1);
    assert_eq!(again.completed_count, 1);
    assert!(!again.is_complete);
}

#[tokio::test]
async fn test_concurrent_chunks_all_counted() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let content: Vec<u8> = (0..64u8).collect();
    let id = start(&service, init_request(&content, 4, Some(compute_hash(&content)))).await;

    let mut handles = Vec::new();
    for index in (0..16).rev() {
        let service = service.clone();
        let id = id.clone();
        let data = chunk(&content, 4, index);
        handles.push(tokio::spawn(async move {
            service.upload_chunk(&id, index, data, None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let status = service.get_status(&id).await.unwrap();
    assert_eq!(status.chunks_received, 16);

    let finalized = service
        .finalize_upload(&id, FinalizeRequest::default())
        .await
        .unwrap();
    assert_eq!(finalized.artifact.digest, compute_hash(&content));
}

fn disk_service(temp_dir: &TempDir) -> UploadService {
    let mut config = upload_config(temp_dir);
    config.memory_threshold = 0;
    service_with(&config, None)
}

/// File names left in the chunk directory
fn chunk_dir_contents(temp_dir: &TempDir) -> Vec<String> {
    match std::fs::read_dir(temp_dir.path().join("chunks")) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_concurrent_duplicate_chunks_on_disk() {
    let temp_dir = TempDir::new().unwrap();
    let service = disk_service(&temp_dir);
    let chunk_size = 256 * 1024;
    let content: Vec<u8> = (0..2 * chunk_size).map(|i| (i % 241) as u8).collect();
    let id = start(
        &service,
        init_request(&content, chunk_size as u64, Some(compute_hash(&content))),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = service.clone();
        let id = id.clone();
        let data = chunk(&content, chunk_size, 0);
        handles.push(tokio::spawn(async move {
            service.upload_chunk(&id, 0, data, None).await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.completed_count, 1);
    }

    let status = service.get_status(&id).await.unwrap();
    assert_eq!(status.chunks_received, 1);

    service
        .upload_chunk(&id, 1, chunk(&content, chunk_size, 1), None)
        .await
        .unwrap();
    let finalized = service
        .finalize_upload(&id, FinalizeRequest::default())
        .await
        .unwrap();
    assert_eq!(finalized.artifact.digest, compute_hash(&content));
    assert!(chunk_dir_contents(&temp_dir).is_empty());
}

#[tokio::test]
async fn test_cancel_with_chunks_in_flight() {
    let temp_dir = TempDir::new().unwrap();
    let service = disk_service(&temp_dir);
    let chunk_size = 16 * 1024;
    let content: Vec<u8> = (0..64 * chunk_size).map(|i| (i % 239) as u8).collect();
    let id = start(&service, init_request(&content, chunk_size as u64, None)).await;

    let mut handles = Vec::new();
    for index in 0..64 {
        let service = service.clone();
        let id = id.clone();
        let data = chunk(&content, chunk_size, index);
        handles.push(tokio::spawn(async move {
            service.upload_chunk(&id, index, data, None).await
        }));
    }

    tokio::task::yield_now().await;
    service.cancel_upload(&id).await.unwrap();

    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) | Err(UploadError::SessionNotFound(_)) => {}
            Err(other) => panic!("unexpected chunk error: {:?}", other),
        }
    }

    assert!(matches!(
        service.get_status(&id).await,
        Err(UploadError::SessionNotFound(_))
    ));
    assert!(chunk_dir_contents(&temp_dir).is_empty());
}

#[tokio::test]
async fn test_dedup_hit_skips_upload() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let id = start(&service, init_request(b"ABCDEF", 2, Some(ABCDEF_DIGEST.to_string()))).await;
    for (index, data) in [b"AB", b"CD", b"EF"].into_iter().enumerate() {
        service
            .upload_chunk(&id, index, Bytes::from_static(data), None)
            .await
            .unwrap();
    }
    service.finalize_upload(&id, FinalizeRequest::default()).await.unwrap();

    let second = service
        .init_upload(init_request(b"ABCDEF", 2, Some(ABCDEF_DIGEST.to_uppercase())))
        .await
        .unwrap();
    assert!(second.cached);
    assert!(second.upload_id.is_none());
    assert_eq!(second.artifact.unwrap().digest, ABCDEF_DIGEST);
    assert!(service.list_sessions().await.is_empty());

    let stats = service.cache_stats().await;
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_resume_reports_pending_chunks() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let content = b"ABCDEFGH";
    let checksum = compute_hash(content);
    let id = start(&service, init_request(content, 2, Some(checksum.clone()))).await;

    for index in [0, 1, 3] {
        service
            .upload_chunk(&id, index, chunk(content, 2, index), None)
            .await
            .unwrap();
    }

    let resumed = service
        .resume_upload(&id, ResumeRequest { checksum: checksum.clone() })
        .await
        .unwrap();
    assert_eq!(resumed.pending_chunks, vec![2]);
    assert_eq!(resumed.total_chunks, 4);

    let mismatch = service
        .resume_upload(&id, ResumeRequest { checksum: "0".repeat(64) })
        .await;
    assert!(matches!(mismatch, Err(UploadError::IntegrityMismatch(_))));
}

#[tokio::test]
async fn test_capacity_limit_rejects_extra_session() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = upload_config(&temp_dir);
    config.max_concurrent_sessions = 2;
    let service = service_with(&config, None);

    let first = start(&service, init_request(b"ABCDEF", 2, None)).await;
    start(&service, init_request(b"ABCDEF", 2, None)).await;

    let rejected = service.init_upload(init_request(b"ABCDEF", 2, None)).await;
    match rejected {
        Err(e @ UploadError::Capacity { .. }) => {
            assert!(matches!(e, UploadError::Capacity { limit: 2 }));
            assert!(e.is_retryable());
        }
        other => panic!("expected capacity error, got {:?}", other),
    }

    service.cancel_upload(&first).await.unwrap();
    start(&service, init_request(b"ABCDEF", 2, None)).await;
}

#[tokio::test]
async fn test_cancelled_session_rejects_chunks() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let id = start(&service, init_request(b"ABCDEF", 2, None)).await;
    service.upload_chunk(&id, 0, Bytes::from_static(b"AB"), None).await.unwrap();

    let cancelled = service.cancel_upload(&id).await.unwrap();
    assert_eq!(cancelled.chunks_received, 1);

    assert!(matches!(
        service.upload_chunk(&id, 1, Bytes::from_static(b"CD"), None).await,
        Err(UploadError::SessionNotFound(_))
    ));
    assert!(matches!(
        service.cancel_upload(&id).await,
        Err(UploadError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_finalize_integrity_failure_discards_session() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let id = start(&service, init_request(b"ABCDEF", 2, Some("ab".repeat(32)))).await;
    for (index, data) in [b"AB", b"CD", b"EF"].into_iter().enumerate() {
        service
            .upload_chunk(&id, index, Bytes::from_static(data), None)
            .await
            .unwrap();
    }

    let result = service.finalize_upload(&id, FinalizeRequest::default()).await;
    match result {
        Err(UploadError::IntegrityFailure { actual, .. }) => assert_eq!(actual, ABCDEF_DIGEST),
        other => panic!("expected integrity failure, got {:?}", other),
    }

    assert!(!temp_dir.path().join("artifacts").join(ABCDEF_DIGEST).exists());
    assert_eq!(service.cache_stats().await.entries, 0);
    assert!(matches!(
        service.get_status(&id).await,
        Err(UploadError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_finalize_with_missing_chunks() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let id = start(&service, init_request(b"ABCDEF", 2, None)).await;
    service.upload_chunk(&id, 1, Bytes::from_static(b"CD"), None).await.unwrap();

    let result = service.finalize_upload(&id, FinalizeRequest::default()).await;
    assert!(matches!(result, Err(UploadError::MissingChunks(ref m)) if m == &vec![0, 2]));

    // Still receiving
    service.upload_chunk(&id, 0, Bytes::from_static(b"AB"), None).await.unwrap();
}

#[tokio::test]
async fn test_idle_sessions_expire_on_maintenance() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = upload_config(&temp_dir);
    config.session_timeout = Duration::ZERO;
    let service = service_with(&config, None);
    let id = start(&service, init_request(b"ABCDEF", 2, None)).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    service.run_maintenance().await;

    assert!(matches!(
        service.get_status(&id).await,
        Err(UploadError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_state() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = upload_config(&temp_dir);
    // Keep every chunk on disk so it survives the restart
    config.memory_threshold = 0;
    let pool = create_pool_at(&temp_dir.path().join("sessions.db")).await.unwrap();

    let content = b"ABCDEF";
    let id = {
        let service = service_with(&config, Some(SessionRepository::new(pool.clone())));
        let id = start(&service, init_request(content, 2, Some(ABCDEF_DIGEST.to_string()))).await;
        service.upload_chunk(&id, 0, Bytes::from_static(b"AB"), None).await.unwrap();
        service.upload_chunk(&id, 2, Bytes::from_static(b"EF"), None).await.unwrap();
        service.shutdown().await;
        id
    };

    let service = service_with(&config, Some(SessionRepository::new(pool)));
    assert_eq!(service.recover().await.unwrap(), 1);

    let resumed = service
        .resume_upload(&id, ResumeRequest { checksum: ABCDEF_DIGEST.to_string() })
        .await
        .unwrap();
    assert_eq!(resumed.pending_chunks, vec![1]);

    service.upload_chunk(&id, 1, Bytes::from_static(b"CD"), None).await.unwrap();
    let finalized = service
        .finalize_upload(&id, FinalizeRequest::default())
        .await
        .unwrap();
    assert_eq!(finalized.artifact.digest, ABCDEF_DIGEST);
}

#[tokio::test]
async fn test_memory_chunks_are_lost_on_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = upload_config(&temp_dir);
    let pool = create_pool_at(&temp_dir.path().join("sessions.db")).await.unwrap();

    let id = {
        let service = service_with(&config, Some(SessionRepository::new(pool.clone())));
        let id = start(&service, init_request(b"ABCDEF", 2, None)).await;
        service.upload_chunk(&id, 0, Bytes::from_static(b"AB"), None).await.unwrap();
        id
    };

    let service = service_with(&config, Some(SessionRepository::new(pool)));
    service.recover().await.unwrap();

    let status = service.get_status(&id).await.unwrap();
    assert_eq!(status.chunks_received, 0);
}
