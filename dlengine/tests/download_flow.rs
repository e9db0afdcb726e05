use assert_fs::TempDir;
use dl_tests_utils::{
    http_server::{HttpServerConfig, TestHttpServer},
    listener::EventLog,
};
use dl_utils::timer::SysTimer;
use dlengine::engine::{DownloadEngine, EngineConfig};
use dlengine_api::{
    engine::{DownloadRequest, EventKind, OPTION_CONNECTIONS},
    torrent::MockTorrentClient,
};
use std::{fs, sync::Arc, time::Duration};

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

#[tokio::test]
async fn test_full_http_download_lifecycle() {
    let content = patterned(5 * 1024 * 1024);
    let server = TestHttpServer::start(HttpServerConfig {
        content: content.clone(),
        ..Default::default()
    })
    .await;
    let tmp_dir = TempDir::new().unwrap();
    let engine = DownloadEngine::new(
        SysTimer,
        Arc::new(MockTorrentClient::new()),
        EngineConfig {
            default_connections: 1,
            default_directory: tmp_dir.path().to_path_buf(),
            poll_interval_ms: 10,
            request_queue_size: 16,
        },
    );
    let events = Arc::new(EventLog::default());
    engine.add_listener(events.clone()).await;

    let gid = engine
        .submit(DownloadRequest::new(server.url("big.bin")).with_option(OPTION_CONNECTIONS, "4"))
        .await;

    let mut complete_seen = false;
    for _ in 0..1000 {
        if events.kinds_for(&gid).contains(&EventKind::Complete) {
            complete_seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(complete_seen, "download did not complete in time");

    let info = engine.status(&gid).await.unwrap();
    assert!(info.is_complete());
    assert_eq!("big.bin", info.name);
    assert_eq!(content.len() as u64, info.total_bytes);
    assert_eq!(content.len() as u64, info.completed_bytes);
    assert_eq!(content, fs::read(info.dl_path.unwrap()).unwrap());

    let kinds = events.kinds_for(&gid);
    assert_eq!(Some(&EventKind::Start), kinds.first());
    assert_eq!(
        1,
        kinds
            .iter()
            .filter(|kind| **kind == EventKind::Complete)
            .count()
    );
    assert!(!kinds.contains(&EventKind::Stop));
}

#[tokio::test]
async fn test_listener_registration_order_is_delivery_order() {
    let server = TestHttpServer::start(HttpServerConfig {
        content: patterned(1000),
        ..Default::default()
    })
    .await;
    let tmp_dir = TempDir::new().unwrap();
    let engine = DownloadEngine::new(
        SysTimer,
        Arc::new(MockTorrentClient::new()),
        EngineConfig {
            default_directory: tmp_dir.path().to_path_buf(),
            poll_interval_ms: 10,
            ..Default::default()
        },
    );
    let first = Arc::new(EventLog::default());
    let second = Arc::new(EventLog::default());
    engine.add_listener(first.clone()).await;
    engine.add_listener(second.clone()).await;

    let gid = engine
        .submit(DownloadRequest::new(server.url("small.bin")))
        .await;
    let mut complete_seen = false;
    for _ in 0..1000 {
        if second.kinds_for(&gid).contains(&EventKind::Complete) {
            complete_seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(complete_seen, "download did not complete in time");
    // both listeners observed the same sequence
    assert_eq!(first.kinds_for(&gid), second.kinds_for(&gid));
}
