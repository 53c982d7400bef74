// Transfers between real control servers on loopback.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::net::TcpListener;

use vidswarm::config::NodeConfig;
use vidswarm::control_server::ControlServer;
use vidswarm::download_manager::{
    ChunkStatus, DownloadManager, TransferEvent, TransferHandle, TransferRequest, TransferState,
};
use vidswarm::metadata::{num_chunks, FileRecord, PeerIdentity, CHUNK_SIZE};
use vidswarm::peer_directory::PeerDirectory;
use vidswarm::protocol::ControlResponse;

const HASH: &str = "0f0e0d0c0b0a09080706050403020100";

fn video_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

async fn serve(dir: &Path, name: &str, content: &[u8]) -> ControlServer {
    let path = dir.join(name);
    tokio::fs::write(&path, content).await.unwrap();
    let directory = PeerDirectory::new();
    directory.set_local_catalog(vec![FileRecord::new(HASH, content.len() as u64, name).with_local_path(&path)]);
    ControlServer::start("127.0.0.1:0".parse().unwrap(), directory).await.unwrap()
}

fn peer(id: &str, port: u16) -> PeerIdentity {
    PeerIdentity::new(id, id, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// A loopback port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn request(out: &Path, size: usize, sources: Vec<PeerIdentity>) -> TransferRequest {
    TransferRequest {
        content_hash: HASH.into(),
        display_name: "movie.mp4".into(),
        size_bytes: size as u64,
        num_chunks: num_chunks(size as u64),
        sources,
        output_path: out.join("movie.mp4.0f0e0d0c.buffer"),
        play_threshold_chunks: 2,
        chunk_timeout: Duration::from_secs(2),
    }
}

/// Collects every event of a job that runs to completion, failing the test after `limit`.
async fn run_to_completion(handle: &mut TransferHandle, limit: Duration) -> Vec<TransferEvent> {
    let mut events = handle.events().unwrap();
    let mut seen = Vec::new();
    tokio::time::timeout(limit, async {
        while let Some(event) = events.next().await {
            let done = matches!(event, TransferEvent::Completed { .. });
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("transfer did not complete in time");

    // Other workers may still be emitting for chunks that landed just before the last one.
    handle.wait().await;
    while let Some(Some(event)) = events.next().now_or_never() {
        seen.push(event);
    }
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn downloads_from_two_sources() {
    let share_a = tempfile::tempdir().unwrap();
    let share_b = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let content = video_bytes(5 * CHUNK_SIZE as usize + 1234);

    let server_a = serve(share_a.path(), "movie.mp4", &content).await;
    let server_b = serve(share_b.path(), "Movie Copy.mp4", &content).await;
    let sources = vec![
        peer("a", server_a.local_addr().port()),
        peer("b", server_b.local_addr().port()),
    ];

    let manager = DownloadManager::default();
    let mut handle = manager.start(request(out.path(), content.len(), sources)).await.unwrap();
    let events = run_to_completion(&mut handle, Duration::from_secs(20)).await;

    assert_eq!(tokio::fs::read(handle.output_path()).await.unwrap(), content);
    assert_eq!(handle.state(), TransferState::Complete);
    assert_eq!(handle.status().contiguous, 6);
    assert_eq!(manager.active_transfers(), 0);

    let ready = events.iter().filter(|e| matches!(e, TransferEvent::ReadyToPlay { .. })).count();
    assert_eq!(ready, 1);
    let received = events
        .iter()
        .filter(|e| matches!(e, TransferEvent::Chunk { status: ChunkStatus::Received, .. }))
        .count();
    assert_eq!(received, 6);
    assert!(matches!(events[0], TransferEvent::Started { num_chunks: 6, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_source_is_routed_around() {
    let share = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let content = video_bytes(3 * CHUNK_SIZE as usize);

    let server = serve(share.path(), "movie.mp4", &content).await;
    let dead = peer("dead", closed_port().await);
    let live = peer("live", server.local_addr().port());

    let manager = DownloadManager::default();
    let mut handle = manager
        .start(request(out.path(), content.len(), vec![dead, live]))
        .await
        .unwrap();
    let events = run_to_completion(&mut handle, Duration::from_secs(20)).await;

    assert_eq!(tokio::fs::read(handle.output_path()).await.unwrap(), content);
    for event in &events {
        if let TransferEvent::Chunk { peer, status: ChunkStatus::Received, .. } = event {
            assert_eq!(peer.id, "live");
        }
    }
    // Chunk 0 and chunk 2 start on the dead peer and need a second attempt.
    assert_eq!(handle.attempts(0), 2);
    assert_eq!(handle.attempts(1), 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, TransferEvent::Chunk { status: ChunkStatus::Retrying, error: Some(_), .. })));
}

#[tokio::test]
async fn unknown_content_keeps_retrying_until_stopped() {
    let share = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let server = serve(share.path(), "other.mp4", b"not the requested file").await;

    let mut wanted = request(out.path(), 1000, vec![peer("s", server.local_addr().port())]);
    wanted.content_hash = "ffffffffffffffff".into();

    let manager = DownloadManager::default();
    let mut handle = manager.start(wanted).await.unwrap();
    let mut events = handle.events().unwrap();

    let retry = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.next().await {
                Some(TransferEvent::Chunk { status: ChunkStatus::Retrying, error, .. }) => break error,
                Some(_) => continue,
                None => break None,
            }
        }
    })
    .await
    .unwrap();
    assert!(retry.unwrap().contains("File not found"));
    assert_eq!(handle.state(), TransferState::InProgress);
    assert!(server.is_running());

    handle.stop();
    handle.wait().await;
    assert_eq!(handle.state(), TransferState::Stopped);
    assert_eq!(manager.active_transfers(), 0);
}

#[tokio::test]
async fn heartbeat_reports_progress_while_stalled() {
    let out = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    // Accepts and never answers, so every attempt waits out the chunk timeout.
    let _silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let mut stalled = request(out.path(), 1000, vec![peer("slow", port)]);
    stalled.chunk_timeout = Duration::from_secs(60);

    let manager = DownloadManager::default();
    let mut handle = manager.start(stalled).await.unwrap();
    let mut events = handle.events().unwrap();

    let heartbeats = tokio::time::timeout(Duration::from_secs(5), async {
        let mut heartbeats = 0;
        while heartbeats < 3 {
            match events.next().await {
                Some(TransferEvent::Buffer(status)) => {
                    assert_eq!(status.downloaded, 0);
                    assert_eq!(status.total, 1);
                    heartbeats += 1;
                }
                Some(_) => {}
                None => break,
            }
        }
        heartbeats
    })
    .await
    .unwrap();
    assert_eq!(heartbeats, 3);
    handle.stop();
}

#[tokio::test]
async fn wrong_chunk_length_is_retried() {
    let share = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    // This peer holds a 500-byte file under the hash of a 1000-byte one.
    let server = serve(share.path(), "movie.mp4", &video_bytes(500)).await;

    let manager = DownloadManager::default();
    let mut handle = manager
        .start(request(out.path(), 1000, vec![peer("short", server.local_addr().port())]))
        .await
        .unwrap();
    let mut events = handle.events().unwrap();

    let error = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.next().await {
                Some(TransferEvent::Chunk { status: ChunkStatus::Retrying, error, .. }) => break error,
                Some(TransferEvent::Completed { .. }) | None => break None,
                Some(_) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(error.unwrap().contains("expected 1000"));
    assert_eq!(handle.status().downloaded, 0);
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn understated_chunk_count_from_a_catalog_still_fetches_every_byte() {
    let share = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let content = video_bytes(1_000_000);
    let server = serve(share.path(), "movie.mp4", &content).await;

    let line = format!(
        r#"{{"type":"CATALOG_RESPONSE","files":[{{"contentHash":"{}","sizeBytes":1000000,"numChunks":1,"names":["movie.mp4"]}}]}}"#,
        HASH
    );
    let ControlResponse::Catalog { files } = ControlResponse::decode(line.as_bytes()).unwrap() else {
        panic!("not a catalog");
    };
    let directory = PeerDirectory::new();
    let source = peer("s", server.local_addr().port());
    directory.upsert_peer(source.clone());
    directory.set_peer_catalog(&source.id, files);

    let hit = directory.search("movie").remove(0);
    assert_eq!(hit.num_chunks, 4);

    let manager = DownloadManager::default();
    let request = TransferRequest::from_search(&hit, out.path().join("movie.buffer"), &NodeConfig::default());
    let mut handle = manager.start(request).await.unwrap();
    run_to_completion(&mut handle, Duration::from_secs(20)).await;

    assert_eq!(tokio::fs::read(handle.output_path()).await.unwrap(), content);
}
