use peer_relay::config::Settings;
use peer_relay::network::{ConnectionRegistry, Connector, PeerEvent};
use peer_relay::service::RelayServer;
use peer_relay::RelayError;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("peer_relay_test").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn cleanup(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

fn settings_for(download_dir: &Path) -> Arc<Settings> {
    let mut settings = Settings::default();
    settings.network.host = "127.0.0.1".to_string();
    settings.network.port = 0;
    settings.transfer.chunk_size = 4096;
    settings.transfer.download_dir = download_dir.to_path_buf();
    Arc::new(settings)
}

struct TestServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
}

fn start_server(download_dir: &Path) -> TestServer {
    let mut server = RelayServer::bind(settings_for(download_dir)).unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let events = server.take_events().unwrap();
    tokio::spawn(server.run());
    TestServer {
        addr,
        registry,
        events,
    }
}

async fn wait_for_peer_count(registry: &ConnectionRegistry, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while registry.count().await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry never reached {} peers",
            expected
        );
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn chat_reaches_every_peer_except_the_sender() {
    let server_dir = test_dir("e2e_chat_server");
    let dir_a = test_dir("e2e_chat_a");
    let dir_b = test_dir("e2e_chat_b");
    let server = start_server(&server_dir);

    let mut client_a = Connector::new(settings_for(&dir_a))
        .connect(server.addr)
        .await
        .unwrap();
    let mut client_b = Connector::new(settings_for(&dir_b))
        .connect(server.addr)
        .await
        .unwrap();
    wait_for_peer_count(&server.registry, 2).await;

    client_a.send_chat("hello").unwrap();

    let event = timeout(Duration::from_secs(2), client_b.next_event())
        .await
        .expect("peer B never saw the chat")
        .unwrap();
    match event {
        PeerEvent::Chat { text, .. } => assert_eq!(text, "hello"),
        other => panic!("expected chat event, got {:?}", other),
    }

    // The sender must not observe its own broadcast.
    assert!(
        timeout(Duration::from_millis(300), client_a.next_event())
            .await
            .is_err()
    );

    client_a.close().await;
    client_b.close().await;
    cleanup(&server_dir);
    cleanup(&dir_a);
    cleanup(&dir_b);
}

#[tokio::test]
async fn file_lands_byte_identical_at_the_receiver() {
    let server_dir = test_dir("e2e_file_server");
    let dir_a = test_dir("e2e_file_a");
    let mut server = start_server(&server_dir);

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
    let source = dir_a.join("blob.bin");
    std::fs::write(&source, &data).unwrap();

    let client = Connector::new(settings_for(&dir_a))
        .connect(server.addr)
        .await
        .unwrap();
    wait_for_peer_count(&server.registry, 1).await;

    let sent = client.send_file(&source).await.unwrap();
    assert_eq!(sent, data.len() as u64);

    let deadline = Duration::from_secs(5);
    loop {
        let event = timeout(deadline, server.events.recv())
            .await
            .expect("server never reported the file")
            .unwrap();
        if let PeerEvent::FileReceived { name, path, bytes, .. } = event {
            assert_eq!(name, "blob.bin");
            assert_eq!(bytes, data.len() as u64);
            assert_eq!(std::fs::read(&path).unwrap(), data);
            break;
        }
    }

    client.close().await;
    cleanup(&server_dir);
    cleanup(&dir_a);
}

#[tokio::test]
async fn chunk_without_begin_closes_the_connection() {
    let server_dir = test_dir("e2e_orphan_chunk");
    let server = start_server(&server_dir);

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    wait_for_peer_count(&server.registry, 1).await;

    // A file-chunk frame with no preceding file-begin.
    let payload = b"orphan bytes";
    let mut frame = vec![2u8];
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();

    // The relay must drop us: read runs to EOF.
    let mut sink = Vec::new();
    timeout(Duration::from_secs(2), stream.read_to_end(&mut sink))
        .await
        .expect("relay kept the connection open")
        .unwrap();

    wait_for_peer_count(&server.registry, 0).await;
    assert_eq!(
        std::fs::read_dir(&server_dir).unwrap().count(),
        0,
        "no file may be created for an orphan chunk"
    );

    cleanup(&server_dir);
}

#[tokio::test]
async fn corrupted_transfer_reports_mismatch_and_keeps_the_connection() {
    let server_dir = test_dir("e2e_corrupt");
    let mut server = start_server(&server_dir);

    let data = vec![0x42u8; 5000];
    let mut digest = Sha256::new();
    digest.update(&data);
    let good_checksum = digest.finalize();

    let mut corrupted = data.clone();
    corrupted[100] ^= 0x01;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    wait_for_peer_count(&server.registry, 1).await;

    let name = b"tainted.bin";
    let mut begin = vec![1u8];
    begin.extend_from_slice(&((2 + name.len() + 8) as u32).to_be_bytes());
    begin.extend_from_slice(&(name.len() as u16).to_be_bytes());
    begin.extend_from_slice(name);
    begin.extend_from_slice(&(data.len() as u64).to_be_bytes());
    stream.write_all(&begin).await.unwrap();

    let mut chunk = vec![2u8];
    chunk.extend_from_slice(&(corrupted.len() as u32).to_be_bytes());
    chunk.extend_from_slice(&corrupted);
    stream.write_all(&chunk).await.unwrap();

    let mut end = vec![3u8];
    end.extend_from_slice(&((1 + good_checksum.len()) as u32).to_be_bytes());
    end.push(good_checksum.len() as u8);
    end.extend_from_slice(&good_checksum);
    stream.write_all(&end).await.unwrap();

    loop {
        let event = timeout(Duration::from_secs(2), server.events.recv())
            .await
            .expect("server never reported the failed transfer")
            .unwrap();
        if let PeerEvent::FileFailed { name, .. } = event {
            assert_eq!(name, "tainted.bin");
            break;
        }
    }

    // A checksum mismatch is reported, not fatal: the connection stays
    // registered and the file stays on disk.
    assert_eq!(server.registry.count().await, 1);
    assert_eq!(
        std::fs::read(server_dir.join("tainted.bin")).unwrap(),
        corrupted
    );

    cleanup(&server_dir);
}

#[tokio::test]
async fn connecting_to_a_dead_port_fails_with_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let dir = test_dir("e2e_refused");
    let result = Connector::new(settings_for(&dir)).connect(addr).await;
    match result {
        Err(RelayError::Connect { addr: failed, .. }) => assert_eq!(failed, addr),
        other => panic!("expected connect error, got {:?}", other.map(|_| ())),
    }
    cleanup(&dir);
}
