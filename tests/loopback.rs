// End-to-end exchanges between a real client and a real server over
// loopback. All sockets bind port 0 so tests can run concurrently.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tempdir::TempDir;
use tftp_udp::processor::TransferError;
use tftp_udp::tftp::{Packet, SocketError, TftpSocket};
use tftp_udp::{Client, ClientConfig, ExecStrategy, Server, ServerConfig};
use tokio_test::assert_ok;

fn spawn_server(root: &Path, strategy: ExecStrategy) -> SocketAddr {
    let config = ServerConfig {
        listen: (Ipv4Addr::LOCALHOST, 0).into(),
        timeout: Duration::from_secs(5),
        root: root.to_path_buf(),
        read_data_port: 0,
        write_data_port: 0,
        strategy,
    };
    let mut server = Server::bind(config).unwrap();
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

fn client_for(server: SocketAddr, blksize: usize) -> Client {
    Client::new(ClientConfig {
        server,
        blksize,
        timeout: Duration::from_secs(5),
    })
}

/// The server finishes a stored file slightly after the client's last send;
/// poll until it matches.
async fn eventually_eq(path: &Path, expected: &[u8]) {
    for _ in 0..200 {
        if let Ok(bytes) = tokio::fs::read(path).await {
            if bytes == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("file {} never reached the expected contents", path.display());
}

#[tokio::test]
async fn test_small_get() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    tokio::fs::write(server_dir.path().join("source.bin"), b"0123456789")
        .await
        .unwrap();

    let addr = spawn_server(server_dir.path(), ExecStrategy::ConcurrentTask);
    let client = client_for(addr, 512);

    let local = client_dir.path().join("fetched.bin");
    assert_ok!(client.get("source.bin", &local).await);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_exact_multiple_put() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();

    let contents = vec![0x41; 512];
    let local = client_dir.path().join("upload.bin");
    tokio::fs::write(&local, &contents).await.unwrap();

    let addr = spawn_server(server_dir.path(), ExecStrategy::ConcurrentTask);
    let client = client_for(addr, 512);

    assert_ok!(client.put(&local, "stored.bin").await);
    eventually_eq(&server_dir.path().join("stored.bin"), &contents).await;
}

#[tokio::test]
async fn test_multi_block_get_with_custom_blksize() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();

    let contents: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(server_dir.path().join("big.bin"), &contents)
        .await
        .unwrap();

    let addr = spawn_server(server_dir.path(), ExecStrategy::ConcurrentTask);
    let client = client_for(addr, 1024);

    let local = client_dir.path().join("big.bin");
    assert_ok!(client.get("big.bin", &local).await);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), contents);
}

#[tokio::test]
async fn test_round_trip_put_then_get() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();

    let contents: Vec<u8> = (0..1500u32).map(|i| (i % 253) as u8).collect();
    let upload = client_dir.path().join("original.bin");
    tokio::fs::write(&upload, &contents).await.unwrap();

    let addr = spawn_server(server_dir.path(), ExecStrategy::ConcurrentTask);
    let client = client_for(addr, 512);

    assert_ok!(client.put(&upload, "remote.bin").await);
    eventually_eq(&server_dir.path().join("remote.bin"), &contents).await;

    let fetched = client_dir.path().join("copy.bin");
    assert_ok!(client.get("remote.bin", &fetched).await);
    assert_eq!(tokio::fs::read(&fetched).await.unwrap(), contents);
}

#[tokio::test]
async fn test_dispatch_loop_ignores_stray_packets() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    tokio::fs::write(server_dir.path().join("source.bin"), b"payload")
        .await
        .unwrap();

    let addr = spawn_server(server_dir.path(), ExecStrategy::SynchronousInline);

    // Neither stray non-request packets nor an undecodable datagram may
    // take the listening loop down.
    let mut stray = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
    stray.send(&Packet::Ack { block: 3 }, addr).await.unwrap();
    stray.send(&Packet::Data { block: 0, data: vec![0x00] }, addr).await.unwrap();
    let garbage = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    garbage.send_to(&[0xFF], addr).unwrap();

    let client = client_for(addr, 512);
    let local = client_dir.path().join("fetched.bin");
    assert_ok!(client.get("source.bin", &local).await);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"payload");
}

#[tokio::test]
async fn test_get_of_missing_file_times_out_and_server_survives() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    tokio::fs::write(server_dir.path().join("present.bin"), b"here")
        .await
        .unwrap();

    let addr = spawn_server(server_dir.path(), ExecStrategy::SynchronousInline);

    // The handler fails to open the file and no ERROR opcode exists to say
    // so; the client just runs into its receive timeout.
    let impatient = Client::new(ClientConfig {
        server: addr,
        blksize: 512,
        timeout: Duration::from_millis(300),
    });
    let local = client_dir.path().join("missing.bin");
    let err = impatient.get("missing.bin", &local).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::Socket(SocketError::Timeout(_))
    ));

    // The dispatch loop must still be serving.
    let client = client_for(addr, 512);
    let local = client_dir.path().join("present.bin");
    assert_ok!(client.get("present.bin", &local).await);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"here");
}
