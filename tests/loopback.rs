//! End-to-end tests driving a real server over loopback UDP.

use rasd::auth::password_to_pin;
use rasd::config::{Config, ShareConfig};
use rasd::{Ports, Server};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const OP_FIND: u32 = 0x00;
const OP_OPEN_IN: u32 = 0x01;
const OP_CREATE: u32 = 0x04;
const OP_READ: u32 = 0x0B;
const OP_WRITE: u32 = 0x0C;
const OP_CLOSE: u32 = 0x0A;
const OP_FREE_SPACE: u32 = 0x08;

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn a_frame(rid: [u8; 3], code: u32, handle: u32, tail: &[u8]) -> Vec<u8> {
    let mut out = vec![b'A', rid[0], rid[1], rid[2]];
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&handle.to_le_bytes());
    out.extend_from_slice(tail);
    out
}

fn path_tail(path: &str) -> Vec<u8> {
    let mut out = path.as_bytes().to_vec();
    out.push(0);
    out
}

struct TestServer {
    rpc: SocketAddr,
    auth: SocketAddr,
    _root: tempfile::TempDir,
}

async fn start_server(shares: Vec<ShareConfig>, root: tempfile::TempDir) -> TestServer {
    let config = Arc::new(Config {
        shares,
        server: rasd::config::ServerSettings {
            log_level: "info".to_string(),
            // Periodic announcements are irrelevant over loopback.
            broadcast_interval: 0,
            access_plus: true,
        },
        ..Default::default()
    });
    let server = Server::bind_with(
        config,
        Some("127.0.0.1".parse().unwrap()),
        Ports {
            broadcast: 0,
            auth: 0,
            rpc: 0,
        },
    )
    .unwrap();
    let rpc = server.rpc_addr().unwrap();
    let auth = server.auth_addr().unwrap();
    tokio::spawn(server.run());
    TestServer {
        rpc,
        auth,
        _root: root,
    }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn exchange(sock: &UdpSocket, to: SocketAddr, frame: &[u8]) -> Vec<u8> {
    sock.send_to(frame, to).await.unwrap();
    recv(sock).await
}

async fn recv(sock: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), sock.recv_from(&mut buf))
        .await
        .expect("no reply from server")
        .unwrap();
    buf.truncate(n);
    buf
}

fn plain_share(name: &str, path: &std::path::Path) -> ShareConfig {
    ShareConfig {
        name: name.to_string(),
        path: path.to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn find_open_read_close() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("readme"), vec![0x42u8; 42]).unwrap();
    let shares = vec![plain_share("Data", root.path())];
    let server = start_server(shares, root).await;
    let sock = client().await;

    // FIND reports the 20-byte descriptor with the true length.
    let reply = exchange(
        &sock,
        server.rpc,
        &a_frame([1, 0, 0], OP_FIND, 0, &path_tail("Data.readme")),
    )
    .await;
    assert_eq!(reply[0], b'R');
    assert_eq!(&reply[1..4], &[1, 0, 0]);
    assert_eq!(read_u32(&reply, 4) & 0xFFF0_0000, 0xFFF0_0000);
    assert_eq!(read_u32(&reply, 12), 42);
    assert_eq!(read_u32(&reply, 20), 1, "object type is file");

    // OPENIN returns the descriptor plus a handle.
    let reply = exchange(
        &sock,
        server.rpc,
        &a_frame([2, 0, 0], OP_OPEN_IN, 0, &path_tail("Data.readme")),
    )
    .await;
    assert_eq!(reply[0], b'R');
    let handle = read_u32(&reply, 24);
    assert!(handle >= 1);

    // READ at offset 10 for 100 bytes: 32 remain.
    let mut tail = Vec::new();
    tail.extend_from_slice(&10u32.to_le_bytes());
    tail.extend_from_slice(&100u32.to_le_bytes());
    let reply = exchange(
        &sock,
        server.rpc,
        &a_frame([3, 0, 0], OP_READ, handle, &tail),
    )
    .await;
    assert_eq!(reply[0], b'S');
    let data_len = read_u32(&reply, 4) as usize;
    assert_eq!(data_len, 32);
    assert!(reply[12..12 + data_len].iter().all(|&b| b == 0x42));
    let trailer = 12 + data_len;
    assert_eq!(reply[trailer], b'B');
    assert_eq!(read_u32(&reply, trailer + 8), 42, "new_pos = offset + read");

    // CLOSE acknowledges with an empty result.
    let reply = exchange(
        &sock,
        server.rpc,
        &a_frame([4, 0, 0], OP_CLOSE, handle, &[]),
    )
    .await;
    assert_eq!(&reply[..], &[b'R', 4, 0, 0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_and_pull_write() {
    let root = tempfile::tempdir().unwrap();
    let root_path = root.path().to_path_buf();
    let shares = vec![plain_share("Data", root.path())];
    let server = start_server(shares, root).await;
    let sock = client().await;

    let reply = exchange(
        &sock,
        server.rpc,
        &a_frame([1, 0, 0], OP_CREATE, 0, &path_tail("Data.fresh.bin")),
    )
    .await;
    assert_eq!(reply[0], b'R');
    let handle = read_u32(&reply, 24);

    // WRITE 3000 bytes at offset 0: a single window covers it.
    let mut tail = Vec::new();
    tail.extend_from_slice(&0u32.to_le_bytes());
    tail.extend_from_slice(&3000u32.to_le_bytes());
    let reply = exchange(
        &sock,
        server.rpc,
        &a_frame([9, 1, 0], OP_WRITE, handle, &tail),
    )
    .await;
    assert_eq!(reply[0], b'w');
    assert_eq!(read_u32(&reply, 4), 0);
    assert_eq!(read_u32(&reply, 12), 3000);

    let mut data = vec![b'd', 9, 1, 0];
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&vec![0x5A; 3000]);
    let reply = exchange(&sock, server.rpc, &data).await;
    assert_eq!(&reply[..], &[b'R', 9, 1, 0]);

    let written = std::fs::read(root_path.join("fresh/bin")).unwrap();
    assert_eq!(written.len(), 3000);
    assert!(written.iter().all(|&b| b == 0x5A));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protected_share_reveal_and_access() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("secret"), b"classified").unwrap();
    let shares = vec![ShareConfig {
        name: "Vault".to_string(),
        path: root.path().to_path_buf(),
        attributes: vec!["protected".to_string()],
        password: Some("AB12".to_string()),
        ..Default::default()
    }];
    let server = start_server(shares, root).await;
    let sock = client().await;

    // Unauthenticated access is refused outright.
    let reply = exchange(
        &sock,
        server.rpc,
        &a_frame([1, 0, 0], OP_FIND, 0, &path_tail("Vault.secret")),
    )
    .await;
    assert_eq!(reply[0], b'E');
    assert_eq!(reply[4], libc::EACCES as u8);

    // The wrong PIN earns silence.
    let mut probe = Vec::new();
    probe.extend_from_slice(&0x0001_0001u32.to_le_bytes());
    probe.extend_from_slice(&0x0001_0001u32.to_le_bytes());
    probe.extend_from_slice(&0xBAD_u32.to_le_bytes());
    sock.send_to(&probe, server.auth).await.unwrap();
    let mut buf = [0u8; 64];
    assert!(
        tokio::time::timeout(Duration::from_millis(300), sock.recv_from(&mut buf))
            .await
            .is_err()
    );

    // The right PIN gets the share revealed.
    let mut probe = Vec::new();
    probe.extend_from_slice(&0x0001_0001u32.to_le_bytes());
    probe.extend_from_slice(&0x0001_0001u32.to_le_bytes());
    probe.extend_from_slice(&password_to_pin("AB12").to_le_bytes());
    let reveal = exchange(&sock, server.auth, &probe).await;
    assert_eq!(&reveal[0..4], &[0x04, 0x00, 0x01, 0x00]);
    assert_eq!(read_u32(&reveal, 8) & 0xFFFF, 5, "name length");
    assert_eq!(&reveal[16..21], b"Vault");

    // And the same client can now read the share.
    let reply = exchange(
        &sock,
        server.rpc,
        &a_frame([2, 0, 0], OP_FIND, 0, &path_tail("Vault.secret")),
    )
    .await;
    assert_eq!(reply[0], b'R');
    assert_eq!(read_u32(&reply, 12), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn traversal_and_unknown_share_are_not_found() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("file"), b"x").unwrap();
    let shares = vec![plain_share("Data", root.path())];
    let server = start_server(shares, root).await;
    let sock = client().await;

    for path in ["Data.x/../../etc/passwd", "Nosuch.file", "Data..."] {
        let reply = exchange(
            &sock,
            server.rpc,
            &a_frame([7, 0, 0], OP_FIND, 0, &path_tail(path)),
        )
        .await;
        assert_eq!(reply[0], b'E', "path {path:?} must fail");
        assert_eq!(reply[4], libc::ENOENT as u8, "path {path:?} is not found");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn free_space_reports_capacity() {
    let root = tempfile::tempdir().unwrap();
    let shares = vec![plain_share("Data", root.path())];
    let server = start_server(shares, root).await;
    let sock = client().await;

    let reply = exchange(
        &sock,
        server.rpc,
        &a_frame([5, 0, 0], OP_FREE_SPACE, 0, &path_tail("Data")),
    )
    .await;
    assert_eq!(reply[0], b'R');
    let free = read_u32(&reply, 4);
    let total = read_u32(&reply, 12);
    assert!(total > 0);
    assert!(free <= total || total == u32::MAX);
}
