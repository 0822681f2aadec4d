//! End-to-end port forwarding through the supervisor:
//! client → forwarder → target, with connection caps and byte accounting.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use netward::forward::PortForwardWorker;
use netward::store::{FileStore, PortForwardTable, RuleStatus};
use netward::supervisor::{RestartPolicy, Supervisor};

fn temp_store(tag: &str) -> Arc<FileStore> {
    let dir = std::env::temp_dir().join(format!("netward_e2e_{}", tag));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    FileStore::open(&dir).unwrap()
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn spawn_tcp_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn forward_supervisor(
    store: &Arc<FileStore>,
) -> Arc<Supervisor<PortForwardWorker>> {
    Supervisor::new(
        PortForwardWorker::new(store.clone()),
        Arc::new(PortForwardTable(store.clone())),
        RestartPolicy::flat(),
        Arc::new(AtomicBool::new(false)),
    )
}

#[tokio::test]
async fn tcp_forward_happy_path_with_cap() {
    let store = temp_store("tcp_cap");
    let echo = spawn_tcp_echo().await;
    let listen_port = free_port().await;

    store
        .upsert_port_forward(
            serde_json::from_value(serde_json::json!({
                "id": 1, "name": "tcp-fw", "enable": true,
                "listen_ip": "127.0.0.1", "listen_port": listen_port,
                "listen_kind": "tcp",
                "target_host": echo.ip().to_string(), "target_port": echo.port(),
                "max_conns": 2
            }))
            .unwrap(),
        )
        .await;

    let sup = forward_supervisor(&store);
    sup.start(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        store.port_forward(1).await.unwrap().status,
        RuleStatus::Running
    );

    // Two connections fit under the cap and echo correctly.
    let mut first = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    first.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(3), first.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    let mut second = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    second.write_all(b"ping").await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), second.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    // The third is accepted by the kernel but closed by the forwarder
    // before any relay happens.
    let mut third = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = third.write_all(b"ping").await;
    let n = tokio::time::timeout(Duration::from_secs(3), third.read(&mut buf))
        .await
        .expect("third connection should be closed promptly")
        .unwrap_or(0);
    assert_eq!(n, 0, "capped connection must not relay data");

    assert_eq!(
        store.port_forward(1).await.unwrap().status,
        RuleStatus::Running
    );

    // Freeing one slot admits a new connection.
    first.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut fourth = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    fourth.write_all(b"ping").await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), fourth.read_exact(&mut buf))
        .await
        .expect("slot should be free again")
        .unwrap();
    assert_eq!(&buf, b"ping");
    fourth.shutdown().await.unwrap();

    // Close the remaining connection, then stop and verify accounting:
    // 4 bytes in and 4 bytes out per successful connection (3 of them).
    second.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    sup.stop(1).await;
    let rule = store.port_forward(1).await.unwrap();
    assert_eq!(rule.status, RuleStatus::Stopped);
    assert_eq!(rule.traffic_in, 12);
    assert_eq!(rule.traffic_out, 12);
}

#[tokio::test]
async fn tcp_forward_listen_conflict_is_terminal() {
    let store = temp_store("tcp_conflict");
    // Squat the port so the worker's bind fails.
    let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = squatter.local_addr().unwrap().port();

    store
        .upsert_port_forward(
            serde_json::from_value(serde_json::json!({
                "id": 1, "name": "conflict", "enable": true,
                "listen_ip": "127.0.0.1", "listen_port": port,
                "listen_kind": "tcp",
                "target_host": "127.0.0.1", "target_port": 1
            }))
            .unwrap(),
        )
        .await;

    let sup = forward_supervisor(&store);
    sup.start(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Fatal bind error: worker gone, last_error kept.
    assert!(!sup.is_running(1).await);
    let rule = store.port_forward(1).await.unwrap();
    assert!(rule.last_error.contains("listen"), "got: {}", rule.last_error);
    drop(squatter);
}

#[tokio::test]
async fn udp_forward_roundtrip() {
    let store = temp_store("udp_roundtrip");

    // UDP echo target.
    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let Ok((n, peer)) = target.recv_from(&mut buf).await else {
                break;
            };
            let _ = target.send_to(&buf[..n], peer).await;
        }
    });

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listen_port = probe.local_addr().unwrap().port();
    drop(probe);

    store
        .upsert_port_forward(
            serde_json::from_value(serde_json::json!({
                "id": 2, "name": "udp-fw", "enable": true,
                "listen_ip": "127.0.0.1", "listen_port": listen_port,
                "listen_kind": "udp",
                "target_host": "127.0.0.1", "target_port": target_addr.port(),
                "udp_packet_size": 65507
            }))
            .unwrap(),
        )
        .await;

    let sup = forward_supervisor(&store);
    sup.start(2).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"datagram-one", ("127.0.0.1", listen_port))
        .await
        .unwrap();

    let mut buf = [0u8; 256];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .expect("echo reply timeout")
        .unwrap();
    assert_eq!(&buf[..n], b"datagram-one");

    // Second datagram reuses the session.
    client
        .send_to(b"datagram-two", ("127.0.0.1", listen_port))
        .await
        .unwrap();
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .expect("echo reply timeout")
        .unwrap();
    assert_eq!(&buf[..n], b"datagram-two");

    // A maximum-size datagram (65507 bytes) relays intact.
    let big: Vec<u8> = (0..65507u32).map(|i| (i % 251) as u8).collect();
    client
        .send_to(&big, ("127.0.0.1", listen_port))
        .await
        .unwrap();
    let mut big_buf = vec![0u8; 65536];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut big_buf))
        .await
        .expect("large echo reply timeout")
        .unwrap();
    assert_eq!(n, 65507);
    assert_eq!(&big_buf[..n], &big[..]);

    sup.stop(2).await;
    let rule = store.port_forward(2).await.unwrap();
    assert_eq!(rule.traffic_in, 24 + 65507);
    assert_eq!(rule.traffic_out, 24 + 65507);
}

#[tokio::test]
async fn traffic_counters_reset_on_restart() {
    let store = temp_store("counters_reset");
    let echo = spawn_tcp_echo().await;
    let listen_port = free_port().await;

    store
        .upsert_port_forward(
            serde_json::from_value(serde_json::json!({
                "id": 3, "name": "reset", "enable": true,
                "listen_ip": "127.0.0.1", "listen_port": listen_port,
                "listen_kind": "tcp",
                "target_host": echo.ip().to_string(), "target_port": echo.port()
            }))
            .unwrap(),
        )
        .await;

    let sup = forward_supervisor(&store);
    sup.start(3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client.write_all(b"xxxx").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    client.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    sup.stop(3).await;
    assert_eq!(store.port_forward(3).await.unwrap().traffic_in, 4);

    // Fresh spawn starts counting from zero.
    sup.start(3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    sup.stop(3).await;
    assert_eq!(store.port_forward(3).await.unwrap().traffic_in, 0);
}
