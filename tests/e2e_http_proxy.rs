//! Reverse-proxy behavior over real sockets: header rewrite, bad-gateway
//! mapping, and WebSocket-style upgrade tunnelling.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use netward::forward::PortForwardWorker;
use netward::store::{FileStore, PortForwardTable};
use netward::supervisor::{RestartPolicy, Supervisor};

fn temp_store(tag: &str) -> Arc<FileStore> {
    let dir = std::env::temp_dir().join(format!("netward_http_{}", tag));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    FileStore::open(&dir).unwrap()
}

async fn start_proxy(
    store: &Arc<FileStore>,
    id: u64,
    target: std::net::SocketAddr,
) -> (Arc<Supervisor<PortForwardWorker>>, u16) {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    store
        .upsert_port_forward(
            serde_json::from_value(serde_json::json!({
                "id": id, "name": "http-fw", "enable": true,
                "listen_ip": "127.0.0.1", "listen_port": port,
                "listen_kind": "http",
                "target_host": target.ip().to_string(), "target_port": target.port()
            }))
            .unwrap(),
        )
        .await;

    let sup = Supervisor::new(
        PortForwardWorker::new(store.clone()),
        Arc::new(PortForwardTable(store.clone())),
        RestartPolicy::flat(),
        Arc::new(AtomicBool::new(false)),
    );
    sup.start(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    (sup, port)
}

/// Backend that records the raw request head and answers 200.
async fn spawn_backend(status_line: &'static str) -> (std::net::SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let log = log.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => head.push(byte[0]),
                    }
                }
                log.lock().await.push(String::from_utf8_lossy(&head).to_string());

                let response = format!(
                    "{}\r\nContent-Length: 13\r\nConnection: close\r\n\r\nHello, World!",
                    status_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, seen)
}

#[tokio::test]
async fn proxies_and_rewrites_headers() {
    let store = temp_store("rewrite");
    let (backend, seen) = spawn_backend("HTTP/1.1 200 OK").await;
    let (sup, port) = start_proxy(&store, 1, backend).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(
            b"GET /hello HTTP/1.1\r\nHost: public.example.com\r\nAccept: */*\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
    assert!(response.contains("Hello, World!"));

    let heads = seen.lock().await;
    let head = &heads[0];
    assert!(head.starts_with("GET /hello HTTP/1.1"));
    assert!(
        head.contains(&format!("Host: {}:{}", backend.ip(), backend.port())),
        "Host not rewritten: {}",
        head
    );
    assert!(head.contains("X-Real-IP: 127.0.0.1"));
    assert!(head.contains("X-Forwarded-For: 127.0.0.1"));
    assert!(head.contains("Connection: close"));
    assert!(head.contains("Accept: */*"));

    sup.stop(1).await;
}

#[tokio::test]
async fn dead_upstream_yields_502() {
    let store = temp_store("dead");
    // Allocate a port with nothing listening.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = probe.local_addr().unwrap();
    drop(probe);

    let (sup, port) = start_proxy(&store, 1, dead).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502"));

    sup.stop(1).await;
}

#[tokio::test]
async fn upstream_5xx_surfaces_as_502() {
    let store = temp_store("fivehundred");
    let (backend, _seen) = spawn_backend("HTTP/1.1 500 Internal Server Error").await;
    let (sup, port) = start_proxy(&store, 1, backend).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502"));

    sup.stop(1).await;
}

#[tokio::test]
async fn websocket_upgrade_is_tunnelled() {
    let store = temp_store("upgrade");

    // Backend that accepts the upgrade and then echoes raw bytes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte).await {
                Ok(0) | Err(_) => return,
                Ok(_) => head.push(byte[0]),
            }
        }
        let head_text = String::from_utf8_lossy(&head).to_string();
        assert!(head_text.contains("Upgrade: websocket"), "upgrade header must pass through");

        let _ = stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .await;

        // Echo whatever flows through the tunnel.
        let mut buf = [0u8; 1024];
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

    let (sup, port) = start_proxy(&store, 1, backend).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    // 101 head first.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut byte))
            .await
            .expect("101 response timeout")
            .unwrap();
        assert!(n > 0, "connection closed before 101");
        head.push(byte[0]);
    }
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 101"));

    // Then raw frames relay in both directions.
    client.write_all(b"frame-payload").await.unwrap();
    let mut echo = [0u8; 13];
    tokio::time::timeout(Duration::from_secs(3), client.read_exact(&mut echo))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echo, b"frame-payload");

    sup.stop(1).await;
}
