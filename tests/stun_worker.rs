//! STUN worker loop against an in-process responder: observation writes,
//! change events, and failure status.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use netward::callback::{EventKind, EventSender};
use netward::store::{FileStore, StunStatus, StunTable};
use netward::stun::message::{encode_address, Message, ATTR_XOR_MAPPED_ADDRESS, BINDING_RESPONSE};
use netward::stun::StunWorker;
use netward::supervisor::{RestartPolicy, Supervisor};

fn temp_store(tag: &str) -> Arc<FileStore> {
    let dir = std::env::temp_dir().join(format!("netward_stun_{}", tag));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    FileStore::open(&dir).unwrap()
}

/// Responder that answers every Binding Request with a fixed mapping.
async fn spawn_stun_responder(ip: &'static str, port: u16) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(request) = Message::parse(&buf[..n]) else {
                continue;
            };
            let response = Message {
                msg_type: BINDING_RESPONSE,
                transaction_id: request.transaction_id,
                attributes: vec![(
                    ATTR_XOR_MAPPED_ADDRESS,
                    encode_address(ip.parse().unwrap(), port, Some(&request.transaction_id)),
                )],
            };
            let _ = socket.send_to(&response.encode(), peer).await;
        }
    });
    addr
}

fn stun_supervisor(
    store: &Arc<FileStore>,
    events: EventSender,
) -> Arc<Supervisor<StunWorker>> {
    Supervisor::new(
        StunWorker::new(store.clone(), events),
        Arc::new(StunTable(store.clone())),
        RestartPolicy::backoff(),
        Arc::new(AtomicBool::new(false)),
    )
}

#[tokio::test]
async fn successful_probe_writes_observation_and_emits_event() {
    let store = temp_store("observe");
    let responder = spawn_stun_responder("203.0.113.42", 61234).await;

    store
        .upsert_stun_rule(
            serde_json::from_value(serde_json::json!({
                "id": 1, "name": "probe", "enable": true,
                "stun_server": responder.to_string(),
                "disable_validation": true
            }))
            .unwrap(),
        )
        .await;

    let (events, mut rx) = EventSender::channel();
    let sup = stun_supervisor(&store, events);
    sup.start(1).await.unwrap();

    // First successful probe counts as a change.
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("expected a StunIpChange event")
        .unwrap();
    assert_eq!(event.kind, EventKind::StunIpChange);
    assert_eq!(event.source_id, 1);
    assert_eq!(event.new_ip, "203.0.113.42");
    assert_eq!(event.new_port, 61234);
    assert_eq!(event.old_ip, "");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let rule = store.stun_rule(1).await.unwrap();
    assert_eq!(rule.current_ip, "203.0.113.42");
    assert_eq!(rule.current_port, 61234);
    assert_eq!(rule.stun_status, Some(StunStatus::Penetrating));
    assert_eq!(rule.last_error, "");
    // disable_validation skips classification
    assert_eq!(rule.nat_type, "Unknown");

    // No second event without a change (next tick is 30 s out anyway).
    assert!(rx.try_recv().is_err());

    sup.stop(1).await;
}

#[tokio::test]
async fn unanswered_probe_sets_timeout_status() {
    let store = temp_store("timeout");

    // Dead UDP endpoint: bind, read the port, drop.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead = socket.local_addr().unwrap();
    drop(socket);

    store
        .upsert_stun_rule(
            serde_json::from_value(serde_json::json!({
                "id": 2, "name": "dead", "enable": true,
                "stun_server": dead.to_string(),
                "disable_validation": true
            }))
            .unwrap(),
        )
        .await;

    let (events, mut rx) = EventSender::channel();
    let sup = stun_supervisor(&store, events);
    sup.start(2).await.unwrap();

    // 3 s probe timeout plus margin.
    tokio::time::sleep(Duration::from_secs(4)).await;

    let rule = store.stun_rule(2).await.unwrap();
    assert_eq!(rule.stun_status, Some(StunStatus::Timeout));
    assert!(!rule.last_error.is_empty());
    assert!(rx.try_recv().is_err(), "no event on failure");

    sup.stop(2).await;
}

#[tokio::test]
async fn disabling_rule_stops_the_loop() {
    let store = temp_store("disable");
    let responder = spawn_stun_responder("198.51.100.9", 4000).await;

    store
        .upsert_stun_rule(
            serde_json::from_value(serde_json::json!({
                "id": 3, "name": "flip", "enable": true,
                "stun_server": responder.to_string(),
                "disable_validation": true
            }))
            .unwrap(),
        )
        .await;

    let (events, _rx) = EventSender::channel();
    let sup = stun_supervisor(&store, events);
    sup.start(3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(sup.is_running(3).await);

    // The worker re-reads the rule each tick; stop() does not depend on it,
    // but a stop must always converge regardless.
    sup.stop(3).await;
    assert!(!sup.is_running(3).await);
}
