//! UDP datagram forwarding with per-source sessions.
//!
//! One socket listens; each distinct client address gets its own connected
//! socket towards the target plus a reverse pump task feeding replies back
//! through the listening socket. Sessions are reaped lazily when the target
//! socket errors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::traffic::TrafficCounters;
use crate::common::Error;
use crate::store::PortForwardRule;

/// Largest payload a UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65507;

type SessionMap = Arc<Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>>;

pub async fn serve(
    rule: &PortForwardRule,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = rule.listen_addr();
    let socket = Arc::new(
        UdpSocket::bind(&addr)
            .await
            .map_err(|e| Error::Fatal(format!("listen {}: {}", addr, e)))?,
    );
    let target = rule.target_addr();
    let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
    // Reply buffer honors the rule's packet-size hint; inbound always
    // accepts up to the UDP maximum.
    let reply_buf_size = rule.udp_packet_size.clamp(1500, MAX_DATAGRAM);

    info!(listen = %addr, target = %target, "udp forward listening");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(listen = %addr, "udp forward shutting down");
                return Ok(());
            }
            result = socket.recv_from(&mut buf) => {
                let (n, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(listen = %addr, error = %e, "udp recv failed");
                        continue;
                    }
                };
                counters.add_in(n as u64);

                let session = match existing_or_new_session(
                    &sessions,
                    peer,
                    &target,
                    &socket,
                    &counters,
                    &cancel,
                    reply_buf_size,
                )
                .await
                {
                    Ok(s) => s,
                    Err(e) => {
                        error!(peer = %peer, target = %target, error = %e, "udp session failed");
                        continue;
                    }
                };

                if let Err(e) = session.send(&buf[..n]).await {
                    debug!(peer = %peer, error = %e, "udp forward send failed");
                    sessions.lock().await.remove(&peer);
                }
            }
        }
    }
}

async fn existing_or_new_session(
    sessions: &SessionMap,
    peer: SocketAddr,
    target: &str,
    listen_socket: &Arc<UdpSocket>,
    counters: &Arc<TrafficCounters>,
    cancel: &CancellationToken,
    reply_buf_size: usize,
) -> Result<Arc<UdpSocket>> {
    if let Some(existing) = sessions.lock().await.get(&peer) {
        return Ok(existing.clone());
    }

    let session = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    session.connect(target).await?;
    sessions.lock().await.insert(peer, session.clone());
    debug!(peer = %peer, target = %target, "udp session opened");

    // Reverse pump: target → original client, until the session socket
    // errors or the worker is cancelled.
    let pump_session = session.clone();
    let pump_listen = listen_socket.clone();
    let pump_sessions = sessions.clone();
    let pump_counters = counters.clone();
    let pump_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; reply_buf_size];
        loop {
            tokio::select! {
                _ = pump_cancel.cancelled() => break,
                result = pump_session.recv(&mut buf) => {
                    let n = match result {
                        Ok(n) => n,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "udp session closed");
                            break;
                        }
                    };
                    if pump_listen.send_to(&buf[..n], peer).await.is_err() {
                        break;
                    }
                    pump_counters.add_out(n as u64);
                }
            }
        }
        pump_sessions.lock().await.remove(&peer);
    });

    Ok(session)
}
