//! RFC 3489 three-test NAT classification.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::net::outbound_local_ip;

use super::message::Message;
use super::StunError;

const STUN_TIMEOUT: Duration = Duration::from_secs(3);
const RECV_BUF: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    Unknown,
    OpenInternet,
    FullCone,
    RestrictedCone,
    PortRestricted,
    Symmetric,
    SymmetricFirewall,
    UdpBlocked,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::Unknown => "Unknown",
            NatType::OpenInternet => "Open Internet",
            NatType::FullCone => "Full Cone NAT",
            NatType::RestrictedCone => "Restricted Cone NAT",
            NatType::PortRestricted => "Port Restricted Cone NAT",
            NatType::Symmetric => "Symmetric NAT",
            NatType::SymmetricFirewall => "Symmetric UDP Firewall",
            NatType::UdpBlocked => "UDP Blocked",
        };
        f.write_str(s)
    }
}

/// Probe outcome. `ip` is empty when no mapping could be learned
/// (`UdpBlocked`).
#[derive(Debug, Clone)]
pub struct NatInfo {
    pub ip: String,
    pub port: u16,
    pub nat_type: NatType,
}

impl NatInfo {
    fn blocked() -> Self {
        Self {
            ip: String::new(),
            port: 0,
            nat_type: NatType::UdpBlocked,
        }
    }
}

/// Bare Binding Request: learn the mapped address, skip classification.
pub async fn probe_basic(server: &str) -> Result<NatInfo> {
    let server_addr = resolve(server).await?;
    let socket = open_socket().await?;

    let response = transact(&socket, server_addr, false, false).await?;
    if !response.is_success() {
        return Err(StunError::BadResponse("non-success binding response".into()).into());
    }
    let (ip, port) = response.mapped_address()?;
    Ok(NatInfo {
        ip: ip.to_string(),
        port,
        nat_type: NatType::Unknown,
    })
}

/// Full RFC 3489 decision procedure.
///
/// Test I failure classifies as `UdpBlocked` (empty mapping). Transport
/// errors later in the procedure degrade to `Unknown` with the Test I
/// mapping kept, rather than failing the probe.
pub async fn classify(server: &str) -> Result<NatInfo> {
    let server_addr = resolve(server).await?;
    let socket = open_socket().await?;

    // Test I: basic binding request.
    let response1 = match transact(&socket, server_addr, false, false).await {
        Ok(r) if r.is_success() => r,
        Ok(_) | Err(_) => {
            debug!(server = server, "no usable binding response, UDP blocked");
            return Ok(NatInfo::blocked());
        }
    };
    let (mapped_ip, mapped_port) = response1.mapped_address()?;

    let mut info = NatInfo {
        ip: mapped_ip.to_string(),
        port: mapped_port,
        nat_type: NatType::Unknown,
    };

    let local_ip = outbound_local_ip().await.ok();

    if local_ip == Some(mapped_ip) {
        // No address translation: open internet or a symmetric firewall.
        // Test II: ask the server to answer from a different IP and port.
        info.nat_type = match transact(&socket, server_addr, true, true).await {
            Ok(r) if r.is_success() => NatType::OpenInternet,
            _ => NatType::SymmetricFirewall,
        };
        return Ok(info);
    }

    // Behind a NAT. The alternate server address drives the rest.
    let changed = match response1.changed_address() {
        Ok((ip, port)) => SocketAddr::new(ip, port),
        Err(_) => return Ok(info),
    };

    // Test II: a response from a different IP+port means any external host
    // can reach the mapping, which is Full Cone.
    if let Ok(r) = transact(&socket, server_addr, true, true).await {
        if r.is_success() {
            info.nat_type = NatType::FullCone;
            return Ok(info);
        }
    }

    // Test I(b): ask the alternate server for our mapping. A different
    // mapping per destination is the Symmetric signature.
    let response1b = match transact(&socket, changed, false, false).await {
        Ok(r) if r.is_success() => r,
        _ => return Ok(info),
    };
    let (ip1b, port1b) = match response1b.mapped_address() {
        Ok(v) => v,
        Err(_) => return Ok(info),
    };
    if ip1b != mapped_ip || port1b != mapped_port {
        info.nat_type = NatType::Symmetric;
        return Ok(info);
    }

    // Test III: change port only separates the two cone flavours.
    info.nat_type = match transact(&socket, server_addr, false, true).await {
        Ok(r) if r.is_success() => NatType::RestrictedCone,
        _ => NatType::PortRestricted,
    };
    Ok(info)
}

async fn resolve(server: &str) -> Result<SocketAddr, StunError> {
    let mut addrs = tokio::net::lookup_host(server)
        .await
        .map_err(|e| StunError::Resolve(server.to_string(), e.to_string()))?;
    addrs
        .find(|a| a.is_ipv4())
        .ok_or_else(|| StunError::Resolve(server.to_string(), "no IPv4 address".into()))
}

async fn open_socket() -> Result<UdpSocket, StunError> {
    UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(StunError::SocketOpen)
}

/// One request/response exchange with the 3 s deadline. The socket stays
/// unconnected so alternate-server responses are accepted.
pub(crate) async fn transact(
    socket: &UdpSocket,
    to: SocketAddr,
    change_ip: bool,
    change_port: bool,
) -> Result<Message, StunError> {
    let request = Message::binding_request(change_ip, change_port);
    socket
        .send_to(&request.encode(), to)
        .await
        .map_err(StunError::SocketOpen)?;

    let mut buf = [0u8; RECV_BUF];
    let (n, _) = tokio::time::timeout(STUN_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| StunError::Timeout("binding response"))?
        .map_err(StunError::SocketOpen)?;
    Message::parse(&buf[..n])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::message::{
        encode_address, ATTR_XOR_MAPPED_ADDRESS, BINDING_RESPONSE,
    };

    /// Minimal in-process STUN responder answering every request with the
    /// given mapped address.
    async fn spawn_responder(ip: &str, port: u16) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let mapped_ip: std::net::IpAddr = ip.parse().unwrap();
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
                        encode_address(mapped_ip, port, Some(&request.transaction_id)),
                    )],
                };
                let _ = socket.send_to(&response.encode(), peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn probe_basic_reads_mapped_address() {
        let server = spawn_responder("198.51.100.23", 40001).await;
        let info = probe_basic(&server.to_string()).await.unwrap();
        assert_eq!(info.ip, "198.51.100.23");
        assert_eq!(info.port, 40001);
        assert_eq!(info.nat_type, NatType::Unknown);
    }

    #[tokio::test]
    async fn probe_basic_times_out_without_server() {
        // Nothing listens on this socket we bind and immediately drop.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead = socket.local_addr().unwrap();
        drop(socket);

        let err = probe_basic(&dead.to_string()).await.unwrap_err();
        assert!(crate::stun::is_timeout(&err));
    }

    #[tokio::test]
    async fn classify_blocked_when_test1_unanswered() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead = socket.local_addr().unwrap();
        drop(socket);

        let info = classify(&dead.to_string()).await.unwrap();
        assert_eq!(info.nat_type, NatType::UdpBlocked);
        assert!(info.ip.is_empty());
    }

    #[tokio::test]
    async fn classify_unknown_without_changed_address() {
        // Responder advertises a mapping that differs from any local IP but
        // carries no CHANGED-ADDRESS, so classification cannot continue.
        let server = spawn_responder("203.0.113.77", 4242).await;
        let info = classify(&server.to_string()).await.unwrap();
        assert_eq!(info.ip, "203.0.113.77");
        assert_eq!(info.port, 4242);
        assert_eq!(info.nat_type, NatType::Unknown);
    }

    #[tokio::test]
    async fn resolve_rejects_garbage() {
        assert!(resolve("definitely-not-a-host.invalid:3478").await.is_err());
    }

    // ─── scripted decision-procedure scenarios ─────────────────────────────

    use crate::stun::message::{encode_address as encode, ATTR_CHANGED_ADDRESS, ATTR_CHANGE_REQUEST};

    /// Responder whose answers follow the RFC 3489 test matrix: it can stay
    /// silent on CHANGE-REQUESTs to simulate filtering NATs, and announces
    /// an alternate server through CHANGED-ADDRESS.
    struct Script {
        mapped: (std::net::IpAddr, u16),
        changed: Option<SocketAddr>,
        answer_change_ip: bool,
        answer_change_port: bool,
    }

    async fn spawn_scripted(script: Script) -> SocketAddr {
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

                let flags = request
                    .attribute(ATTR_CHANGE_REQUEST)
                    .and_then(|v| v.get(3).copied())
                    .unwrap_or(0);
                let wants_change_ip = flags & 0x04 != 0;
                let wants_change_port = flags & 0x02 != 0;
                if wants_change_ip && !script.answer_change_ip {
                    continue;
                }
                if !wants_change_ip && wants_change_port && !script.answer_change_port {
                    continue;
                }

                let mut attributes = vec![(
                    ATTR_XOR_MAPPED_ADDRESS,
                    encode(script.mapped.0, script.mapped.1, Some(&request.transaction_id)),
                )];
                if let Some(alt) = script.changed {
                    attributes.push((ATTR_CHANGED_ADDRESS, encode(alt.ip(), alt.port(), None)));
                }
                let response = Message {
                    msg_type: BINDING_RESPONSE,
                    transaction_id: request.transaction_id,
                    attributes,
                };
                let _ = socket.send_to(&response.encode(), peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn classify_full_cone() {
        // Change-IP+port requests are answered: Test II succeeds.
        let alt = spawn_responder("203.0.113.80", 3478).await;
        let primary = spawn_scripted(Script {
            mapped: ("203.0.113.80".parse().unwrap(), 40000),
            changed: Some(alt),
            answer_change_ip: true,
            answer_change_port: true,
        })
        .await;

        let info = classify(&primary.to_string()).await.unwrap();
        assert_eq!(info.nat_type, NatType::FullCone);
        assert_eq!(info.ip, "203.0.113.80");
        assert_eq!(info.port, 40000);
    }

    #[tokio::test]
    async fn classify_symmetric() {
        // Test II is filtered, and the alternate server sees a different
        // mapping than the primary: the Symmetric signature.
        let alt = spawn_responder("203.0.113.80", 40001).await;
        let primary = spawn_scripted(Script {
            mapped: ("203.0.113.80".parse().unwrap(), 40000),
            changed: Some(alt),
            answer_change_ip: false,
            answer_change_port: false,
        })
        .await;

        let info = classify(&primary.to_string()).await.unwrap();
        // spawn_responder answers with port 40001 ≠ 40000
        assert_eq!(info.nat_type, NatType::Symmetric);
    }

    #[tokio::test]
    async fn classify_restricted_cone() {
        // Same mapping from both servers, change-port-only answered.
        let alt = spawn_responder("203.0.113.80", 40000).await;
        let primary = spawn_scripted(Script {
            mapped: ("203.0.113.80".parse().unwrap(), 40000),
            changed: Some(alt),
            answer_change_ip: false,
            answer_change_port: true,
        })
        .await;

        let info = classify(&primary.to_string()).await.unwrap();
        assert_eq!(info.nat_type, NatType::RestrictedCone);
    }

    #[tokio::test]
    async fn classify_port_restricted() {
        // Same mapping from both servers, every change request filtered.
        let alt = spawn_responder("203.0.113.80", 40000).await;
        let primary = spawn_scripted(Script {
            mapped: ("203.0.113.80".parse().unwrap(), 40000),
            changed: Some(alt),
            answer_change_ip: false,
            answer_change_port: false,
        })
        .await;

        let info = classify(&primary.to_string()).await.unwrap();
        assert_eq!(info.nat_type, NatType::PortRestricted);
    }
}
