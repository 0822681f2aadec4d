//! Wake-on-LAN magic packets.
//!
//! A magic packet is 6 bytes of 0xFF followed by 16 repetitions of the
//! target MAC, 102 bytes total, sent over UDP to a broadcast address.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::net::UdpSocket;

use super::Error;

pub const MAGIC_PACKET_LEN: usize = 102;
pub const DEFAULT_BROADCAST: &str = "255.255.255.255";
pub const DEFAULT_PORT: u16 = 9;

fn mac_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9A-Fa-f]{2}[:\-]){5}[0-9A-Fa-f]{2}$").unwrap())
}

/// Parse `AA:BB:CC:DD:EE:FF` (or `-`-separated) into raw bytes.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    if !mac_regex().is_match(s) {
        return Err(Error::Config(format!("invalid MAC address: {}", s)).into());
    }
    let mut mac = [0u8; 6];
    for (i, part) in s.split([':', '-']).enumerate() {
        mac[i] = u8::from_str_radix(part, 16)?;
    }
    Ok(mac)
}

/// Build the 102-byte payload for the given MAC.
pub fn magic_packet(mac: [u8; 6]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(MAGIC_PACKET_LEN);
    packet.extend_from_slice(&[0xFF; 6]);
    for _ in 0..16 {
        packet.extend_from_slice(&mac);
    }
    packet
}

/// Send a magic packet for `mac` to `broadcast_ip:port`.
pub async fn wake(mac: &str, broadcast_ip: &str, port: u16) -> Result<()> {
    let mac = parse_mac(mac)?;
    let packet = magic_packet(mac);

    let broadcast = if broadcast_ip.is_empty() {
        DEFAULT_BROADCAST
    } else {
        broadcast_ip
    };
    let port = if port == 0 { DEFAULT_PORT } else { port };

    let socket = UdpSocket::bind("0.0.0.0:0").await.context("bind WoL socket")?;
    socket.set_broadcast(true)?;
    let sent = socket
        .send_to(&packet, (broadcast, port))
        .await
        .with_context(|| format!("send magic packet to {}:{}", broadcast, port))?;
    if sent != MAGIC_PACKET_LEN {
        return Err(Error::Protocol(format!(
            "sent {} bytes, expected {}",
            sent, MAGIC_PACKET_LEN
        ))
        .into());
    }
    Ok(())
}
