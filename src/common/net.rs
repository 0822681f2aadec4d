//! Local address discovery helpers.

use std::net::IpAddr;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use super::Error;

/// The IP the host would use to reach the public internet, determined by
/// opening a UDP socket towards a public address and reading the local
/// endpoint. No packet is sent.
pub async fn outbound_local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("bind probe socket")?;
    socket
        .connect("8.8.8.8:80")
        .await
        .context("connect probe socket")?;
    Ok(socket.local_addr()?.ip())
}

/// First usable address of the named interface for the requested family.
/// Loopback and link-local addresses are skipped.
#[cfg(unix)]
pub fn interface_ip(name: &str, want_v6: bool) -> Result<IpAddr> {
    let addrs = nix::ifaddrs::getifaddrs().context("getifaddrs")?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if want_v6 {
            if let Some(sin6) = storage.as_sockaddr_in6() {
                let ip = sin6.ip();
                if ip.is_loopback() || (ip.segments()[0] & 0xffc0) == 0xfe80 {
                    continue;
                }
                return Ok(IpAddr::V6(ip));
            }
        } else if let Some(sin) = storage.as_sockaddr_in() {
            let ip = std::net::Ipv4Addr::from(sin.ip());
            if ip.is_loopback() || ip.is_link_local() {
                continue;
            }
            return Ok(IpAddr::V4(ip));
        }
    }
    Err(Error::Config(format!(
        "no {} address on interface {}",
        if want_v6 { "IPv6" } else { "IPv4" },
        name
    ))
    .into())
}

#[cfg(not(unix))]
pub fn interface_ip(name: &str, _want_v6: bool) -> Result<IpAddr> {
    Err(Error::Config(format!(
        "interface address lookup is not supported on this platform ({})",
        name
    ))
    .into())
}
