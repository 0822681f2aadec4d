//! SOCKS5 CONNECT tunnel server (RFC 1928, CONNECT only).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::traffic::{ConnectionLimiter, TrafficCounters};
use crate::common::Error;
use crate::store::PortForwardRule;

use super::relay::relay;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

// Reply codes (RFC 1928 §6).
const REP_SUCCEEDED: u8 = 0x00;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

pub async fn serve(
    rule: &PortForwardRule,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = rule.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Fatal(format!("listen {}: {}", addr, e)))?;
    let limiter = Arc::new(ConnectionLimiter::new(rule.max_conns));

    info!(listen = %addr, "socks5 server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(listen = %addr, "socks5 server shutting down");
                return Ok(());
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(listen = %addr, error = %e, "accept failed");
                        continue;
                    }
                };
                let Some(guard) = limiter.try_acquire() else {
                    warn!(listen = %addr, max = limiter.max(), "connection cap reached, rejecting");
                    continue;
                };

                let counters = counters.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = handle_conn(stream, &counters, &cancel).await {
                        debug!(peer = %peer, error = %e, "socks5 session ended");
                    }
                });
            }
        }
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    counters: &TrafficCounters,
    cancel: &CancellationToken,
) -> Result<()> {
    // Method negotiation. Anything that is not SOCKS5 is dropped on the
    // version byte.
    let ver = read_u8(&mut stream).await?;
    if ver != 0x05 {
        bail!("not SOCKS5, version byte 0x{:02x}", ver);
    }
    let nmethods = read_u8(&mut stream).await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    // Request.
    let ver = read_u8(&mut stream).await?;
    if ver != 0x05 {
        bail!("bad request version 0x{:02x}", ver);
    }
    let cmd = read_u8(&mut stream).await?;
    let _rsv = read_u8(&mut stream).await?;
    let atyp = read_u8(&mut stream).await?;

    let host = match atyp {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        0x03 => {
            let len = read_u8(&mut stream).await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            String::from_utf8_lossy(&domain).to_string()
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        other => {
            reply(&mut stream, REP_ADDRESS_NOT_SUPPORTED).await?;
            bail!("unsupported address type 0x{:02x}", other);
        }
    };
    let port = read_u16_be(&mut stream).await?;

    // Only CONNECT; BIND and UDP ASSOCIATE are deliberately unsupported.
    if cmd != 0x01 {
        reply(&mut stream, REP_COMMAND_NOT_SUPPORTED).await?;
        bail!("unsupported command 0x{:02x}", cmd);
    }

    let target = format!("{}:{}", host, port);
    debug!(target = %target, "socks5 CONNECT");

    let remote = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            reply(&mut stream, REP_CONNECTION_REFUSED).await?;
            bail!("dial {}: {}", target, e);
        }
        Err(_) => {
            reply(&mut stream, REP_CONNECTION_REFUSED).await?;
            bail!("dial {}: timed out", target);
        }
    };

    reply(&mut stream, REP_SUCCEEDED).await?;

    let _ = stream.set_nodelay(true);
    let _ = remote.set_nodelay(true);
    relay(stream, remote, counters, cancel).await
}

/// VER REP RSV ATYP=IPv4 BND.ADDR=0.0.0.0 BND.PORT=0
async fn reply<W: AsyncWrite + Unpin>(stream: &mut W, rep: u8) -> Result<()> {
    stream
        .write_all(&[0x05, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

async fn read_u8<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    Ok(buf[0])
}

async fn read_u16_be<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}
