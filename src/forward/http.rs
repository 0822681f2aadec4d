//! HTTP(S) reverse proxy bound to a single upstream.
//!
//! Works directly on byte streams: the request head is parsed, rewritten
//! (Host, X-Real-IP, X-Forwarded-For) and replayed upstream, then the
//! connection degrades into the same bidirectional relay the TCP path uses.
//! One exchange per client connection (the proxy forces `Connection: close`
//! downstream), except for Upgrade requests (WebSocket), whose headers pass
//! through untouched and whose connection is tunnelled until EOF.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::traffic::{ConnectionLimiter, TrafficCounters};
use crate::common::Error;
use crate::store::{ListenKind, PortForwardRule, TargetKind};

use super::relay::relay;
use super::tls::{insecure_client_config, load_server_config};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on a request or response head.
const MAX_HEAD_BYTES: usize = 64 * 1024;

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Debug, Clone)]
pub struct Upstream {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Upstream selection: an HTTPS listener forwards to `https://` only when
/// the target side is itself HTTPS; everything else goes to plain HTTP.
pub fn upstream_for_rule(rule: &PortForwardRule) -> Upstream {
    let scheme = if rule.listen_kind == ListenKind::Https && rule.target_kind == TargetKind::Https
    {
        Scheme::Https
    } else {
        Scheme::Http
    };
    Upstream {
        scheme,
        host: rule.target_host.clone(),
        port: rule.target_port,
    }
}

pub async fn serve(
    rule: &PortForwardRule,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
) -> Result<()> {
    let upstream = Arc::new(upstream_for_rule(rule));

    let acceptor = if rule.listen_kind == ListenKind::Https {
        if rule.tls_cert.is_empty() || rule.tls_key.is_empty() {
            return Err(
                Error::Config("https listener requires tls_cert and tls_key".into()).into(),
            );
        }
        Some(TlsAcceptor::from(Arc::new(load_server_config(
            &rule.tls_cert,
            &rule.tls_key,
        )?)))
    } else {
        None
    };

    let tls_client = if upstream.scheme == Scheme::Https {
        Some(Arc::new(insecure_client_config()?))
    } else {
        None
    };

    let addr = rule.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Fatal(format!("listen {}: {}", addr, e)))?;
    let limiter = Arc::new(ConnectionLimiter::new(rule.max_conns));

    info!(listen = %addr, upstream = %upstream.host_port(), tls = acceptor.is_some(), "http proxy listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(listen = %addr, "http proxy shutting down");
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

                let acceptor = acceptor.clone();
                let upstream = upstream.clone();
                let tls_client = tls_client.clone();
                let counters = counters.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let result = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                handle_conn(tls_stream, peer.ip(), &upstream, tls_client, &counters, &cancel).await
                            }
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "tls accept failed");
                                return;
                            }
                        },
                        None => handle_conn(stream, peer.ip(), &upstream, tls_client, &counters, &cancel).await,
                    };
                    if let Err(e) = result {
                        debug!(peer = %peer, error = %e, "proxy exchange ended");
                    }
                });
            }
        }
    }
}

async fn handle_conn<S: IoStream>(
    stream: S,
    client_ip: IpAddr,
    upstream: &Upstream,
    tls_client: Option<Arc<rustls::ClientConfig>>,
    counters: &TrafficCounters,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut client = BufReader::new(stream);

    let mut head = read_head(&mut client).await?;
    let upgrade = rewrite_for_upstream(&mut head, &upstream.host_port(), client_ip);
    let request_len = content_length(&head.headers);

    // Dial (and optionally wrap) the upstream.
    let tcp = match tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect(upstream.host_port()),
    )
    .await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            error!(upstream = %upstream.host_port(), error = %e, "upstream dial failed");
            return write_bad_gateway(&mut client).await;
        }
        Err(_) => {
            error!(upstream = %upstream.host_port(), "upstream dial timed out");
            return write_bad_gateway(&mut client).await;
        }
    };
    let _ = tcp.set_nodelay(true);

    let upstream_io: Box<dyn IoStream> = match tls_client {
        Some(config) => {
            let name = rustls::pki_types::ServerName::try_from(upstream.host.clone())
                .context("invalid upstream server name")?;
            match TlsConnector::from(config).connect(name, tcp).await {
                Ok(tls_stream) => Box::new(tls_stream),
                Err(e) => {
                    error!(upstream = %upstream.host_port(), error = %e, "upstream TLS failed");
                    return write_bad_gateway(&mut client).await;
                }
            }
        }
        None => Box::new(tcp),
    };
    let mut remote = BufReader::new(upstream_io);

    // Replay the rewritten request head.
    remote.write_all(head.to_bytes().as_slice()).await?;
    remote.flush().await?;

    // A request without a delimited body (chunked upload) cannot be
    // forwarded ahead of the response; hand it to the relay untouched. No
    // status inspection and no byte accounting on this path.
    if !upgrade && head.header("transfer-encoding").is_some() {
        let tunnel_counters = TrafficCounters::default();
        return relay(client, remote, &tunnel_counters, cancel).await;
    }

    // Forward the request body, then read the upstream's response head so
    // the status can be inspected and the Content-Length accounted.
    if request_len > 0 {
        copy_exact(&mut client, &mut remote, request_len).await?;
        remote.flush().await?;
    }
    let response = match read_head(&mut remote).await {
        Ok(h) => h,
        Err(e) => {
            debug!(error = %e, "reading upstream response failed");
            return write_bad_gateway(&mut client).await;
        }
    };
    let status = response_status(&response.line);
    if status >= 500 {
        debug!(status = status, "upstream server error, answering 502");
        return write_bad_gateway(&mut client).await;
    }

    counters.add_in(request_len);
    counters.add_out(content_length(&response.headers));

    client.write_all(response.to_bytes().as_slice()).await?;
    client.flush().await?;

    if upgrade && status != 101 {
        debug!(status = status, "upgrade refused by upstream");
    }

    // From here both directions are opaque bytes (body, or the upgraded
    // WebSocket stream). Accounting already happened above.
    let tunnel_counters = TrafficCounters::default();
    relay(client, remote, &tunnel_counters, cancel).await
}

// ─── head parsing ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Head {
    pub line: String,
    pub headers: Vec<(String, String)>,
}

impl Head {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    fn set_header(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str(&self.line);
        out.push_str("\r\n");
        for (k, v) in &self.headers {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Read one HTTP head (request or response) off the stream.
async fn read_head<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Head> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.is_empty() {
        bail!("connection closed before head");
    }
    let start = line.trim_end().to_string();
    if start.is_empty() {
        bail!("empty start line");
    }

    let mut headers = Vec::new();
    let mut total = start.len();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        total += line.len();
        if total > MAX_HEAD_BYTES {
            bail!("head exceeds {} bytes", MAX_HEAD_BYTES);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        match trimmed.split_once(':') {
            Some((k, v)) => headers.push((k.trim().to_string(), v.trim().to_string())),
            None => bail!("malformed header line: {}", trimmed),
        }
    }

    Ok(Head {
        line: start,
        headers,
    })
}

/// Rewrite a client request head for the upstream. Returns whether this is
/// an Upgrade (WebSocket) request, whose hop-by-hop headers must survive.
fn rewrite_for_upstream(head: &mut Head, upstream_host_port: &str, client_ip: IpAddr) -> bool {
    let upgrade = head
        .header("connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && head.header("upgrade").is_some();

    head.set_header("Host", upstream_host_port.to_string());
    head.set_header("X-Real-IP", client_ip.to_string());

    let forwarded = match head.header("x-forwarded-for") {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip.to_string(),
    };
    head.set_header("X-Forwarded-For", forwarded);

    if !upgrade {
        head.remove_header("connection");
        head.set_header("Connection", "close".to_string());
    }
    upgrade
}

fn content_length(headers: &[(String, String)]) -> u64 {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0)
}

fn response_status(line: &str) -> u16 {
    line.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Copy exactly `len` bytes between the streams through the buffer pool.
async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = crate::common::buffer::global_pool().acquire();
    let mut remaining = len;
    while remaining > 0 {
        let chunk = (buf.len() as u64).min(remaining) as usize;
        let n = reader.read(&mut buf[..chunk]).await?;
        if n == 0 {
            bail!("request body ended early, {} bytes missing", remaining);
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

async fn write_bad_gateway<W: AsyncWrite + Unpin>(stream: &mut W) -> Result<()> {
    stream
        .write_all(
            b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 11\r\nConnection: close\r\n\r\nBad Gateway",
        )
        .await?;
    let _ = stream.shutdown().await;
    Ok(())
}
