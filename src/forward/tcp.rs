//! Transparent TCP forwarding.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::traffic::{ConnectionLimiter, TrafficCounters};
use crate::common::Error;
use crate::store::PortForwardRule;

use super::relay::relay;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

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
    let target = rule.target_addr();

    info!(listen = %addr, target = %target, "tcp forward listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(listen = %addr, "tcp forward shutting down");
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

                let target = target.clone();
                let counters = counters.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let remote = match tokio::time::timeout(
                        DIAL_TIMEOUT,
                        TcpStream::connect(&target),
                    )
                    .await
                    {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            error!(target = %target, error = %e, "dial target failed");
                            return;
                        }
                        Err(_) => {
                            error!(target = %target, "dial target timed out");
                            return;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let _ = remote.set_nodelay(true);

                    if let Err(e) = relay(stream, remote, &counters, &cancel).await {
                        debug!(peer = %peer, error = %e, "relay ended with error");
                    }
                });
            }
        }
    }
}
