//! Bidirectional copy loop shared by the stream forwarders.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::buffer::global_pool;
use crate::common::traffic::TrafficCounters;

enum CopyEvent {
    ClientRead(std::io::Result<usize>),
    RemoteRead(std::io::Result<usize>),
    Cancelled,
}

/// Copy both directions until EOF on both sides, an error, or cancellation.
/// Bytes client→remote land in `counters.add_in`, remote→client in
/// `counters.add_out`. Half-close is honored: EOF on one side shuts down the
/// peer's write half and drains the other direction.
pub async fn relay<A, B>(
    mut client: A,
    mut remote: B,
    counters: &TrafficCounters,
    cancel: &CancellationToken,
) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let pool = global_pool();
    let mut buf_in = pool.acquire();
    let mut buf_out = pool.acquire();

    let mut client_done = false;
    let mut remote_done = false;

    loop {
        if client_done && remote_done {
            break;
        }

        let event = tokio::select! {
            r = client.read(&mut buf_in), if !client_done => CopyEvent::ClientRead(r),
            r = remote.read(&mut buf_out), if !remote_done => CopyEvent::RemoteRead(r),
            _ = cancel.cancelled() => CopyEvent::Cancelled,
        };

        match event {
            CopyEvent::Cancelled => {
                debug!("relay cancelled");
                break;
            }
            CopyEvent::ClientRead(Ok(0)) => {
                client_done = true;
                let _ = remote.shutdown().await;
            }
            CopyEvent::ClientRead(Ok(n)) => {
                remote.write_all(&buf_in[..n]).await?;
                counters.add_in(n as u64);
            }
            CopyEvent::ClientRead(Err(e)) => {
                debug!(error = %e, "client read error");
                break;
            }
            CopyEvent::RemoteRead(Ok(0)) => {
                remote_done = true;
                let _ = client.shutdown().await;
            }
            CopyEvent::RemoteRead(Ok(n)) => {
                client.write_all(&buf_out[..n]).await?;
                counters.add_out(n as u64);
            }
            CopyEvent::RemoteRead(Err(e)) => {
                debug!(error = %e, "remote read error");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relay_counts_both_directions() {
        let (mut client_a, client_b) = duplex(1024);
        let (remote_a, mut remote_b) = duplex(1024);

        let counters = TrafficCounters::new();
        let counters_relay = counters.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move {
            relay(client_b, remote_a, &counters_relay, &cancel).await
        });

        client_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = remote_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        remote_b.write_all(b"pong!").await.unwrap();
        let n = client_a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong!");

        client_a.shutdown().await.unwrap();
        remote_b.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(counters.inbound(), 4);
        assert_eq!(counters.outbound(), 5);
    }

    #[tokio::test]
    async fn relay_stops_on_cancel() {
        let (_client_a, client_b) = duplex(64);
        let (remote_a, _remote_b) = duplex(64);

        let counters = TrafficCounters::new();
        let cancel = CancellationToken::new();
        let cancel_inner = cancel.clone();
        let handle = tokio::spawn(async move {
            relay(client_b, remote_a, &counters, &cancel_inner).await
        });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay should return promptly after cancel")
            .unwrap()
            .unwrap();
    }
}
