//! Port-forward data plane: one worker per rule, dispatching to the
//! listener implementation the rule's `listen_kind` selects.

pub mod http;
pub mod relay;
pub mod socks5;
pub mod tcp;
pub mod tls;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::common::traffic::TrafficCounters;
use crate::store::{FileStore, ListenKind, PortForwardRule};
use crate::supervisor::Worker;

/// How often live traffic counters are flushed into the rule row.
const TRAFFIC_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

pub struct PortForwardWorker {
    store: Arc<FileStore>,
}

impl PortForwardWorker {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Worker for PortForwardWorker {
    type Rule = PortForwardRule;

    fn kind(&self) -> &'static str {
        "port-forward"
    }

    async fn run(&self, rule: PortForwardRule, cancel: CancellationToken) -> Result<()> {
        // Counters are per-spawn: a restarted worker starts from zero.
        let counters = TrafficCounters::new();
        let id = rule.id;

        let serve = async {
            match rule.listen_kind {
                ListenKind::Tcp => tcp::serve(&rule, counters.clone(), cancel.clone()).await,
                ListenKind::Udp => udp::serve(&rule, counters.clone(), cancel.clone()).await,
                ListenKind::Http | ListenKind::Ws | ListenKind::Https => {
                    http::serve(&rule, counters.clone(), cancel.clone()).await
                }
                ListenKind::Socks5 => socks5::serve(&rule, counters.clone(), cancel.clone()).await,
            }
        };
        tokio::pin!(serve);

        let mut flush = tokio::time::interval(TRAFFIC_FLUSH_INTERVAL);
        flush.tick().await;

        let result = loop {
            tokio::select! {
                r = &mut serve => break r,
                _ = flush.tick() => {
                    self.store
                        .set_port_forward_traffic(id, counters.inbound(), counters.outbound())
                        .await;
                }
            }
        };

        self.store
            .set_port_forward_traffic(id, counters.inbound(), counters.outbound())
            .await;
        result
    }
}
