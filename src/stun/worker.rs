//! Periodic STUN probing with change detection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::callback::{EventKind, EventSender, TriggerEvent};
use crate::store::{FileStore, StunRule, StunStatus};
use crate::supervisor::Worker;

use super::classify::{classify, probe_basic, NatType};
use super::{is_timeout, upnp, StunError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub struct StunWorker {
    store: Arc<FileStore>,
    events: EventSender,
}

impl StunWorker {
    pub fn new(store: Arc<FileStore>, events: EventSender) -> Self {
        Self { store, events }
    }

    /// One probe cycle: STUN (full or basic), then optionally overwrite the
    /// observed mapping with a UPnP lease.
    async fn check(&self, rule: &StunRule) -> Result<(String, u16, NatType)> {
        let server = rule.stun_server_or_default();

        let info = if rule.disable_validation {
            probe_basic(server).await?
        } else {
            classify(server).await?
        };
        if info.ip.is_empty() {
            // UdpBlocked: no binding response at all.
            return Err(StunError::Timeout("binding response").into());
        }

        let mut ip = info.ip;
        let mut port = info.port;

        if rule.use_upnp && rule.target_port > 0 {
            match upnp::map_port(rule.target_port, &rule.target_proto).await {
                Ok((external_ip, external_port)) => {
                    info!(
                        rule = rule.id,
                        external = %format!("{}:{}", external_ip, external_port),
                        "UPnP mapping established"
                    );
                    ip = external_ip;
                    port = external_port;
                }
                Err(e) => {
                    warn!(rule = rule.id, error = %format!("{:#}", e), "UPnP mapping failed, keeping STUN result");
                }
            }
        }

        Ok((ip, port, info.nat_type))
    }
}

#[async_trait]
impl Worker for StunWorker {
    type Rule = StunRule;

    fn kind(&self) -> &'static str {
        "stun"
    }

    async fn run(&self, rule: StunRule, cancel: CancellationToken) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_seen: Option<(String, u16)> = None;

        loop {
            // Re-read each tick so config edits apply without a restart.
            let Ok(fresh) = self.store.stun_rule(rule.id).await else {
                return Ok(());
            };
            if !fresh.enable {
                return Ok(());
            }

            match self.check(&fresh).await {
                Ok((ip, port, nat_type)) => {
                    let changed = last_seen
                        .as_ref()
                        .map(|(seen_ip, seen_port)| seen_ip != &ip || *seen_port != port)
                        .unwrap_or(true);

                    self.store
                        .set_stun_observation(fresh.id, &ip, port, &nat_type.to_string())
                        .await;

                    if changed {
                        info!(
                            rule = fresh.id,
                            mapped = %format!("{}:{}", ip, port),
                            nat = %nat_type,
                            "mapped address changed"
                        );
                        let (old_ip, old_port) = last_seen.clone().unwrap_or_default();
                        self.events.emit(TriggerEvent {
                            kind: EventKind::StunIpChange,
                            source_id: fresh.id,
                            old_ip,
                            new_ip: ip.clone(),
                            old_port,
                            new_port: port,
                        });
                    }

                    last_seen = Some((ip, port));
                    backoff = INITIAL_BACKOFF;

                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(CHECK_INTERVAL) => {}
                    }
                }
                Err(e) => {
                    let msg = format!("{:#}", e);
                    let status = if is_timeout(&e) {
                        StunStatus::Timeout
                    } else {
                        StunStatus::Failed
                    };
                    warn!(rule = fresh.id, backoff = ?backoff, error = %msg, "stun probe failed");
                    self.store
                        .set_stun_probe_failure(fresh.id, status, &msg)
                        .await;

                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}
