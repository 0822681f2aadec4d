//! Per-rule worker lifecycle.
//!
//! A supervisor reconciles desired state (rule rows that say `enable`) with
//! actual state (running tasks). One supervisor instance exists per rule
//! kind; all share the process-wide `shutting_down` flag that suppresses
//! crash-restart during shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::error::is_fatal;
use crate::store::{DdnsTask, PortForwardRule, RuleStatus, RuleTable, StunRule};

/// How long `stop` waits for a cancelled worker before abandoning it.
const STOP_WAIT: Duration = Duration::from_secs(5);
/// Settle delay between stop and start on restart, so sockets free up.
const RESTART_SETTLE: Duration = Duration::from_millis(300);
/// A run that lasted this long counts as healthy and resets the backoff.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

pub trait RuleMeta {
    fn id(&self) -> u64;
    fn rule_name(&self) -> &str;
}

impl RuleMeta for PortForwardRule {
    fn id(&self) -> u64 {
        self.id
    }
    fn rule_name(&self) -> &str {
        &self.name
    }
}

impl RuleMeta for StunRule {
    fn id(&self) -> u64 {
        self.id
    }
    fn rule_name(&self) -> &str {
        &self.name
    }
}

impl RuleMeta for DdnsTask {
    fn id(&self) -> u64 {
        self.id
    }
    fn rule_name(&self) -> &str {
        &self.name
    }
}

/// One long-running task per rule. `run` must treat the token as a
/// cooperative stop signal: return `Ok(())` once it fires, and never hold a
/// resource across a suspension point that cancellation would leak.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Rule: RuleMeta + Clone + Send + Sync + 'static;

    fn kind(&self) -> &'static str;

    async fn run(&self, rule: Self::Rule, cancel: CancellationToken) -> Result<()>;
}

/// Crash-restart pacing. Forwarders respawn at a flat delay; the periodic
/// STUN/DDNS workers double up to a cap.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl RestartPolicy {
    pub fn flat() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(5),
        }
    }

    pub fn backoff() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

struct WorkerHandle {
    generation: u64,
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

pub struct Supervisor<W: Worker> {
    worker: Arc<W>,
    table: Arc<dyn RuleTable<W::Rule>>,
    handles: Mutex<HashMap<u64, WorkerHandle>>,
    shutting_down: Arc<AtomicBool>,
    policy: RestartPolicy,
    next_generation: AtomicU64,
}

impl<W: Worker> Supervisor<W> {
    pub fn new(
        worker: W,
        table: Arc<dyn RuleTable<W::Rule>>,
        policy: RestartPolicy,
        shutting_down: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker: Arc::new(worker),
            table,
            handles: Mutex::new(HashMap::new()),
            shutting_down,
            policy,
            next_generation: AtomicU64::new(1),
        })
    }

    /// Spawn a worker for the rule, stopping any previous one first.
    pub async fn start(self: &Arc<Self>, id: u64) -> Result<()> {
        self.stop(id).await;

        let rule = self.table.load(id).await?;
        self.table.set_status(id, RuleStatus::Starting, "").await;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut handles = self.handles.lock().await;
            handles.insert(
                id,
                WorkerHandle {
                    generation,
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        // Running is written before the spawn so a fast-failing worker's
        // Error/Stopped writes are never clobbered by this one.
        self.table.set_status(id, RuleStatus::Running, "").await;

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.monitor(id, generation, rule, cancel).await;
            let _ = done_tx.send(());
        });

        info!(kind = self.worker.kind(), rule = id, "worker started");
        Ok(())
    }

    /// Cancel the rule's worker and wait (bounded) for it to finish.
    /// A no-op when no worker is present.
    pub async fn stop(&self, id: u64) {
        let handle = self.handles.lock().await.remove(&id);
        let Some(handle) = handle else { return };

        handle.cancel.cancel();
        if tokio::time::timeout(STOP_WAIT, handle.done).await.is_err() {
            warn!(
                kind = self.worker.kind(),
                rule = id,
                "worker did not finish within {:?}, abandoning wait",
                STOP_WAIT
            );
        }
        self.table.set_status(id, RuleStatus::Stopped, "").await;
        info!(kind = self.worker.kind(), rule = id, "worker stopped");
    }

    pub async fn restart(self: &Arc<Self>, id: u64) -> Result<()> {
        self.stop(id).await;
        tokio::time::sleep(RESTART_SETTLE).await;
        self.start(id).await
    }

    /// Start every enabled rule, tolerating individual failures.
    pub async fn start_all_enabled(self: &Arc<Self>) {
        for rule in self.table.list_enabled().await {
            if let Err(e) = self.start(rule.id()).await {
                error!(
                    kind = self.worker.kind(),
                    rule = rule.id(),
                    name = rule.rule_name(),
                    error = %e,
                    "failed to start worker"
                );
            }
        }
    }

    /// Cancel every worker concurrently, waiting up to [`STOP_WAIT`] each.
    /// Sets the shared shutting-down flag first so no crash-restart fires.
    pub async fn stop_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let drained: Vec<(u64, WorkerHandle)> =
            self.handles.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        let mut waits = tokio::task::JoinSet::new();
        for (id, handle) in drained {
            handle.cancel.cancel();
            waits.spawn(async move {
                (id, tokio::time::timeout(STOP_WAIT, handle.done).await.is_ok())
            });
        }
        while let Some(joined) = waits.join_next().await {
            if let Ok((id, finished)) = joined {
                if !finished {
                    warn!(kind = self.worker.kind(), rule = id, "worker abandoned at shutdown");
                }
            }
        }
        info!(kind = self.worker.kind(), "all workers stopped");
    }

    /// Whether a worker task is currently tracked for the rule.
    pub async fn is_running(&self, id: u64) -> bool {
        self.handles.lock().await.contains_key(&id)
    }

    /// Drives one rule's worker, respawning after transient failures.
    async fn monitor(&self, id: u64, generation: u64, rule: W::Rule, cancel: CancellationToken) {
        let mut rule = rule;
        let mut delay = self.policy.initial;

        loop {
            let started = Instant::now();
            match self.worker.run(rule.clone(), cancel.clone()).await {
                Ok(()) => {
                    self.table.set_status(id, RuleStatus::Stopped, "").await;
                    break;
                }
                Err(e) => {
                    let msg = format!("{:#}", e);
                    error!(kind = self.worker.kind(), rule = id, error = %msg, "worker failed");
                    self.table
                        .set_status(id, RuleStatus::Error(msg.clone()), &msg)
                        .await;

                    let no_restart = cancel.is_cancelled()
                        || self.shutting_down.load(Ordering::SeqCst)
                        || is_fatal(&e)
                        || !self.table.is_enabled(id).await;
                    if no_restart {
                        self.table.set_status(id, RuleStatus::Stopped, &msg).await;
                        break;
                    }

                    if started.elapsed() >= HEALTHY_RUN {
                        delay = self.policy.initial;
                    }
                    warn!(
                        kind = self.worker.kind(),
                        rule = id,
                        delay = ?delay,
                        "respawning worker"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.table.set_status(id, RuleStatus::Stopped, &msg).await;
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.policy.max);

                    // Pick up any config edits made while we were down.
                    match self.table.load(id).await {
                        Ok(fresh) => rule = fresh,
                        Err(_) => {
                            self.table.set_status(id, RuleStatus::Stopped, &msg).await;
                            break;
                        }
                    }
                    self.table.set_status(id, RuleStatus::Running, "").await;
                }
            }
        }

        // Drop our own handle unless a newer start() already replaced it.
        let mut handles = self.handles.lock().await;
        if handles.get(&id).map(|h| h.generation) == Some(generation) {
            handles.remove(&id);
        }
    }
}
