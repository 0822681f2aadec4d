//! Rule store: typed read/write access to the persisted rule rows.
//!
//! Rows live in memory behind one `RwLock`, so a status written from worker
//! A is visible to worker B on its next read. The whole table set is
//! snapshotted to `<data>/rules.json` atomically (write tmp, rename) by a
//! periodic save task and once more on shutdown.

pub mod models;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use models::*;

pub const STORE_FILE: &str = "rules.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    port_forwards: Vec<PortForwardRule>,
    #[serde(default)]
    stun_rules: Vec<StunRule>,
    #[serde(default)]
    ddns_tasks: Vec<DdnsTask>,
    #[serde(default)]
    dns_accounts: Vec<DnsAccount>,
    #[serde(default)]
    callback_tasks: Vec<CallbackTask>,
    #[serde(default)]
    callback_accounts: Vec<CallbackAccount>,
    #[serde(default)]
    ddns_histories: Vec<DdnsHistory>,
    #[serde(default)]
    next_history_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreSummary {
    pub port_forwards: usize,
    pub stun_rules: usize,
    pub ddns_tasks: usize,
    pub callback_tasks: usize,
    pub histories: usize,
}

pub struct FileStore {
    path: PathBuf,
    tables: RwLock<Tables>,
    dirty: AtomicBool,
}

impl FileStore {
    /// Open the store rooted at `data_dir`, loading `rules.json` if present.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = data_dir.as_ref().join(STORE_FILE);
        let tables = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        Ok(Arc::new(Self {
            path,
            tables: RwLock::new(tables),
            dirty: AtomicBool::new(false),
        }))
    }

    /// Snapshot all tables to disk. Atomic: write a temp file, then rename.
    pub async fn save(&self) -> Result<()> {
        let json = {
            let tables = self.tables.read().await;
            serde_json::to_string_pretty(&*tables)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        self.dirty.store(false, Ordering::Relaxed);
        debug!(bytes = json.len(), "rule store saved");
        Ok(())
    }

    /// Periodically flush dirty state; one final save when cancelled.
    pub fn spawn_periodic_save(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = store.save().await {
                            warn!(error = %e, "final rule store save failed");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if store.dirty.load(Ordering::Relaxed) {
                            if let Err(e) = store.save().await {
                                warn!(error = %e, "periodic rule store save failed");
                            }
                        }
                    }
                }
            }
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Table sizes, for `check`-style tooling.
    pub async fn summary(&self) -> StoreSummary {
        let tables = self.tables.read().await;
        StoreSummary {
            port_forwards: tables.port_forwards.len(),
            stun_rules: tables.stun_rules.len(),
            ddns_tasks: tables.ddns_tasks.len(),
            callback_tasks: tables.callback_tasks.len(),
            histories: tables.ddns_histories.len(),
        }
    }

    // ─── port forward rules ────────────────────────────────────────────────

    pub async fn port_forward(&self, id: u64) -> Result<PortForwardRule> {
        self.tables
            .read()
            .await
            .port_forwards
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .with_context(|| format!("port forward rule {} not found", id))
    }

    pub async fn list_enabled_port_forwards(&self) -> Vec<PortForwardRule> {
        self.tables
            .read()
            .await
            .port_forwards
            .iter()
            .filter(|r| r.enable)
            .cloned()
            .collect()
    }

    pub async fn upsert_port_forward(&self, rule: PortForwardRule) {
        let mut tables = self.tables.write().await;
        match tables.port_forwards.iter_mut().find(|r| r.id == rule.id) {
            Some(slot) => *slot = rule,
            None => tables.port_forwards.push(rule),
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn remove_port_forward(&self, id: u64) {
        self.tables.write().await.port_forwards.retain(|r| r.id != id);
        self.mark_dirty();
    }

    pub async fn set_port_forward_status(&self, id: u64, status: RuleStatus, last_error: &str) {
        let mut tables = self.tables.write().await;
        if let Some(rule) = tables.port_forwards.iter_mut().find(|r| r.id == id) {
            rule.status = status;
            rule.last_error = last_error.to_string();
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn set_port_forward_enable(&self, id: u64, enable: bool) {
        let mut tables = self.tables.write().await;
        if let Some(rule) = tables.port_forwards.iter_mut().find(|r| r.id == id) {
            rule.enable = enable;
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn set_port_forward_traffic(&self, id: u64, traffic_in: u64, traffic_out: u64) {
        let mut tables = self.tables.write().await;
        if let Some(rule) = tables.port_forwards.iter_mut().find(|r| r.id == id) {
            rule.traffic_in = traffic_in;
            rule.traffic_out = traffic_out;
        }
        drop(tables);
        self.mark_dirty();
    }

    // ─── STUN rules ────────────────────────────────────────────────────────

    pub async fn stun_rule(&self, id: u64) -> Result<StunRule> {
        self.tables
            .read()
            .await
            .stun_rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .with_context(|| format!("stun rule {} not found", id))
    }

    pub async fn list_enabled_stun_rules(&self) -> Vec<StunRule> {
        self.tables
            .read()
            .await
            .stun_rules
            .iter()
            .filter(|r| r.enable)
            .cloned()
            .collect()
    }

    pub async fn upsert_stun_rule(&self, rule: StunRule) {
        let mut tables = self.tables.write().await;
        match tables.stun_rules.iter_mut().find(|r| r.id == rule.id) {
            Some(slot) => *slot = rule,
            None => tables.stun_rules.push(rule),
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn set_stun_status(&self, id: u64, status: RuleStatus, last_error: &str) {
        let mut tables = self.tables.write().await;
        if let Some(rule) = tables.stun_rules.iter_mut().find(|r| r.id == id) {
            rule.status = status;
            rule.last_error = last_error.to_string();
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn set_stun_enable(&self, id: u64, enable: bool) {
        let mut tables = self.tables.write().await;
        if let Some(rule) = tables.stun_rules.iter_mut().find(|r| r.id == id) {
            rule.enable = enable;
        }
        drop(tables);
        self.mark_dirty();
    }

    /// A successful probe: mapped address, NAT class, penetration state.
    pub async fn set_stun_observation(&self, id: u64, ip: &str, port: u16, nat_type: &str) {
        let mut tables = self.tables.write().await;
        if let Some(rule) = tables.stun_rules.iter_mut().find(|r| r.id == id) {
            rule.current_ip = ip.to_string();
            rule.current_port = port;
            rule.nat_type = nat_type.to_string();
            rule.stun_status = Some(StunStatus::Penetrating);
            rule.last_error.clear();
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn set_stun_probe_failure(&self, id: u64, stun_status: StunStatus, error: &str) {
        let mut tables = self.tables.write().await;
        if let Some(rule) = tables.stun_rules.iter_mut().find(|r| r.id == id) {
            rule.stun_status = Some(stun_status);
            rule.last_error = error.to_string();
        }
        drop(tables);
        self.mark_dirty();
    }

    // ─── DDNS tasks ────────────────────────────────────────────────────────

    pub async fn ddns_task(&self, id: u64) -> Result<DdnsTask> {
        self.tables
            .read()
            .await
            .ddns_tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .with_context(|| format!("ddns task {} not found", id))
    }

    pub async fn list_enabled_ddns_tasks(&self) -> Vec<DdnsTask> {
        self.tables
            .read()
            .await
            .ddns_tasks
            .iter()
            .filter(|t| t.enable)
            .cloned()
            .collect()
    }

    pub async fn upsert_ddns_task(&self, task: DdnsTask) {
        let mut tables = self.tables.write().await;
        match tables.ddns_tasks.iter_mut().find(|t| t.id == task.id) {
            Some(slot) => *slot = task,
            None => tables.ddns_tasks.push(task),
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn set_ddns_status(&self, id: u64, status: RuleStatus, last_error: &str) {
        let mut tables = self.tables.write().await;
        if let Some(task) = tables.ddns_tasks.iter_mut().find(|t| t.id == id) {
            task.status = status;
            task.last_error = last_error.to_string();
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn set_ddns_enable(&self, id: u64, enable: bool) {
        let mut tables = self.tables.write().await;
        if let Some(task) = tables.ddns_tasks.iter_mut().find(|t| t.id == id) {
            task.enable = enable;
        }
        drop(tables);
        self.mark_dirty();
    }

    /// Record the outcome of a DDNS cycle. `published_ip` is set only when
    /// at least one domain accepted the new value; `last_error` carries the
    /// latest per-domain failure (empty on a clean cycle).
    pub async fn set_ddns_cycle(&self, id: u64, published_ip: Option<&str>, last_error: &str) {
        let mut tables = self.tables.write().await;
        if let Some(task) = tables.ddns_tasks.iter_mut().find(|t| t.id == id) {
            if let Some(ip) = published_ip {
                task.current_ip = ip.to_string();
                task.last_update_time = Some(chrono::Utc::now());
            }
            task.last_error = last_error.to_string();
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn dns_account(&self, id: u64) -> Result<DnsAccount> {
        self.tables
            .read()
            .await
            .dns_accounts
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .with_context(|| format!("dns account {} not found", id))
    }

    pub async fn upsert_dns_account(&self, account: DnsAccount) {
        let mut tables = self.tables.write().await;
        match tables.dns_accounts.iter_mut().find(|a| a.id == account.id) {
            Some(slot) => *slot = account,
            None => tables.dns_accounts.push(account),
        }
        drop(tables);
        self.mark_dirty();
    }

    // ─── DDNS history ──────────────────────────────────────────────────────

    pub async fn append_history(
        &self,
        task_id: u64,
        old_ip: &str,
        new_ip: &str,
        domain: &str,
        provider: &str,
        success: bool,
        message: &str,
    ) {
        let mut tables = self.tables.write().await;
        tables.next_history_id += 1;
        let id = tables.next_history_id;
        tables.ddns_histories.push(DdnsHistory {
            id,
            task_id,
            old_ip: old_ip.to_string(),
            new_ip: new_ip.to_string(),
            domain: domain.to_string(),
            provider: provider.to_string(),
            success,
            message: message.to_string(),
            created_at: chrono::Utc::now(),
        });
        drop(tables);
        self.mark_dirty();
    }

    /// Newest-first page of a task's history. Pages are 1-based.
    pub async fn list_histories(
        &self,
        task_id: u64,
        page: usize,
        page_size: usize,
    ) -> (Vec<DdnsHistory>, usize) {
        let tables = self.tables.read().await;
        let mut rows: Vec<DdnsHistory> = tables
            .ddns_histories
            .iter()
            .filter(|h| h.task_id == task_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        let total = rows.len();
        let page = page.max(1);
        let start = (page - 1) * page_size.max(1);
        let rows = rows.into_iter().skip(start).take(page_size.max(1)).collect();
        (rows, total)
    }

    // ─── callback tasks & accounts ─────────────────────────────────────────

    pub async fn callback_account(&self, id: u64) -> Result<CallbackAccount> {
        self.tables
            .read()
            .await
            .callback_accounts
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .with_context(|| format!("callback account {} not found", id))
    }

    pub async fn upsert_callback_account(&self, account: CallbackAccount) {
        let mut tables = self.tables.write().await;
        match tables
            .callback_accounts
            .iter_mut()
            .find(|a| a.id == account.id)
        {
            Some(slot) => *slot = account,
            None => tables.callback_accounts.push(account),
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn upsert_callback_task(&self, task: CallbackTask) {
        let mut tables = self.tables.write().await;
        match tables.callback_tasks.iter_mut().find(|t| t.id == task.id) {
            Some(slot) => *slot = task,
            None => tables.callback_tasks.push(task),
        }
        drop(tables);
        self.mark_dirty();
    }

    pub async fn callback_task(&self, id: u64) -> Result<CallbackTask> {
        self.tables
            .read()
            .await
            .callback_tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .with_context(|| format!("callback task {} not found", id))
    }

    pub async fn list_enabled_callback_tasks(&self, trigger_type: &str) -> Vec<CallbackTask> {
        self.tables
            .read()
            .await
            .callback_tasks
            .iter()
            .filter(|t| t.enable && t.trigger_type == trigger_type)
            .cloned()
            .collect()
    }

    pub async fn set_callback_result(&self, id: u64, error: Option<&str>) {
        let mut tables = self.tables.write().await;
        if let Some(task) = tables.callback_tasks.iter_mut().find(|t| t.id == id) {
            match error {
                None => {
                    task.last_trigger_time = Some(chrono::Utc::now());
                    task.last_error.clear();
                }
                Some(e) => task.last_error = e.to_string(),
            }
        }
        drop(tables);
        self.mark_dirty();
    }
}

// ─── supervisor-facing table views ─────────────────────────────────────────

/// Narrow, typed view of one rule table. The supervisor is generic over the
/// rule kind and talks to the store only through this trait.
#[async_trait]
pub trait RuleTable<R>: Send + Sync + 'static {
    async fn load(&self, id: u64) -> Result<R>;
    async fn is_enabled(&self, id: u64) -> bool;
    async fn list_enabled(&self) -> Vec<R>;
    async fn set_status(&self, id: u64, status: RuleStatus, last_error: &str);
}

pub struct PortForwardTable(pub Arc<FileStore>);

#[async_trait]
impl RuleTable<PortForwardRule> for PortForwardTable {
    async fn load(&self, id: u64) -> Result<PortForwardRule> {
        self.0.port_forward(id).await
    }

    async fn is_enabled(&self, id: u64) -> bool {
        self.0.port_forward(id).await.map(|r| r.enable).unwrap_or(false)
    }

    async fn list_enabled(&self) -> Vec<PortForwardRule> {
        self.0.list_enabled_port_forwards().await
    }

    async fn set_status(&self, id: u64, status: RuleStatus, last_error: &str) {
        self.0.set_port_forward_status(id, status, last_error).await;
    }
}

pub struct StunTable(pub Arc<FileStore>);

#[async_trait]
impl RuleTable<StunRule> for StunTable {
    async fn load(&self, id: u64) -> Result<StunRule> {
        self.0.stun_rule(id).await
    }

    async fn is_enabled(&self, id: u64) -> bool {
        self.0.stun_rule(id).await.map(|r| r.enable).unwrap_or(false)
    }

    async fn list_enabled(&self) -> Vec<StunRule> {
        self.0.list_enabled_stun_rules().await
    }

    async fn set_status(&self, id: u64, status: RuleStatus, last_error: &str) {
        self.0.set_stun_status(id, status, last_error).await;
    }
}

pub struct DdnsTable(pub Arc<FileStore>);

#[async_trait]
impl RuleTable<DdnsTask> for DdnsTable {
    async fn load(&self, id: u64) -> Result<DdnsTask> {
        self.0.ddns_task(id).await
    }

    async fn is_enabled(&self, id: u64) -> bool {
        self.0.ddns_task(id).await.map(|t| t.enable).unwrap_or(false)
    }

    async fn list_enabled(&self) -> Vec<DdnsTask> {
        self.0.list_enabled_ddns_tasks().await
    }

    async fn set_status(&self, id: u64, status: RuleStatus, last_error: &str) {
        self.0.set_ddns_status(id, status, last_error).await;
    }
}
