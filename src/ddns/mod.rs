//! DDNS reconciliation: resolve the current IP, diff against the published
//! value, and upsert records through a provider adapter.

pub mod ip_source;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::Error;
use crate::store::{DdnsTask, FileStore, WebhookConfig};
use crate::supervisor::Worker;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// Optional in-process hook fired after a cycle that published a new IP.
pub type ChangeHook = Arc<dyn Fn(u64, &str, &str) + Send + Sync>;

pub struct DdnsWorker {
    store: Arc<FileStore>,
    http: reqwest::Client,
    hook: Option<ChangeHook>,
}

impl DdnsWorker {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: ChangeHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// One reconcile cycle. A no-op (IP unchanged) is a success.
    async fn cycle(&self, task: &DdnsTask) -> Result<()> {
        let (provider_name, access_id, access_secret) = self.resolve_credentials(task).await?;

        let ip = ip_source::current_ip(&self.http, task).await?;
        if ip == task.current_ip {
            debug!(task = task.id, ip = %ip, "IP unchanged, skipping");
            return Ok(());
        }

        let old_ip = task.current_ip.clone();
        info!(task = task.id, old = %old_ip, new = %ip, "IP changed, updating DNS");

        if task.domains.is_empty() {
            warn!(task = task.id, "no domains configured, skipping");
            return Ok(());
        }

        let adapter = provider::create(&provider_name, &access_id, &access_secret)
            .ok_or_else(|| Error::Config(format!("unsupported DNS provider: {}", provider_name)))?;
        let record_type = task.family.record_type();

        let mut succeeded = 0usize;
        let mut last_error = String::new();
        for domain in &task.domains {
            if domain.is_empty() {
                continue;
            }
            let (rr, root) = provider::split_domain(domain);
            match adapter
                .upsert(&rr, &root, record_type, &ip, task.ttl)
                .await
            {
                Ok(()) => {
                    info!(task = task.id, domain = %domain, ip = %ip, "record updated");
                    succeeded += 1;
                    self.store
                        .append_history(task.id, &old_ip, &ip, domain, &provider_name, true, "")
                        .await;
                }
                Err(e) => {
                    let msg = format!("{:#}", e);
                    warn!(task = task.id, domain = %domain, error = %msg, "record update failed");
                    self.store
                        .append_history(task.id, &old_ip, &ip, domain, &provider_name, false, &msg)
                        .await;
                    last_error = msg;
                }
            }
        }

        if succeeded > 0 {
            // current_ip advances once any domain accepted the value.
            self.store
                .set_ddns_cycle(task.id, Some(&ip), &last_error)
                .await;
            if let Some(webhook) = &task.webhook {
                if let Err(e) = self.notify(webhook, task, &ip).await {
                    warn!(task = task.id, error = %format!("{:#}", e), "webhook notification failed");
                }
            }
            if let Some(hook) = &self.hook {
                hook(task.id, &old_ip, &ip);
            }
            Ok(())
        } else {
            self.store.set_ddns_cycle(task.id, None, &last_error).await;
            anyhow::bail!("all domain updates failed: {}", last_error)
        }
    }

    /// A linked account's credentials win; its provider fills in when the
    /// task leaves its own provider empty.
    async fn resolve_credentials(&self, task: &DdnsTask) -> Result<(String, String, String)> {
        if task.account_id > 0 {
            let account = self.store.dns_account(task.account_id).await?;
            let provider = if task.provider.is_empty() {
                account.provider
            } else {
                task.provider.clone()
            };
            return Ok((provider, account.access_id, account.access_secret));
        }
        Ok((
            task.provider.clone(),
            task.access_id.clone(),
            task.access_secret.clone(),
        ))
    }

    async fn notify(&self, webhook: &WebhookConfig, task: &DdnsTask, ip: &str) -> Result<()> {
        if webhook.url.is_empty() {
            return Ok(());
        }
        let domains = task.domains.join(",");
        let record_type = task.family.record_type();
        let expand = |s: &str| {
            s.replace("{ip}", ip)
                .replace("{domain}", &domains)
                .replace("{type}", record_type)
        };

        let url = expand(&webhook.url);
        let method = if webhook.method.is_empty() {
            "POST".to_string()
        } else {
            webhook.method.to_uppercase()
        };

        let mut request = self
            .http
            .request(
                method.parse().unwrap_or(reqwest::Method::POST),
                &url,
            )
            .timeout(WEBHOOK_TIMEOUT);
        if !webhook.body.is_empty() && method != "GET" {
            request = request
                .header("Content-Type", "application/json")
                .body(expand(&webhook.body));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            anyhow::bail!("webhook answered HTTP {}", status);
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for DdnsWorker {
    type Rule = DdnsTask;

    fn kind(&self) -> &'static str {
        "ddns"
    }

    async fn run(&self, task: DdnsTask, cancel: CancellationToken) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            // Interval and config are re-read every cycle, so edits apply on
            // the next tick without a restart.
            let Ok(fresh) = self.store.ddns_task(task.id).await else {
                return Ok(());
            };
            if !fresh.enable {
                return Ok(());
            }

            let wait = match self.cycle(&fresh).await {
                Ok(()) => {
                    backoff = INITIAL_BACKOFF;
                    fresh.effective_interval()
                }
                Err(e) => {
                    let msg = format!("{:#}", e);
                    warn!(task = fresh.id, backoff = ?backoff, error = %msg, "ddns cycle failed");
                    self.store.set_ddns_cycle(fresh.id, None, &msg).await;
                    let wait = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    wait
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
