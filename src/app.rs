//! Wiring: rule store, supervisors, callback dispatcher, shutdown.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::callback::{start_dispatcher, EventSender};
use crate::ddns::DdnsWorker;
use crate::forward::PortForwardWorker;
use crate::store::{DdnsTable, FileStore, PortForwardTable, StunTable};
use crate::stun::StunWorker;
use crate::supervisor::{RestartPolicy, Supervisor};

const STORE_SAVE_INTERVAL: Duration = Duration::from_secs(30);

pub struct App {
    store: Arc<FileStore>,
    forwards: Arc<Supervisor<PortForwardWorker>>,
    stun: Arc<Supervisor<StunWorker>>,
    ddns: Arc<Supervisor<DdnsWorker>>,
    events: EventSender,
    cancel: CancellationToken,
}

impl App {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let store = FileStore::open(data_dir)?;
        let cancel = CancellationToken::new();
        let shutting_down = Arc::new(AtomicBool::new(false));

        let events = start_dispatcher(store.clone(), cancel.clone());

        let forwards = Supervisor::new(
            PortForwardWorker::new(store.clone()),
            Arc::new(PortForwardTable(store.clone())),
            RestartPolicy::flat(),
            shutting_down.clone(),
        );
        let stun = Supervisor::new(
            StunWorker::new(store.clone(), events.clone()),
            Arc::new(StunTable(store.clone())),
            RestartPolicy::backoff(),
            shutting_down.clone(),
        );
        let ddns = Supervisor::new(
            DdnsWorker::new(store.clone()),
            Arc::new(DdnsTable(store.clone())),
            RestartPolicy::backoff(),
            shutting_down,
        );

        Ok(Self {
            store,
            forwards,
            stun,
            ddns,
            events,
            cancel,
        })
    }

    /// Start every enabled rule and park until SIGINT.
    pub async fn run(self) -> Result<()> {
        let save_task = self
            .store
            .spawn_periodic_save(STORE_SAVE_INTERVAL, self.cancel.clone());

        self.forwards.start_all_enabled().await;
        self.stun.start_all_enabled().await;
        self.ddns.start_all_enabled().await;
        info!("netward started");

        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C, shutting down");

        self.shutdown().await;
        let _ = save_task.await;
        Ok(())
    }

    /// Stop every worker in parallel, then tear down the background tasks
    /// (the store save task flushes once more on cancel).
    pub async fn shutdown(&self) {
        tokio::join!(
            self.forwards.stop_all(),
            self.stun.stop_all(),
            self.ddns.stop_all(),
        );
        self.cancel.cancel();
        info!("shutdown complete");
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    pub fn forwards(&self) -> &Arc<Supervisor<PortForwardWorker>> {
        &self.forwards
    }

    pub fn stun(&self) -> &Arc<Supervisor<StunWorker>> {
        &self.stun
    }

    pub fn ddns(&self) -> &Arc<Supervisor<DdnsWorker>> {
        &self.ddns
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
