//! Event-driven callback dispatch.
//!
//! Workers emit [`TriggerEvent`]s into a bounded queue; a single consumer
//! matches them against enabled callback tasks and fans out executor
//! invocations. A full queue drops the event with a warning; recent
//! freshness beats durability here.

pub mod executor;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::FileStore;

pub const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StunIpChange,
    FrpReconnect,
    EasytierReconnect,
    Test,
}

impl EventKind {
    /// The persisted `trigger_type` string this event matches.
    pub fn trigger_type(&self) -> &'static str {
        match self {
            EventKind::StunIpChange => "stun",
            EventKind::FrpReconnect => "frp",
            EventKind::EasytierReconnect => "easytier",
            EventKind::Test => "test",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub kind: EventKind,
    pub source_id: u64,
    pub old_ip: String,
    pub new_ip: String,
    pub old_port: u16,
    pub new_port: u16,
}

/// Cheap cloneable handle workers use to emit events.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<TriggerEvent>,
}

impl EventSender {
    pub fn emit(&self, event: TriggerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(kind = ?event.kind, source = event.source_id, "callback queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("callback dispatcher gone, event dropped");
            }
        }
    }

    /// A sender wired to nothing; emitted events vanish. For tests and for
    /// embedding without a dispatcher.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    /// A sender plus its raw receiving end, bypassing the dispatcher.
    /// Embedders (and tests) can consume events directly.
    pub fn channel() -> (Self, mpsc::Receiver<TriggerEvent>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }
}

/// Spawn the single consumer task and hand back the emit side.
pub fn start_dispatcher(store: Arc<FileStore>, cancel: CancellationToken) -> EventSender {
    let (tx, mut rx) = mpsc::channel::<TriggerEvent>(QUEUE_CAPACITY);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("callback dispatcher shutting down");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    handle_event(&store, event).await;
                }
            }
        }
    });

    EventSender { tx }
}

async fn handle_event(store: &Arc<FileStore>, event: TriggerEvent) {
    let trigger_type = event.kind.trigger_type();
    let tasks = store.list_enabled_callback_tasks(trigger_type).await;
    debug!(
        kind = ?event.kind,
        source = event.source_id,
        matched = tasks.len(),
        "dispatching callback event"
    );

    for task in tasks {
        if task.trigger_source_id != 0 && task.trigger_source_id != event.source_id {
            continue;
        }
        let store = store.clone();
        let event = event.clone();
        tokio::spawn(async move {
            let outcome = run_task(&store, task.account_id, &event).await;
            match outcome {
                Ok(()) => {
                    info!(task = task.id, name = %task.name, "callback executed");
                    store.set_callback_result(task.id, None).await;
                }
                Err(e) => {
                    let msg = format!("{:#}", e);
                    warn!(task = task.id, name = %task.name, error = %msg, "callback failed");
                    store.set_callback_result(task.id, Some(&msg)).await;
                }
            }
        });
    }
}

async fn run_task(store: &Arc<FileStore>, account_id: u64, event: &TriggerEvent) -> Result<()> {
    let account = store.callback_account(account_id).await?;
    executor::execute(&account, event).await
}

/// Fire a synthetic `Test` event straight through an account's executor,
/// bypassing task matching. Lets an operator verify credentials end-to-end.
pub async fn test_account(store: &Arc<FileStore>, account_id: u64) -> Result<()> {
    let account = store.callback_account(account_id).await?;
    let event = TriggerEvent {
        kind: EventKind::Test,
        source_id: 0,
        old_ip: "0.0.0.0".into(),
        new_ip: "1.2.3.4".into(),
        old_port: 0,
        new_port: 12345,
    };
    executor::execute(&account, &event).await
}
