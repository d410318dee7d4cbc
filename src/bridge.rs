use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};

/// One device's health, published to the UI at each status tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub name: String,
    pub ip: String,
    pub max_fps: u32,
    pub in_pps: f32,
    pub out_fps: f32,
    pub connected: bool,
}

/// Commands from the UI. Start/stop travel via the flags today; the typed
/// channel keeps the contract in place for a multi-process split.
#[derive(Debug)]
pub enum UiCommand {
    Shutdown,
}

/// Set-once-observed-everywhere flag on a watch channel, so tasks can both
/// poll it between I/O operations and await it in select loops.
#[derive(Clone)]
pub struct ExitFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl ExitFlag {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Channels and flags shared between the router and the UI collaborator.
///
/// The status channel is the only high-rate path and is lossy by design: a
/// broadcast ring that overwrites the oldest records when the UI lags, so a
/// stalled UI can never back up into ingest.
pub struct ControlBridge {
    status_tx: broadcast::Sender<StatusRecord>,
    command_tx: mpsc::Sender<UiCommand>,
    pub command_rx: tokio::sync::Mutex<mpsc::Receiver<UiCommand>>,
    ui_active: AtomicBool,
    exit: ExitFlag,
}

pub type BridgeHandle = Arc<ControlBridge>;

impl ControlBridge {
    pub fn new(status_capacity: usize) -> BridgeHandle {
        let (status_tx, _) = broadcast::channel(status_capacity);
        let (command_tx, command_rx) = mpsc::channel(16);
        Arc::new(Self {
            status_tx,
            command_tx,
            command_rx: tokio::sync::Mutex::new(command_rx),
            ui_active: AtomicBool::new(false),
            exit: ExitFlag::new(),
        })
    }

    pub fn publish_status(&self, record: StatusRecord) {
        // no subscribers is fine; records just age out of the ring
        let _ = self.status_tx.send(record);
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusRecord> {
        self.status_tx.subscribe()
    }

    pub fn commands(&self) -> mpsc::Sender<UiCommand> {
        self.command_tx.clone()
    }

    pub fn set_ui_active(&self, active: bool) {
        self.ui_active.store(active, Ordering::Relaxed);
    }

    pub fn ui_is_active(&self) -> bool {
        self.ui_active.load(Ordering::Relaxed)
    }

    pub fn exit(&self) -> &ExitFlag {
        &self.exit
    }
}
