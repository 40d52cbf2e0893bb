//! Background usage-event writer.
//!
//! The gate emits events through a bounded channel so the hot path never
//! waits on the ledger; this task drains the channel and persists events
//! best-effort.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::UsageEvent;
use crate::services::ledger::UsageLedger;
use crate::services::metrics;

/// Create the bounded event channel shared by the gate and the writer.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<UsageEvent>, mpsc::Receiver<UsageEvent>) {
    mpsc::channel(capacity)
}

pub struct EventWriter {
    ledger: Arc<dyn UsageLedger>,
    rx: mpsc::Receiver<UsageEvent>,
}

impl EventWriter {
    pub fn new(ledger: Arc<dyn UsageLedger>, rx: mpsc::Receiver<UsageEvent>) -> Self {
        Self { ledger, rx }
    }

    /// Drain events until all senders drop. Write failures are logged and
    /// counted, never retried: event retention is best-effort by contract.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Usage event writer started");
            while let Some(event) = self.rx.recv().await {
                if let Err(e) = self.ledger.insert_event(&event).await {
                    warn!(tenant_id = %event.tenant_id, metric = %event.metric, error = %e,
                        "Failed to persist usage event");
                    metrics::record_event_dropped();
                }
            }
            info!("Usage event writer stopped");
        })
    }
}
