//! Background usage-record writer.
//!
//! Request handlers finish their streams inside `Drop` and poll contexts
//! where they cannot await file I/O, so records travel over an unbounded
//! channel to this task. Write failures are logged and swallowed; metering
//! must never fail a client response.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::usage::store::UsageStore;
use crate::usage::UsageRecord;

/// Spawn the writer task. It drains the channel, appending each record to
/// the store, and exits once every sender is dropped (flushing what
/// remains), which is how graceful shutdown waits for pending records.
pub fn spawn_usage_writer(
    store: Arc<UsageStore>,
    mut rx: mpsc::UnboundedReceiver<UsageRecord>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Err(e) = store.record(&record).await {
                tracing::error!(
                    request_id = %record.request_id,
                    tenant_id = %record.tenant_id,
                    error = %e,
                    "Failed to append usage record"
                );
            } else {
                tracing::debug!(
                    request_id = %record.request_id,
                    tenant_id = %record.tenant_id,
                    total_cost = record.total_cost,
                    "Usage record appended"
                );
            }
        }
        tracing::info!("Usage writer shutting down");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
