//! Lifecycle event reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::job::{JobId, JobState};

/// One state change of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub job_id: JobId,
    pub from: JobState,
    pub to: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Receives lifecycle events. Delivery is fire-and-forget: a sink must not
/// block and cannot fail the transition that produced the event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);
}

/// Writes every event to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) {
        if event.to.is_terminal() {
            tracing::info!(
                job_id = %event.job_id,
                from = %event.from,
                to = %event.to,
                reason = event.reason.as_deref().unwrap_or(""),
                "Job finished"
            );
        } else {
            tracing::debug!(
                job_id = %event.job_id,
                from = %event.from,
                to = %event.to,
                "Job state changed"
            );
        }
    }
}
