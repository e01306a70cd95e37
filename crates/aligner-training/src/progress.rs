use crate::artifacts::RunId;
use crate::lifecycle::LifecycleState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { run_id: RunId, rank: usize, world_size: usize },
    StateChanged { run_id: RunId, from: LifecycleState, to: LifecycleState },
    Step { run_id: RunId, step: u64, epoch: u64, loss: f64, total: Option<u64> },
    StepSkipped { run_id: RunId, step: u64, reason: String, consecutive: u32 },
    Evaluated { run_id: RunId, step: u64, metrics: BTreeMap<String, f64> },
    Saved { run_id: RunId, step: u64, path: PathBuf },
    Finished { run_id: RunId, steps: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Renders progress through `tracing`. Non-main ranks log at debug level.
///
/// The default sink takes its rank from the [`ProgressEvent::Started`] event
/// that opens every run; [`LogProgressSink::for_rank`] pins it up front.
#[derive(Debug)]
pub struct LogProgressSink {
    quiet: AtomicBool,
    pinned: bool,
}

impl Default for LogProgressSink {
    fn default() -> Self {
        Self { quiet: AtomicBool::new(false), pinned: false }
    }
}

impl LogProgressSink {
    #[must_use]
    pub fn for_rank(rank: usize) -> Self {
        Self { quiet: AtomicBool::new(rank != 0), pinned: true }
    }

    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::Relaxed)
    }
}

impl ProgressSink for LogProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let ProgressEvent::Started { rank, .. } = &event {
            if !self.pinned {
                self.quiet.store(*rank != 0, Ordering::Relaxed);
            }
        }
        let quiet = self.is_quiet();
        match event {
            ProgressEvent::StepSkipped { run_id, step, reason, consecutive } => {
                warn!(%run_id, step, consecutive, reason = %reason, "skipped training step");
            }
            ProgressEvent::Started { run_id, rank, world_size } if !quiet => {
                info!(%run_id, rank, world_size, "training run started");
            }
            ProgressEvent::StateChanged { run_id, from, to } if !quiet => {
                info!(%run_id, from = %from, to = %to, "lifecycle transition");
            }
            ProgressEvent::Step { run_id, step, epoch, loss, total } if !quiet => match total {
                Some(total) => info!(%run_id, step, total, epoch, loss, "step {step}/{total}"),
                None => info!(%run_id, step, epoch, loss, "step {step}"),
            },
            ProgressEvent::Evaluated { run_id, step, metrics } if !quiet => {
                info!(%run_id, step, ?metrics, "evaluation");
            }
            ProgressEvent::Saved { run_id, step, path } if !quiet => {
                info!(%run_id, step, path = %path.display(), "checkpoint saved");
            }
            ProgressEvent::Finished { run_id, steps } if !quiet => {
                info!(%run_id, steps, "training run finished");
            }
            other => debug!(event = ?other, "progress"),
        }
    }
}
