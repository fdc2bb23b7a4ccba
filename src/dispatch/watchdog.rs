//! Liveness tracking (spec §4.2 "watchdog").
//!
//! Every post-process call is also proof the issuing client is alive;
//! recording that here is what lets an orchestrator later tell a genuinely
//! crashed rank apart from one that just hasn't checkpointed recently.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{EngineResult, ModuleStatus};
use crate::identity::CheckpointIdentity;
use crate::levels::PostProcessContext;

use super::DispatchModule;

/// Tracks the last time each rank was seen dispatching a command.
pub struct WatchdogModule {
    last_seen: DashMap<i32, Instant>,
}

impl WatchdogModule {
    /// A watchdog with no recorded history.
    pub fn new() -> Self {
        WatchdogModule {
            last_seen: DashMap::new(),
        }
    }

    /// Whether `rank` has gone silent for longer than `interval` (spec §6
    /// `watchdog_interval`). Ranks never seen are not considered dead —
    /// that's a job-launch question, not a liveness one.
    pub fn is_dead(&self, rank: i32, interval: Duration) -> bool {
        self.last_seen
            .get(&rank)
            .map(|seen| seen.elapsed() > interval)
            .unwrap_or(false)
    }
}

impl Default for WatchdogModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchModule for WatchdogModule {
    fn name(&self) -> &'static str {
        "watchdog"
    }

    async fn run(&self, _ctx: &PostProcessContext, id: &CheckpointIdentity) -> EngineResult<ModuleStatus> {
        self.last_seen.insert(id.rank, Instant::now());
        Ok(ModuleStatus::Ignored)
    }
}
