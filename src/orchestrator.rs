//! Checkpoint dispatch and the restart cascade (spec §4.2, §4.7).
//!
//! [`Orchestrator`] is what [`crate::client::Client`] calls into on
//! `checkpoint_end`/`restart_begin`: it owns the registered levels and the
//! three dispatch modules, and walks them in the order spec §4.2 lists
//! ("watchdog, versioning, checksum, then each configured level in
//! registration order"). L1 promotion is not itself one of those named
//! modules, but runs first and unconditionally — every later level and
//! dispatch module reads the L1-resident file, so nothing else can run
//! before it lands.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dispatch::checksum::ChecksumModule;
use crate::dispatch::versioning::VersioningModule;
use crate::dispatch::watchdog::WatchdogModule;
use crate::dispatch::DispatchModule;
use crate::error::{EngineError, EngineResult, ModuleStatus};
use crate::identity::CheckpointIdentity;
use crate::levels::l1::L1Level;
use crate::levels::l2::L2Level;
use crate::levels::l3::L3Level;
use crate::levels::l4::L4Level;
use crate::levels::{LevelEngine, PostProcessContext};
use crate::metadata::{Level, MetadataStore};

/// Owns the registered levels and dispatch modules, and sequences both the
/// checkpoint post-process pipeline and the restart cascade.
pub struct Orchestrator {
    config: EngineConfig,
    meta: Arc<MetadataStore>,
    watchdog: Arc<WatchdogModule>,
    versioning: VersioningModule,
    checksum: ChecksumModule,
    /// Levels above L1, in ascending (and registration) order.
    levels: Vec<Box<dyn LevelEngine>>,
}

impl Orchestrator {
    /// Build an orchestrator with the standard L2/L3/L4 level registration
    /// (spec §4.2 "each configured level, in registration order").
    pub fn new(config: EngineConfig, meta: Arc<MetadataStore>) -> Self {
        Orchestrator {
            config,
            meta,
            watchdog: Arc::new(WatchdogModule::new()),
            versioning: VersioningModule,
            checksum: ChecksumModule,
            levels: vec![Box::new(L2Level), Box::new(L3Level), Box::new(L4Level)],
        }
    }

    /// Shared handle to the watchdog, so a caller (e.g. the request queue's
    /// backend loop) can poll liveness independently of any one checkpoint.
    pub fn watchdog(&self) -> Arc<WatchdogModule> {
        self.watchdog.clone()
    }

    /// Run the full post-process pipeline for a checkpoint that has just
    /// been written to `scratch/tmp` (spec §4.2 step 3). Returns the
    /// folded status across every module that ran; an unrecoverable group
    /// failure (`EngineError::GroupUnrecoverable`) surfaces as `Err`
    /// rather than folding it into `Failure`, since it means the whole
    /// group — not just this rank — is in an inconsistent state.
    pub async fn checkpoint(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus> {
        let mut statuses = vec![L1Level.post_process(ctx, id).await?];
        statuses.push(self.watchdog.run(ctx, id).await?);
        statuses.push(self.versioning.run(ctx, id).await?);
        statuses.push(self.checksum.run(ctx, id).await?);
        for level in &self.levels {
            let status = level.post_process(ctx, id).await?;
            info!(level = ?level.level(), rank = id.rank, ?status, "post_process");
            statuses.push(status);
        }
        Ok(ModuleStatus::fold(statuses))
    }

    /// Walk L1 then each registered level in ascending order, stopping at
    /// the first that makes the scratch L1 file valid again (spec §4.7
    /// "the backend probes levels in ascending order until one succeeds").
    /// When the successful level is L4, its metadata directory is promoted
    /// into the L1 slot so subsequent lookups don't need to remember where
    /// the recovery actually came from.
    ///
    /// A level reporting `GroupUnrecoverable` (too many erasures at L3, or
    /// both sides of a partner pair lost at L2) does not abort the cascade
    /// — spec §7 "surfaces as cascade failure at that level, cascade tries
    /// the next" — so it is caught here and treated like any other failed
    /// level rather than propagated.
    pub async fn restart(
        &self,
        ctx: &PostProcessContext,
        id: &CheckpointIdentity,
    ) -> EngineResult<ModuleStatus> {
        if L1Level.recover(ctx, id).await? == ModuleStatus::Success {
            return Ok(ModuleStatus::Success);
        }

        for level in &self.levels {
            let status = match level.recover(ctx, id).await {
                Ok(status) => status,
                Err(EngineError::GroupUnrecoverable { level: failed_level, reason }) => {
                    warn!(level = ?level.level(), rank = id.rank, failed_level, %reason, "level unrecoverable, trying next");
                    ModuleStatus::Failure
                }
                Err(e) => return Err(e),
            };
            if status == ModuleStatus::Success {
                if level.level() == Level::L4 {
                    self.meta.promote_to_l1(ctx.sector, ctx.group(), Level::L4)?;
                }
                info!(level = ?level.level(), rank = id.rank, "restart recovered from level");
                return Ok(ModuleStatus::Success);
            }
        }

        warn!(rank = id.rank, "restart exhausted every level without recovering");
        Ok(ModuleStatus::Failure)
    }

    /// The configuration this orchestrator was built from, for callers that
    /// need to re-derive a `PostProcessContext` (e.g. the request queue).
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
