//! Dispatch modules: the non-level steps the orchestrator runs on every
//! checkpoint, ahead of the L2/L3/L4 level engines (spec §4.2 step 3
//! "watchdog, versioning, checksum, then each configured level in
//! registration order").
//!
//! These share [`LevelEngine`](crate::levels::LevelEngine)'s context type
//! but not its shape: none of them has a `recover` counterpart, since none
//! produces a restartable artifact of its own.

pub mod checksum;
pub mod versioning;
pub mod watchdog;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::error::ModuleStatus;
use crate::identity::CheckpointIdentity;
use crate::levels::PostProcessContext;

/// One ahead-of-levels checkpoint step.
#[async_trait]
pub trait DispatchModule: Send + Sync {
    /// Name used in logging and the registration-order doc comment above.
    fn name(&self) -> &'static str;

    /// Run this module's work for the checkpoint currently being
    /// post-processed.
    async fn run(&self, ctx: &PostProcessContext, id: &CheckpointIdentity) -> EngineResult<ModuleStatus>;
}
