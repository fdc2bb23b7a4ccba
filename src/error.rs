//! Crate-wide error taxonomy.
//!
//! Mirrors the enterprise module convention of one `thiserror`-derived enum
//! per call surface: [`EngineError`] is returned by every internal operation;
//! [`ResultCode`] is the public `SUCCESS`/`FAILURE` token pair client calls
//! collapse down to (see `spec.md` §7).

use thiserror::Error;

/// Errors surfaced by the checkpoint/restart engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Missing required configuration key or unreadable directory.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Checkpoint name fails the `[A-Za-z0-9_]{1,128}` grammar.
    #[error("invalid checkpoint name: {0}")]
    NameInvalid(String),

    /// Version is negative or otherwise not monotone.
    #[error("invalid checkpoint version: {0}")]
    VersionInvalid(String),

    /// `checkpoint_begin` called while a checkpoint or restart window is
    /// already open.
    #[error("nested checkpoint: a checkpoint or restart window is already open")]
    NestedCheckpoint,

    /// Operation invalid for the client's current state-machine state.
    #[error("wrong state: {0}")]
    WrongState(String),

    /// `checkpoint_mem`/`recover_mem` called with an empty region selection.
    #[error("empty region selection")]
    EmptyRegion,

    /// Region id referenced by a selection set is not registered.
    #[error("unknown region id: {0}")]
    UnknownRegion(i32),

    /// Registered region capacity is smaller than the recorded checkpoint size.
    #[error("size mismatch for region {id}: capacity {capacity}, recorded {recorded}")]
    SizeMismatch {
        /// Region id.
        id: i32,
        /// Capacity of the region as currently registered.
        capacity: u64,
        /// Size recorded in the checkpoint header.
        recorded: u64,
    },

    /// File truncated or its size disagrees with the declared header.
    #[error("header corrupt: {0}")]
    HeaderCorrupt(String),

    /// Stored digest does not match the recomputed one.
    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    /// Transient filesystem/storage failure.
    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// More erasures than a level can tolerate.
    #[error("group unrecoverable at level {level}: {reason}")]
    GroupUnrecoverable {
        /// Level (1-4) that failed to recover the group.
        level: u8,
        /// Human-readable reason.
        reason: String,
    },

    /// Transport error between a client and the backend worker. Fatal to
    /// the owning process.
    #[error("queue failure: {0}")]
    QueueFailure(String),

    /// (De)serialization failure not covered by a more specific variant.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Crate-wide result alias.
pub type EngineResult<T> = Result<T, EngineError>;

/// The public two-valued outcome of a client-facing call (spec §6).
///
/// Detailed diagnostics live in the `tracing` log sink and, for tests, in
/// the richer [`EngineError`]; application code only ever observes this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    /// The operation completed as requested.
    Success = 0,
    /// The operation did not complete; see logs for detail.
    Failure = -1,
}

impl From<EngineResult<()>> for ResultCode {
    fn from(result: EngineResult<()>) -> Self {
        match result {
            Ok(()) => ResultCode::Success,
            Err(err) => {
                tracing::error!(target: "snapmesh::result", error = %err, "operation failed");
                ResultCode::Failure
            }
        }
    }
}

impl ResultCode {
    /// True if the code is [`ResultCode::Success`].
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

/// The internal module-dispatch outcome (spec §4.2/§4.7): every dispatch
/// module (watchdog, versioning, checksum, L2, L3, L4) returns one of these;
/// the command's final status is their monotone fold (§7 "Propagation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModuleStatus {
    /// A hard failure for this module. Dominates any other status.
    Failure = -1,
    /// The module does not apply to this command (e.g. L3 with group size 1).
    Ignored = 0,
    /// The module ran to completion.
    Success = 1,
}

impl ModuleStatus {
    /// Fold a sequence of per-module statuses per spec §7: negative
    /// dominates, otherwise the maximum.
    pub fn fold(statuses: impl IntoIterator<Item = ModuleStatus>) -> ModuleStatus {
        statuses
            .into_iter()
            .fold(ModuleStatus::Ignored, |acc, s| {
                if acc == ModuleStatus::Failure || s == ModuleStatus::Failure {
                    ModuleStatus::Failure
                } else {
                    acc.max(s)
                }
            })
    }
}

/// Fold a sequence of raw completion codes the same way the client queue
/// backend folds them into a sticky per-id status (spec §3 `ClientQueue`,
/// §8 "Monotone status fold"): if any code is negative the result is the
/// minimum of all codes, otherwise the maximum.
pub fn fold_status_codes(codes: impl IntoIterator<Item = i32>) -> i32 {
    let codes: Vec<i32> = codes.into_iter().collect();
    if codes.is_empty() {
        return ResultCode::Success as i32;
    }
    if codes.iter().any(|&c| c < 0) {
        codes.into_iter().min().unwrap()
    } else {
        codes.into_iter().max().unwrap()
    }
}
