//! Checkpoint naming: the `CheckpointIdentity` entity and the on-disk stem
//! grammar (spec §3, §6).

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, EngineResult};

/// Sentinel rank values with a reserved disk token (spec §6).
pub const RANK_ERASURE_CODE: i32 = -1;
/// Sentinel rank for the aggregated L4 variant.
pub const RANK_AGGREGATED: i32 = -2;

const MAX_NAME_LEN: usize = 128;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// Identifies one rank's checkpoint of one name/version (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointIdentity {
    /// `[A-Za-z0-9_]+`, length <= 128.
    pub name: String,
    /// Rank, or a negative sentinel (`ec`, `agg`).
    pub rank: i32,
    /// Monotone (per name, per rank) version number.
    pub version: u64,
    /// Original path for file-mode checkpoints, if any.
    pub original_path: Option<PathBuf>,
    /// Byte offset into an aggregated object; meaningful only when
    /// restoring from the aggregated variant.
    pub offset: Option<u64>,
}

impl CheckpointIdentity {
    /// Construct an identity for a memory/file checkpoint, validating the
    /// name grammar.
    pub fn new(name: impl Into<String>, rank: i32, version: u64) -> EngineResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(CheckpointIdentity {
            name,
            rank,
            version,
            original_path: None,
            offset: None,
        })
    }

    /// Rank token as it appears in the file stem: a decimal rank, or `ec`
    /// / `agg` for the sentinel ranks.
    pub fn rank_token(&self) -> String {
        match self.rank {
            RANK_ERASURE_CODE => "ec".to_string(),
            RANK_AGGREGATED => "agg".to_string(),
            r => r.to_string(),
        }
    }

    /// `<name>-<rank>-<version>.dat`
    pub fn stem(&self) -> String {
        format!("{}-{}-{}.dat", self.name, self.rank_token(), self.version)
    }

    /// `<name>-<rank>-<version>.dat.chksum`
    pub fn meta_stem(&self) -> String {
        format!("{}.chksum", self.stem())
    }

    /// The erasure-coded variant of this identity (rank becomes `ec`).
    pub fn as_erasure_code(&self) -> CheckpointIdentity {
        CheckpointIdentity {
            name: self.name.clone(),
            rank: RANK_ERASURE_CODE,
            version: self.version,
            original_path: None,
            offset: None,
        }
    }

    /// The aggregated variant of this identity (rank becomes `agg`).
    pub fn as_aggregated(&self) -> CheckpointIdentity {
        CheckpointIdentity {
            name: self.name.clone(),
            rank: RANK_AGGREGATED,
            version: self.version,
            original_path: None,
            offset: None,
        }
    }
}

/// Validate the `[A-Za-z0-9_]{1,128}` checkpoint-name grammar (spec §6).
pub fn validate_name(name: &str) -> EngineResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(EngineError::NameInvalid(format!(
            "name length {} outside 1..={MAX_NAME_LEN}",
            name.len()
        )));
    }
    if !NAME_RE.is_match(name) {
        return Err(EngineError::NameInvalid(format!(
            "name {name:?} must match [A-Za-z0-9_]+"
        )));
    }
    Ok(())
}

/// Parse a stem of the form `<name>-(\d+|ec|agg)-(\d+)\.dat` back into its
/// parts: `(name, rank, version)`.
pub fn parse_stem(stem: &str) -> EngineResult<(String, i32, u64)> {
    let rest = stem
        .strip_suffix(".dat")
        .ok_or_else(|| EngineError::NameInvalid(format!("not a checkpoint stem: {stem}")))?;
    let mut parts = rest.rsplitn(3, '-');
    let version_str = parts
        .next()
        .ok_or_else(|| EngineError::NameInvalid(stem.to_string()))?;
    let rank_str = parts
        .next()
        .ok_or_else(|| EngineError::NameInvalid(stem.to_string()))?;
    let name = parts
        .next()
        .ok_or_else(|| EngineError::NameInvalid(stem.to_string()))?;
    validate_name(name)?;
    let version: u64 = version_str
        .parse()
        .map_err(|_| EngineError::VersionInvalid(version_str.to_string()))?;
    let rank = match rank_str {
        "ec" => RANK_ERASURE_CODE,
        "agg" => RANK_AGGREGATED,
        other => other
            .parse()
            .map_err(|_| EngineError::NameInvalid(format!("bad rank token {other:?}")))?,
    };
    Ok((name.to_string(), rank, version))
}
