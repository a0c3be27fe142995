//! Run parameters, snapshot fingerprinting, and the dry-run manifest.
//!
//! A dry run records its exact parameters in a [`RunManifest`]; a later
//! commit run may reuse the dry run's approval only if
//! [`RunManifest::matches_for_commit`] accepts it.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{MatchRule, RemapPolicy};
use crate::error::{RemapError, Result};

/// Serializable snapshot of everything that shaped a run's outcome.
///
/// Two runs with byte-identical configuration and snapshot content produce
/// identical fingerprints; any divergence in a single field or snapshot
/// file changes the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    pub source_env: String,
    pub snapshot_path: String,
    pub snapshot_fingerprint: String,
    pub match_rules: Vec<MatchRule>,
    pub policy: RemapPolicy,
    pub include_pii: bool,
    pub rebuild_map: bool,
    pub user_table: String,
    pub batch_size: usize,
    pub command_timeout_secs: u64,
    pub parallelism: usize,
    pub fallback_user_id: Option<i64>,
}

impl RunParameters {
    /// SHA256 fingerprint over every field, hex-encoded.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// One-way digest of a snapshot directory: every file's relative path,
/// byte length, and last-write time (nanoseconds since epoch), visited in
/// sorted order.
pub fn snapshot_fingerprint(root: &Path) -> Result<String> {
    let mut files: Vec<(String, u64, u128)> = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for (rel, len, mtime) in &files {
        hasher.update(rel.as_bytes());
        hasher.update(len.to_le_bytes());
        hasher.update(mtime.to_le_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    debug!(files = files.len(), "fingerprinted snapshot directory");
    Ok(digest)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, u64, u128)>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| {
        RemapError::Snapshot(format!("cannot read snapshot directory {:?}: {}", dir, e))
    })? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let meta = entry.metadata()?;
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        out.push((rel, meta.len(), mtime));
    }
    Ok(())
}

/// A persisted record of the parameters that produced a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Parameters the run executed with.
    pub parameters: RunParameters,

    /// Whether the recorded run was a dry run.
    pub dry_run: bool,

    /// When the run executed.
    pub executed_at_utc: DateTime<Utc>,

    /// Convenience copy of `parameters.fingerprint()`.
    pub parameter_hash: String,
}

impl RunManifest {
    /// Record a manifest for a run that just executed.
    pub fn new(parameters: RunParameters, dry_run: bool) -> Self {
        let parameter_hash = parameters.fingerprint();
        Self {
            parameters,
            dry_run,
            executed_at_utc: Utc::now(),
            parameter_hash,
        }
    }

    /// Decide whether this manifest authorizes a prospective commit run.
    ///
    /// Returns true only when the recorded run was a dry run, the candidate
    /// is not, every parameter matches exactly, and the manifest is no
    /// older than `max_age` as of `as_of`.
    pub fn matches_for_commit(
        &self,
        candidate: &RunParameters,
        candidate_dry_run: bool,
        as_of: DateTime<Utc>,
        max_age: Duration,
    ) -> bool {
        if !self.dry_run || candidate_dry_run {
            return false;
        }
        if &self.parameters != candidate {
            return false;
        }
        as_of - self.executed_at_utc <= max_age
    }

    /// Load a manifest from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RemapError::Manifest(format!("cannot read {:?}: {}", path.as_ref(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save the manifest to a JSON file (atomic write).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let temp_path: PathBuf = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}
