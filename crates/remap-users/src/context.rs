//! Immutable per-run context.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, MatchRule, RemapPolicy, TargetConfig};
use crate::error::{RemapError, Result};
use crate::manifest::{snapshot_fingerprint, RunParameters};
use crate::schema::SchemaTable;

/// Everything a run needs, resolved and validated once per invocation.
///
/// Constructed from a validated [`Config`] plus the dry-run flag; never
/// mutated afterward. Construction fingerprints the snapshot directory so
/// the run's [`RunParameters`] hash covers both configuration and snapshot
/// content.
#[derive(Debug, Clone)]
pub struct RemapContext {
    pub source_env: String,
    pub target: TargetConfig,
    pub snapshot_path: PathBuf,
    pub artifact_root: PathBuf,
    pub user_table: SchemaTable,
    pub match_rules: Vec<MatchRule>,
    pub policy: RemapPolicy,
    pub fallback_user_id: Option<i64>,
    pub dry_run: bool,
    pub rebuild_map: bool,
    pub include_pii: bool,
    pub batch_size: usize,
    pub command_timeout: Duration,
    pub parallelism: usize,
    parameters: RunParameters,
}

impl RemapContext {
    /// Build a context for one run.
    ///
    /// Re-validates the configuration, fingerprints the snapshot directory,
    /// and cross-checks the derived [`RunParameters`] against the
    /// configured policy; a mismatch is a construction error, never a
    /// mid-run surprise.
    pub fn new(config: &Config, dry_run: bool) -> Result<Self> {
        config.validate()?;

        let snapshot_path = config.remap.snapshot_path.clone();
        if !snapshot_path.is_dir() {
            return Err(RemapError::Config(format!(
                "remap.snapshot_path {:?} is not a directory",
                snapshot_path
            )));
        }

        let parameters = RunParameters {
            source_env: config.remap.source_env.clone(),
            snapshot_path: snapshot_path.to_string_lossy().into_owned(),
            snapshot_fingerprint: snapshot_fingerprint(&snapshot_path)?,
            match_rules: config.remap.match_rules.clone(),
            policy: config.remap.policy,
            include_pii: config.remap.include_pii,
            rebuild_map: config.remap.rebuild_map,
            user_table: config.user_table().full_name(),
            batch_size: config.remap.get_batch_size(),
            command_timeout_secs: config.remap.get_command_timeout_secs(),
            parallelism: config.remap.get_parallelism(),
            fallback_user_id: config.remap.fallback_user_id,
        };

        // Strict cross-validation: the parameters being fingerprinted must
        // agree with the context the steps will execute with.
        if parameters.policy != config.remap.policy {
            return Err(RemapError::Config(
                "run parameters policy does not match configured policy".into(),
            ));
        }

        Ok(Self {
            source_env: config.remap.source_env.clone(),
            target: config.target.clone(),
            snapshot_path,
            artifact_root: config.remap.artifact_root.clone(),
            user_table: config.user_table(),
            match_rules: config.remap.match_rules.clone(),
            policy: config.remap.policy,
            fallback_user_id: config.remap.fallback_user_id,
            dry_run,
            rebuild_map: config.remap.rebuild_map,
            include_pii: config.remap.include_pii,
            batch_size: config.remap.get_batch_size(),
            command_timeout: Duration::from_secs(config.remap.get_command_timeout_secs()),
            parallelism: config.remap.get_parallelism(),
            parameters,
        })
    }

    /// The run parameters derived at construction.
    pub fn parameters(&self) -> &RunParameters {
        &self.parameters
    }

    /// Deterministic hash over configuration and snapshot content.
    pub fn dry_run_hash(&self) -> String {
        self.parameters.fingerprint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemapConfig, TargetConfig};
    use tempfile::TempDir;

    fn config_for(snapshot: &TempDir) -> Config {
        Config {
            target: TargetConfig {
                host: "localhost".into(),
                port: 1433,
                database: "uat_db".into(),
                user: "sa".into(),
                password: "secret".into(),
                encrypt: false,
                trust_server_cert: true,
            },
            remap: RemapConfig {
                source_env: "PROD".into(),
                snapshot_path: snapshot.path().to_path_buf(),
                artifact_root: PathBuf::from("artifacts"),
                user_table: "dbo.User".into(),
                match_rules: vec![MatchRule::Email],
                policy: RemapPolicy::Reassign,
                fallback_user_id: Some(999),
                include_pii: false,
                rebuild_map: true,
                batch_size: None,
                command_timeout_secs: None,
                parallelism: None,
            },
        }
    }

    #[test]
    fn test_identical_inputs_hash_identically() {
        let snapshot = TempDir::new().unwrap();
        std::fs::write(snapshot.path().join("dbo.User.json"), b"[{\"Id\":1}]").unwrap();

        let config = config_for(&snapshot);
        let a = RemapContext::new(&config, true).unwrap();
        let b = RemapContext::new(&config, true).unwrap();
        assert_eq!(a.dry_run_hash(), b.dry_run_hash());
    }

    #[test]
    fn test_snapshot_change_changes_hash() {
        let snapshot = TempDir::new().unwrap();
        let file = snapshot.path().join("dbo.User.json");
        std::fs::write(&file, b"[{\"Id\":1}]").unwrap();

        let config = config_for(&snapshot);
        let before = RemapContext::new(&config, true).unwrap().dry_run_hash();

        std::fs::write(&file, b"[{\"Id\":1},{\"Id\":2}]").unwrap();
        let after = RemapContext::new(&config, true).unwrap().dry_run_hash();
        assert_ne!(before, after);
    }

    #[test]
    fn test_config_change_changes_hash() {
        let snapshot = TempDir::new().unwrap();
        std::fs::write(snapshot.path().join("dbo.User.json"), b"[]").unwrap();

        let config = config_for(&snapshot);
        let before = RemapContext::new(&config, true).unwrap().dry_run_hash();

        let mut changed = config.clone();
        changed.remap.fallback_user_id = Some(1000);
        let after = RemapContext::new(&changed, true).unwrap().dry_run_hash();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_snapshot_dir_fails_fast() {
        let snapshot = TempDir::new().unwrap();
        let mut config = config_for(&snapshot);
        config.remap.snapshot_path = snapshot.path().join("does-not-exist");
        assert!(RemapContext::new(&config, true).is_err());
    }

    #[test]
    fn test_dry_run_flag_does_not_affect_hash() {
        // The hash authorizes a commit against a dry run, so the flag
        // itself must stay out of the fingerprint.
        let snapshot = TempDir::new().unwrap();
        std::fs::write(snapshot.path().join("dbo.User.json"), b"[]").unwrap();

        let config = config_for(&snapshot);
        let dry = RemapContext::new(&config, true).unwrap().dry_run_hash();
        let commit = RemapContext::new(&config, false).unwrap().dry_run_hash();
        assert_eq!(dry, commit);
    }
}
