//! Configuration validation. All checks fail fast, before any I/O.

use super::{Config, MatchRule, RemapPolicy};
use crate::error::{RemapError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Target validation
    if config.target.host.is_empty() {
        return Err(RemapError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(RemapError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(RemapError::Config("target.user is required".into()));
    }

    // Remap validation
    let remap = &config.remap;
    if remap.source_env.is_empty() {
        return Err(RemapError::Config("remap.source_env is required".into()));
    }
    if remap.snapshot_path.as_os_str().is_empty() {
        return Err(RemapError::Config("remap.snapshot_path is required".into()));
    }
    if remap.user_table.trim().is_empty() || remap.user_table.trim() == "." {
        return Err(RemapError::Config("remap.user_table is required".into()));
    }
    if remap.match_rules.is_empty() {
        return Err(RemapError::Config(
            "remap.match_rules must list at least one rule".into(),
        ));
    }

    // The Fallback rule and the Reassign policy both substitute a concrete
    // identity; that identity must exist before any I/O happens.
    if remap.match_rules.contains(&MatchRule::Fallback) && remap.fallback_user_id.is_none() {
        return Err(RemapError::Config(
            "remap.fallback_user_id is required when the fallback match rule is enabled".into(),
        ));
    }
    if remap.policy == RemapPolicy::Reassign && remap.fallback_user_id.is_none() {
        return Err(RemapError::Config(
            "remap.fallback_user_id is required when policy is reassign".into(),
        ));
    }

    if let Some(0) = remap.batch_size {
        return Err(RemapError::Config(
            "remap.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = remap.command_timeout_secs {
        return Err(RemapError::Config(
            "remap.command_timeout_secs must be at least 1".into(),
        ));
    }
    if let Some(0) = remap.parallelism {
        return Err(RemapError::Config(
            "remap.parallelism must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemapConfig, TargetConfig};
    use std::path::PathBuf;

    fn valid_config() -> Config {
        Config {
            target: TargetConfig {
                host: "localhost".to_string(),
                port: 1433,
                database: "uat_db".to_string(),
                user: "sa".to_string(),
                password: "password".to_string(),
                encrypt: false,
                trust_server_cert: true,
            },
            remap: RemapConfig {
                source_env: "PROD".to_string(),
                snapshot_path: PathBuf::from("/snapshots/prod"),
                artifact_root: PathBuf::from("artifacts"),
                user_table: "dbo.User".to_string(),
                match_rules: vec![MatchRule::Email, MatchRule::UserName],
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
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_target_host() {
        let mut config = valid_config();
        config.target.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_source_env() {
        let mut config = valid_config();
        config.remap.source_env = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_fallback_rule_requires_fallback_id() {
        let mut config = valid_config();
        config.remap.policy = RemapPolicy::Prune;
        config.remap.match_rules = vec![MatchRule::Email, MatchRule::Fallback];
        config.remap.fallback_user_id = None;
        assert!(validate(&config).is_err());

        config.remap.fallback_user_id = Some(999);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_reassign_policy_requires_fallback_id() {
        let mut config = valid_config();
        config.remap.policy = RemapPolicy::Reassign;
        config.remap.fallback_user_id = None;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_prune_policy_does_not_require_fallback_id() {
        let mut config = valid_config();
        config.remap.policy = RemapPolicy::Prune;
        config.remap.match_rules = vec![MatchRule::Email];
        config.remap.fallback_user_id = None;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let mut config = valid_config();
        config.remap.batch_size = Some(0);
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.remap.parallelism = Some(0);
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.remap.command_timeout_secs = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_target_config_debug_redacts_password() {
        let mut config = valid_config();
        config.target.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.target);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }
}
