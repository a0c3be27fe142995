//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::path::Path;

use crate::error::Result;
use crate::schema::SchemaTable;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Parsed identity table reference.
    pub fn user_table(&self) -> SchemaTable {
        SchemaTable::parse(&self.remap.user_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_minimal() {
        let yaml = r#"
target:
  host: localhost
  database: uat_db
  user: sa
  password: secret
remap:
  source_env: PROD
  snapshot_path: /snapshots/prod
  fallback_user_id: 999
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.target.port, 1433);
        assert_eq!(config.remap.user_table, "dbo.User");
        assert_eq!(
            config.remap.match_rules,
            vec![MatchRule::Email, MatchRule::UserName]
        );
        assert_eq!(config.remap.policy, RemapPolicy::Reassign);
        assert_eq!(config.remap.get_batch_size(), 5_000);
        assert!(config.remap.rebuild_map);
        assert_eq!(config.user_table().full_name(), "dbo.User");
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        let yaml = r#"
target:
  host: localhost
  database: uat_db
  user: sa
  password: secret
remap:
  source_env: PROD
  snapshot_path: /snapshots/prod
  policy: reassign
"#;
        // Reassign without a fallback identity must fail at load time.
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_match_rule_yaml_names() {
        let yaml = r#"
target:
  host: localhost
  database: uat_db
  user: sa
  password: secret
remap:
  source_env: PROD
  snapshot_path: /snapshots/prod
  policy: prune
  match_rules: [email, normalize_email, user_name, employee_number]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            config.remap.match_rules,
            vec![
                MatchRule::Email,
                MatchRule::NormalizeEmail,
                MatchRule::UserName,
                MatchRule::EmployeeNumber,
            ]
        );
    }
}
