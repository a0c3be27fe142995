//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target database configuration (SQL Server).
    pub target: TargetConfig,

    /// Remap behavior configuration.
    pub remap: RemapConfig,
}

/// Target database (SQL Server) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Remap behavior configuration.
///
/// Performance-related fields use `Option<T>` to distinguish "not set"
/// (use the default) from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemapConfig {
    /// Tag of the source environment the snapshot was exported from
    /// (e.g. "PROD").
    pub source_env: String,

    /// Directory of per-table JSON row-array snapshot files.
    pub snapshot_path: PathBuf,

    /// Root directory for emitted artifacts (default: "artifacts").
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,

    /// Identity table, `schema.table` (default: "dbo.User").
    #[serde(default = "default_user_table")]
    pub user_table: String,

    /// Matching rules, tried in order; first successful rule wins.
    #[serde(default = "default_match_rules")]
    pub match_rules: Vec<MatchRule>,

    /// Disposition for source identities with no mapped target.
    #[serde(default)]
    pub policy: RemapPolicy,

    /// Fallback identity for the `Fallback` rule and the `Reassign` policy.
    #[serde(default)]
    pub fallback_user_id: Option<i64>,

    /// Include raw identifiers in reports instead of one-way hashes
    /// (default: false).
    #[serde(default)]
    pub include_pii: bool,

    /// Rebuild `ctl.UserMap` from scratch instead of reusing a previous
    /// run's map (default: true).
    #[serde(default = "default_true")]
    pub rebuild_map: bool,

    /// Rows per bulk-insert batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Per-command timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,

    /// Maximum concurrent per-table operations within a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

impl RemapConfig {
    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(5_000)
    }

    pub fn get_command_timeout_secs(&self) -> u64 {
        self.command_timeout_secs.unwrap_or(300)
    }

    pub fn get_parallelism(&self) -> usize {
        self.parallelism.unwrap_or(4)
    }
}

/// Disposition for source identities with no map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemapPolicy {
    /// Substitute the configured fallback identity.
    #[default]
    Reassign,

    /// Null the column if nullable, otherwise remove the staging row.
    Prune,
}

/// An identity-matching rule. Rules run in the configured order; the first
/// rule that yields a candidate wins and names the match reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// Exact email match (case-insensitive).
    Email,

    /// Normalized email match (trimmed, lowercased, plus-suffix stripped).
    NormalizeEmail,

    /// Exact username match (case-insensitive).
    UserName,

    /// Employee number match (trimmed).
    EmployeeNumber,

    /// Catch-all: map to the configured fallback identity.
    Fallback,
}

impl MatchRule {
    /// Match-reason string recorded in `ctl.UserMap`.
    pub fn reason(&self) -> &'static str {
        match self {
            MatchRule::Email => "Email",
            MatchRule::NormalizeEmail => "NormalizeEmail",
            MatchRule::UserName => "UserName",
            MatchRule::EmployeeNumber => "EmployeeNumber",
            MatchRule::Fallback => "Fallback",
        }
    }
}

// Default value functions for serde

fn default_mssql_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_user_table() -> String {
    "dbo.User".to_string()
}

fn default_match_rules() -> Vec<MatchRule> {
    vec![MatchRule::Email, MatchRule::UserName]
}
