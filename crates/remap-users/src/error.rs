//! Error types for the remap engine.

use std::time::Duration;

use thiserror::Error;

/// Main error type for remap operations.
#[derive(Error, Debug)]
pub enum RemapError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Db(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Schema discovery (tables, foreign keys, columns) failed
    #[error("Schema discovery failed: {0}")]
    Discovery(String),

    /// Snapshot file missing or unreadable
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Staging failed for a specific table
    #[error("Staging failed for table {table}: {message}")]
    Staging { table: String, message: String },

    /// Rewrite failed for a specific catalog column
    #[error("Rewrite failed for {table}.{column}: {message}")]
    Rewrite {
        table: String,
        column: String,
        message: String,
    },

    /// Transactional load failed; the transaction was rolled back
    #[error("Transactional load failed (rolled back): {0}")]
    Load(String),

    /// Post-load integrity validation failed after commit
    #[error("Post-load validation failed: {0}")]
    Validation(String),

    /// Run manifest file error
    #[error("Run manifest error: {0}")]
    Manifest(String),

    /// A commit run was requested against a stale or mismatched dry run
    #[error("Run is not authorized by the recorded dry run: {0}")]
    ManifestMismatch(String),

    /// Database command exceeded the configured timeout
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Run cancelled")]
    Cancelled,
}

impl RemapError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        RemapError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Staging error for a table.
    pub fn staging(table: impl Into<String>, message: impl Into<String>) -> Self {
        RemapError::Staging {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Rewrite error for a catalog column.
    pub fn rewrite(
        table: impl Into<String>,
        column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        RemapError::Rewrite {
            table: table.into(),
            column: column.into(),
            message: message.into(),
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for remap operations.
pub type Result<T> = std::result::Result<T, RemapError>;
