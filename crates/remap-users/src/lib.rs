//! # remap-users
//!
//! Cross-environment user-identity remapping for SQL Server databases.
//!
//! Takes a JSON snapshot exported from a source environment, resolves its
//! user identities against the target environment's own user inventory, and
//! rewrites every user-keyed foreign key before loading the data, with
//! support for:
//!
//! - **Transitive FK discovery** of every column that carries a user id
//! - **Ordered match rules** (email, normalized email, user name,
//!   employee number, fallback) with full provenance
//! - **Dry-run previews** whose parameter hash authorizes a later commit
//! - **Single-transaction loads** with constraint revalidation and rollback
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use remap_users::{Config, MssqlDb, RemapContext, RemapPipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("remap.yaml")?;
//!     let ctx = RemapContext::new(&config, true)?;
//!     let db = MssqlDb::connect(&config.target, ctx.command_timeout).await?;
//!     let result = RemapPipeline::new(ctx, Arc::new(db)).run(None).await?;
//!     println!("Rewrote {} columns", result.columns_rewritten);
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod catalog;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod manifest;
pub mod mapper;
pub mod pipeline;
pub mod report;
pub mod schema;
pub mod snapshot;
pub mod state;

// Re-exports for convenient access
pub use catalog::{build_catalog, UserFkCatalogEntry};
pub use config::{Config, MatchRule, RemapConfig, RemapPolicy, TargetConfig};
pub use context::RemapContext;
pub use db::memory::MemoryDb;
pub use db::mssql::MssqlDb;
pub use db::RemapDb;
pub use error::{RemapError, Result};
pub use manifest::{RunManifest, RunParameters};
pub use pipeline::{RemapPipeline, StepKind};
pub use report::{DryRunSummary, PostLoadValidationReport};
pub use state::{RemapRunResult, RemapState};
