//! Remap pipeline - main workflow coordinator.
//!
//! A run is a fixed sequence of steps executed against one target database.
//! Steps that only make sense for a commit run are skipped during a dry
//! run; a failed step aborts the sequence but artifacts are still emitted
//! so the operator can see how far the run got.

mod steps;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::artifact::FsArtifactSink;
use crate::context::RemapContext;
use crate::db::RemapDb;
use crate::error::{RemapError, Result};
use crate::manifest::RunManifest;
use crate::state::{RemapState, RemapRunResult, StepOutcome, StepStatus};

/// The fixed step sequence of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Discover,
    Provision,
    Stage,
    BuildMap,
    Rewrite,
    Report,
    Load,
    Validate,
}

impl StepKind {
    pub const ALL: [StepKind; 8] = [
        StepKind::Discover,
        StepKind::Provision,
        StepKind::Stage,
        StepKind::BuildMap,
        StepKind::Rewrite,
        StepKind::Report,
        StepKind::Load,
        StepKind::Validate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StepKind::Discover => "discover-schema",
            StepKind::Provision => "provision-control-schema",
            StepKind::Stage => "stage-snapshot",
            StepKind::BuildMap => "build-user-map",
            StepKind::Rewrite => "rewrite-user-keys",
            StepKind::Report => "build-report",
            StepKind::Load => "load-target",
            StepKind::Validate => "validate-post-load",
        }
    }

    /// Reason to skip this step under the given context, if any.
    pub fn skip_reason(self, ctx: &RemapContext) -> Option<&'static str> {
        match self {
            StepKind::Load | StepKind::Validate if ctx.dry_run => Some("dry run"),
            _ => None,
        }
    }
}

/// Sequential remap pipeline.
pub struct RemapPipeline {
    ctx: RemapContext,
    db: Arc<dyn RemapDb>,
}

impl RemapPipeline {
    pub fn new(ctx: RemapContext, db: Arc<dyn RemapDb>) -> Self {
        Self { ctx, db }
    }

    /// Execute the full run.
    ///
    /// `cancel` flips to true when the caller wants the run stopped; the
    /// pipeline checks it between steps, never mid-statement.
    pub async fn run(self, cancel: Option<watch::Receiver<bool>>) -> Result<RemapRunResult> {
        let started_at = Utc::now();
        let mut state = RemapState::new();
        let cancel = cancel.unwrap_or_else(|| watch::channel(false).1);
        let sink = FsArtifactSink::new(&self.ctx.artifact_root, &state.run_id)?;

        info!(
            run_id = %state.run_id,
            dry_run = self.ctx.dry_run,
            source_env = %self.ctx.source_env,
            "starting remap run"
        );

        let mut failure: Option<RemapError> = None;
        for step in StepKind::ALL {
            if *cancel.borrow() {
                warn!(step = step.name(), "cancellation requested, stopping run");
                failure = Some(RemapError::Cancelled);
                break;
            }

            let step_started = Utc::now();
            if let Some(reason) = step.skip_reason(&self.ctx) {
                info!(step = step.name(), reason, "skipping step");
                state.step_outcomes.push(StepOutcome {
                    name: step.name().to_string(),
                    status: StepStatus::Skipped,
                    started_at_utc: step_started,
                    finished_at_utc: Utc::now(),
                    detail: Some(reason.to_string()),
                });
                continue;
            }

            info!(step = step.name(), "running step");
            match self.execute(step, &mut state, &cancel).await {
                Ok(detail) => {
                    info!(step = step.name(), %detail, "step completed");
                    state.step_outcomes.push(StepOutcome {
                        name: step.name().to_string(),
                        status: StepStatus::Completed,
                        started_at_utc: step_started,
                        finished_at_utc: Utc::now(),
                        detail: Some(detail),
                    });
                }
                Err(e) => {
                    error!(step = step.name(), error = %e, "step failed");
                    state.step_outcomes.push(StepOutcome {
                        name: step.name().to_string(),
                        status: StepStatus::Failed,
                        started_at_utc: step_started,
                        finished_at_utc: Utc::now(),
                        detail: Some(e.to_string()),
                    });
                    failure = Some(e);
                    break;
                }
            }
        }

        // Artifacts are written whether the run succeeded or not.
        if let Err(e) = self.emit_artifacts(&state, &sink).await {
            warn!(error = %e, "failed to emit run artifacts");
        }

        // A completed dry run records its manifest where the next commit
        // run will look for it.
        if failure.is_none() && self.ctx.dry_run {
            let manifest = RunManifest::new(self.ctx.parameters().clone(), true);
            if let Err(e) = manifest.save(self.ctx.artifact_root.join("run_manifest.json")) {
                warn!(error = %e, "failed to save run manifest");
            }
        }

        self.db.close().await;

        let result = RemapRunResult {
            run_id: state.run_id.clone(),
            dry_run: self.ctx.dry_run,
            parameter_hash: self.ctx.dry_run_hash(),
            started_at_utc: started_at,
            finished_at_utc: Utc::now(),
            tables_staged: state.staged_row_counts.len(),
            total_staged_rows: state.total_staged_rows(),
            total_loaded_rows: state.total_loaded_rows(),
            columns_rewritten: state.rewrite_summaries.len(),
            map_resolved: state
                .map_report
                .as_ref()
                .map(|r| r.resolved_count())
                .unwrap_or(0),
            map_unresolved: state
                .map_report
                .as_ref()
                .map(|r| r.unresolved_count)
                .unwrap_or(0),
            validation_clean: state.validation_report.as_ref().map(|r| r.is_clean()),
            steps: state.step_outcomes.clone(),
            artifact_dir: Some(sink.dir().to_string_lossy().into_owned()),
        };

        match failure {
            Some(e) => Err(e),
            None => {
                info!(
                    run_id = %result.run_id,
                    staged_rows = result.total_staged_rows,
                    loaded_rows = result.total_loaded_rows,
                    "remap run finished"
                );
                Ok(result)
            }
        }
    }

    async fn execute(
        &self,
        step: StepKind,
        state: &mut RemapState,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String> {
        match step {
            StepKind::Discover => self.discover(state).await,
            StepKind::Provision => self.provision(state).await,
            StepKind::Stage => self.stage(state, cancel).await,
            StepKind::BuildMap => self.build_map(state).await,
            StepKind::Rewrite => self.rewrite(state, cancel).await,
            StepKind::Report => self.report(state).await,
            StepKind::Load => self.load(state, cancel).await,
            StepKind::Validate => self.validate(state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(dry_run: bool) -> RemapContext {
        use crate::config::{Config, MatchRule, RemapConfig, RemapPolicy, TargetConfig};
        let snapshot = tempfile::TempDir::new().unwrap();
        std::fs::write(snapshot.path().join("dbo.User.json"), b"[]").unwrap();
        let config = Config {
            target: TargetConfig {
                host: "localhost".into(),
                port: 1433,
                database: "db".into(),
                user: "sa".into(),
                password: "pw".into(),
                encrypt: false,
                trust_server_cert: true,
            },
            remap: RemapConfig {
                source_env: "PROD".into(),
                snapshot_path: snapshot.path().to_path_buf(),
                artifact_root: snapshot.path().join("artifacts"),
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
        };
        RemapContext::new(&config, dry_run).unwrap()
    }

    #[test]
    fn test_load_and_validate_are_skipped_on_dry_run() {
        let dry = ctx_with(true);
        assert_eq!(StepKind::Load.skip_reason(&dry), Some("dry run"));
        assert_eq!(StepKind::Validate.skip_reason(&dry), Some("dry run"));
        assert_eq!(StepKind::Rewrite.skip_reason(&dry), None);

        let commit = ctx_with(false);
        assert_eq!(StepKind::Load.skip_reason(&commit), None);
        assert_eq!(StepKind::Validate.skip_reason(&commit), None);
    }

    #[test]
    fn test_step_names_are_stable() {
        let names: Vec<&str> = StepKind::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), 8);
        assert_eq!(names[0], "discover-schema");
        assert_eq!(names[7], "validate-post-load");
    }
}
