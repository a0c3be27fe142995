//! Run artifact emission.
//!
//! Every run leaves its reports on disk under a per-run directory so an
//! operator can review a dry run (or a failure) after the process exits.
//! Writes are atomic: content lands in a `.tmp` sibling first and is
//! renamed into place.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{RemapError, Result};

/// Destination for run artifacts.
pub trait ArtifactSink: Send + Sync {
    /// Serialize `value` as pretty JSON under `name`.
    fn write_json(&self, name: &str, value: &dyn erased_json::SerializeJson) -> Result<PathBuf>;

    /// Write a CSV file with a header row.
    fn write_csv(&self, name: &str, headers: &[&str], rows: &[Vec<String>]) -> Result<PathBuf>;

    /// Write a plain text file.
    fn write_text(&self, name: &str, content: &str) -> Result<PathBuf>;
}

/// Object-safe serialization helper for [`ArtifactSink::write_json`].
pub mod erased_json {
    use serde::Serialize;

    pub trait SerializeJson {
        fn to_json_pretty(&self) -> serde_json::Result<String>;
    }

    impl<T: Serialize> SerializeJson for T {
        fn to_json_pretty(&self) -> serde_json::Result<String> {
            serde_json::to_string_pretty(self)
        }
    }
}

/// Filesystem sink rooted at `<artifact_root>/<run_id>/`.
pub struct FsArtifactSink {
    dir: PathBuf,
}

impl FsArtifactSink {
    /// Create the sink, making the run directory on first use.
    pub fn new(artifact_root: &Path, run_id: &str) -> Result<Self> {
        let dir = artifact_root.join(run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The directory artifacts land in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_atomic(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.dir.join(name);
        let temp = path.with_extension("tmp");
        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, &path)?;
        debug!(artifact = %path.display(), bytes = content.len(), "wrote artifact");
        Ok(path)
    }
}

impl ArtifactSink for FsArtifactSink {
    fn write_json(&self, name: &str, value: &dyn erased_json::SerializeJson) -> Result<PathBuf> {
        let content = value
            .to_json_pretty()
            .map_err(RemapError::Json)?;
        self.write_atomic(name, content.as_bytes())
    }

    fn write_csv(&self, name: &str, headers: &[&str], rows: &[Vec<String>]) -> Result<PathBuf> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(headers)
            .map_err(|e| RemapError::Config(format!("csv write failed: {}", e)))?;
        for row in rows {
            writer
                .write_record(row)
                .map_err(|e| RemapError::Config(format!("csv write failed: {}", e)))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| RemapError::Config(format!("csv write failed: {}", e)))?;
        self.write_atomic(name, &bytes)
    }

    fn write_text(&self, name: &str, content: &str) -> Result<PathBuf> {
        self.write_atomic(name, content.as_bytes())
    }
}

/// Convenience wrapper so call sites keep static dispatch for JSON values.
pub fn write_json_artifact<T: Serialize>(
    sink: &dyn ArtifactSink,
    name: &str,
    value: &T,
) -> Result<PathBuf> {
    sink.write_json(name, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use tempfile::TempDir;

    #[derive(Serialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_json_artifact_round_trip() {
        let root = TempDir::new().unwrap();
        let sink = FsArtifactSink::new(root.path(), "run-1").unwrap();

        let path = write_json_artifact(
            &sink,
            "report.json",
            &Sample {
                name: "dry-run".into(),
                count: 3,
            },
        )
        .unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["name"], "dry-run");
        assert_eq!(parsed["count"], 3);
    }

    #[test]
    fn test_csv_artifact_has_header() {
        let root = TempDir::new().unwrap();
        let sink = FsArtifactSink::new(root.path(), "run-2").unwrap();

        let path = sink
            .write_csv(
                "user_map.csv",
                &["SourceUserId", "TargetUserId"],
                &[vec!["1".into(), "101".into()]],
            )
            .unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("SourceUserId,TargetUserId"));
        assert_eq!(lines.next(), Some("1,101"));
    }

    #[test]
    fn test_no_tmp_files_left_behind() {
        let root = TempDir::new().unwrap();
        let sink = FsArtifactSink::new(root.path(), "run-3").unwrap();
        sink.write_text("notes.txt", "ok").unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(sink.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }
}
