//! Per-task output area: `<output_root>/<task_id>/`.

use std::path::{Path, PathBuf};

use geocore_registry::{LogEntry, TaskId};

use crate::report::{self, TaskReport};

#[derive(Debug, Clone)]
pub struct TaskWorkspace {
    dir: PathBuf,
}

impl TaskWorkspace {
    pub fn for_task(output_root: &Path, task_id: &TaskId) -> Self {
        TaskWorkspace {
            dir: output_root.join(task_id.as_str()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory (and the output root) if missing.
    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Store the raw feed answer for the reference at 1-based `ordinal`.
    /// Returns the file name written.
    pub async fn persist_payload(
        &self,
        ordinal: usize,
        reference: &str,
        payload: &[u8],
    ) -> std::io::Result<String> {
        let name = payload_file_name(ordinal, reference);
        tokio::fs::write(self.dir.join(&name), payload).await?;
        Ok(name)
    }

    pub async fn write_reports(
        &self,
        report: &TaskReport,
        entries: &[LogEntry],
    ) -> std::io::Result<()> {
        tokio::fs::write(self.dir.join(report::LOG_FILE), report::render_log(entries)).await?;
        tokio::fs::write(self.dir.join(report::PARCELS_FILE), report.parcels_csv()).await?;
        tokio::fs::write(self.dir.join(report::AFFECTIONS_FILE), report.affections_csv()).await?;
        Ok(())
    }
}

/// `NNNN_<reference>.gml`, with path separators and other unsafe characters
/// in the reference replaced by `_`.
pub fn payload_file_name(ordinal: usize, reference: &str) -> String {
    let safe: String = reference
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{:04}_{}.gml", ordinal, safe)
}
