//! Archiving of a task's output area.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use geocore_registry::TaskId;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::PackagingError;

const ARCHIVE_SUFFIX: &str = "_resultados.zip";

#[derive(Debug, Clone)]
pub struct ResultPackager {
    output_root: PathBuf,
}

impl ResultPackager {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        ResultPackager {
            output_root: output_root.into(),
        }
    }

    /// `<output_root>/<task_id>_resultados.zip`
    pub fn archive_path(&self, task_id: &TaskId) -> PathBuf {
        self.output_root
            .join(format!("{}{}", task_id.as_str(), ARCHIVE_SUFFIX))
    }

    /// Zip every regular file of `<output_root>/<task_id>/`, in file-name
    /// order. The archive appears atomically under its final name.
    pub async fn package(&self, task_id: &TaskId) -> Result<PathBuf, PackagingError> {
        let source = self.output_root.join(task_id.as_str());
        let target = self.archive_path(task_id);
        tokio::task::spawn_blocking(move || {
            write_archive(&source, &target)?;
            Ok(target)
        })
        .await
        .map_err(|e| PackagingError::Worker(format!("task join error: {}", e)))?
    }

    /// Delete the output area and archive of a task. Missing files are fine.
    pub async fn discard(&self, task_id: &TaskId) -> std::io::Result<()> {
        let area = self.output_root.join(task_id.as_str());
        match tokio::fs::remove_dir_all(&area).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        match tokio::fs::remove_file(self.archive_path(task_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn write_archive(source: &Path, target: &Path) -> Result<(), PackagingError> {
    let empty = || PackagingError::EmptyOutput {
        dir: source.to_path_buf(),
    };
    if !source.is_dir() {
        return Err(empty());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    if files.is_empty() {
        return Err(empty());
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let partial = target.with_extension("zip.part");
    let mut zip = ZipWriter::new(BufWriter::new(File::create(&partial)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, path) in &files {
        zip.start_file(name.as_str(), options)?;
        let mut input = File::open(path)?;
        std::io::copy(&mut input, &mut zip)?;
    }
    let mut out = zip.finish()?;
    out.flush()?;
    drop(out);
    std::fs::rename(&partial, target)?;

    tracing::debug!(archive = %target.display(), files = files.len(), "archive written");
    Ok(())
}
