//! `geocore run`: process one reference file without starting the server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use geocore_core::{parse_references, PipelineConfig, TaskOrchestrator};
use geocore_registry::{LogEntry, TaskRegistry, TaskStatus, Watchdog};

use crate::OutputFormat;

pub(crate) struct RunOptions<'a> {
    pub file: &'a Path,
    pub project: Option<&'a str>,
    pub config: PipelineConfig,
    pub format: OutputFormat,
    pub quiet: bool,
}

fn print_entry(entry: &LogEntry, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            println!("{} [{}] {}", entry.timestamp, entry.severity, entry.message);
        }
        OutputFormat::Json => {
            let line = serde_json::to_string(entry)
                .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e));
            println!("{}", line);
        }
    }
}

/// Run the batch to completion, printing the log as it grows. Returns
/// whether the task completed.
pub(crate) async fn cmd_run(options: RunOptions<'_>) -> Result<bool, Box<dyn std::error::Error>> {
    let text = tokio::fs::read_to_string(options.file)
        .await
        .map_err(|e| format!("cannot read {}: {}", options.file.display(), e))?;
    let references = parse_references(&text);
    if references.is_empty() {
        return Err(format!("{} contains no references", options.file.display()).into());
    }

    let project = match options.project {
        Some(project) => project.to_string(),
        None => options
            .file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "referencias".to_string()),
    };
    if !options.quiet {
        eprintln!("Processing {} references from {}", references.len(), options.file.display());
    }

    let registry = Arc::new(TaskRegistry::new());
    let orchestrator = Arc::new(TaskOrchestrator::from_config(
        options.config,
        Arc::clone(&registry),
    ));
    let task_id = orchestrator.submit(&project, references);

    // Every task ends with a marker entry; no idle limit.
    let mut subscription =
        registry.subscribe(&task_id, Watchdog::new(Duration::from_millis(500), u32::MAX))?;
    let mut last = None;
    while let Some(entry) = subscription.next().await {
        if !options.quiet {
            print_entry(&entry, options.format);
        }
        last = Some(entry);
    }
    if options.quiet {
        if let Some(entry) = &last {
            print_entry(entry, options.format);
        }
    }

    let snapshot = registry.snapshot(&task_id)?;
    if !options.quiet {
        if let Some(archive) = &snapshot.archive {
            eprintln!("Archive: {}", archive.display());
        }
    }
    Ok(snapshot.status == TaskStatus::Completed)
}
