mod run;
mod serve;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use geocore_core::config::env_parse;
use geocore_core::observability::{init_logging, LogFormat};
use geocore_core::PipelineConfig;
use geocore_registry::Watchdog;

/// Output format for the `run` subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Bulk cadastral reference processing against INSPIRE parcels and local affection layers.
#[derive(Parser)]
#[command(
    name = "geocore",
    version,
    about = "Bulk cadastral reference processing against INSPIRE parcels and local affection layers"
)]
struct Cli {
    /// Diagnostic log format on stderr (pretty or json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8000")]
        port: u16,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Drop finished tasks from memory after this many seconds
        #[arg(long)]
        retention_secs: Option<u64>,
        /// Half-second idle wake-ups a log stream waits before giving up
        #[arg(long)]
        stream_max_polls: Option<u32>,
    },

    /// Process a reference file once and print its log
    Run {
        /// Newline-delimited cadastral references
        file: PathBuf,
        /// Project label used in the log (defaults to the file name)
        #[arg(long)]
        project: Option<String>,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Output format (text or json lines)
        #[arg(long, default_value = "text", value_enum)]
        format: OutputFormat,
    },
}

/// Pipeline settings. Each flag overrides its `GEOCORE_*` variable.
#[derive(Debug, Default, Args)]
struct PipelineArgs {
    /// Cadastral WFS endpoint
    #[arg(long)]
    feed_url: Option<String>,
    /// Root directory of the GeoPackage affection layers
    #[arg(long)]
    layers: Option<PathBuf>,
    /// Directory for per-task outputs and archives
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Tasks allowed to run at once
    #[arg(long)]
    max_tasks: Option<usize>,
    /// Prefix of the download location announced at completion
    #[arg(long)]
    result_prefix: Option<String>,
    /// Timeout of each feed request, in seconds
    #[arg(long)]
    fetch_timeout_secs: Option<u64>,
    /// Timeout of each layer file, in seconds
    #[arg(long)]
    layer_timeout_secs: Option<u64>,
}

impl PipelineArgs {
    fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::from_env();
        if let Some(url) = self.feed_url {
            config.feed_url = url;
        }
        if let Some(dir) = self.layers {
            config.layer_root = dir;
        }
        if let Some(dir) = self.output_dir {
            config.output_root = dir;
        }
        if let Some(max) = self.max_tasks {
            config.max_concurrent_tasks = max.max(1);
        }
        if let Some(prefix) = self.result_prefix {
            config.result_url_prefix = prefix;
        }
        if let Some(secs) = self.fetch_timeout_secs {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.layer_timeout_secs {
            config.layer_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    };

    match cli.command {
        Commands::Serve {
            port,
            pipeline,
            retention_secs,
            stream_max_polls,
        } => {
            let retention = retention_secs
                .or_else(|| env_parse::<u64>("GEOCORE_RETENTION_SECS"))
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs);
            let mut watchdog = Watchdog::default();
            if let Some(max_polls) =
                stream_max_polls.or_else(|| env_parse::<u32>("GEOCORE_STREAM_MAX_POLLS"))
            {
                watchdog.max_polls = max_polls;
            }
            let options = serve::ServeOptions {
                retention,
                watchdog,
            };
            if let Err(e) = rt.block_on(serve::start_server(port, pipeline.into_config(), options))
            {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
        Commands::Run {
            file,
            project,
            pipeline,
            format,
        } => {
            let options = run::RunOptions {
                file: &file,
                project: project.as_deref(),
                config: pipeline.into_config(),
                format,
                quiet: cli.quiet,
            };
            match rt.block_on(run::cmd_run(options)) {
                Ok(true) => {}
                Ok(false) => process::exit(1),
                Err(e) => {
                    eprintln!("error: {}", e);
                    process::exit(1);
                }
            }
        }
    }
}
