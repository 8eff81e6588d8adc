//! Pipeline configuration.
//!
//! Defaults match a local deployment next to the `FUENTES/` data folder.
//! Each field can be overridden by a `GEOCORE_*` environment variable; the
//! CLI applies its flags on top of [`PipelineConfig::from_env`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// INSPIRE cadastral parcels WFS of the Spanish Cadastre.
pub const DEFAULT_FEED_URL: &str =
    "https://ovc.catastro.meh.es/insivict/wfs-inspire/v/cp/CadastralParcels/wfs";

/// Per-request timeout of the remote feed.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Upper bound for reading and testing a single layer file.
pub const DEFAULT_LAYER_TIMEOUT_SECS: u64 = 120;

/// Tasks allowed to execute at once; later submissions queue.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// WFS endpoint queried for each reference.
    pub feed_url: String,
    /// Per-task output areas and archives are created under this directory.
    pub output_root: PathBuf,
    /// Root of the GeoPackage affection layers.
    pub layer_root: PathBuf,
    pub fetch_timeout: Duration,
    pub layer_timeout: Duration,
    pub max_concurrent_tasks: usize,
    /// Prepended to `/download/<task_id>` in the completion marker.
    pub result_url_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            feed_url: DEFAULT_FEED_URL.to_string(),
            output_root: PathBuf::from("outputs"),
            layer_root: PathBuf::from("FUENTES").join("CAPAS_gpkg"),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            layer_timeout: Duration::from_secs(DEFAULT_LAYER_TIMEOUT_SECS),
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            result_url_prefix: "/api".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by any `GEOCORE_*` variables that are set.
    pub fn from_env() -> Self {
        let mut config = PipelineConfig::default();
        if let Some(url) = env_string("GEOCORE_FEED_URL") {
            config.feed_url = url;
        }
        if let Some(dir) = env_string("GEOCORE_OUTPUT_DIR") {
            config.output_root = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("GEOCORE_LAYER_ROOT") {
            config.layer_root = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<u64>("GEOCORE_FETCH_TIMEOUT_SECS") {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("GEOCORE_LAYER_TIMEOUT_SECS") {
            config.layer_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse::<usize>("GEOCORE_MAX_TASKS") {
            config.max_concurrent_tasks = max.max(1);
        }
        if let Some(prefix) = env_string("GEOCORE_RESULT_PREFIX") {
            config.result_url_prefix = prefix;
        }
        config
    }

    /// Location advertised in the completion marker for a task's archive.
    pub fn result_url(&self, task_id: &str) -> String {
        format!(
            "{}/download/{}",
            self.result_url_prefix.trim_end_matches('/'),
            task_id
        )
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, ignoring (with a warning) unparsable values.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}
