//! GEOCORE pipeline: resolve cadastral references against the INSPIRE
//! parcels feed, test each parcel against local affection layers, and
//! package the per-task outputs.
//!
//! Leaves first:
//! - [`fetcher`] turns one reference into a [`ParcelGeometry`] (GML via [`gml`])
//! - [`engine`] walks the layer store and tests a parcel against every
//!   GeoPackage ([`gpkg`]), reprojecting the parcel with [`crs`]
//! - [`workspace`] and [`report`] hold a task's private output area
//! - [`packager`] zips that area into the downloadable artifact
//! - [`orchestrator`] drives one task end to end and writes its log to the
//!   registry
//! - [`assistant`] answers questions about a finished task

pub mod assistant;
pub mod config;
pub mod crs;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod gml;
pub mod gpkg;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod packager;
pub mod report;
pub mod workspace;

pub use assistant::{assistant_from_env, Assistant, ChatSessions};
pub use config::PipelineConfig;
pub use crs::Crs;
pub use engine::{Discovery, IntersectionEngine, LayerFile};
pub use error::{FetchError, LayerError, OrchestratorError, PackagingError};
pub use fetcher::{ReferenceFetcher, WfsFetcher};
pub use model::{IntersectionResult, ParcelGeometry};
pub use orchestrator::TaskOrchestrator;
pub use packager::ResultPackager;

/// Split an uploaded reference list into trimmed, non-empty lines.
pub fn parse_references(text: &str) -> Vec<String> {
    text.trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
