//! Affection-layer discovery and parcel intersection.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use geo::Geometry;

use crate::config::PipelineConfig;
use crate::crs::{self, Crs};
use crate::error::LayerError;
use crate::gpkg::{GeoPackage, GpkgError};
use crate::model::{IntersectionResult, ParcelGeometry};

/// A GeoPackage found under the layer root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFile {
    pub path: PathBuf,
    /// Path relative to the layer root, `/`-separated.
    pub relative: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// The layer root does not exist; nothing can be checked.
    MissingRoot(PathBuf),
    /// Layer files sorted by relative path. May be empty.
    Layers(Vec<LayerFile>),
}

pub struct IntersectionEngine {
    root: PathBuf,
    read_timeout: Duration,
}

impl IntersectionEngine {
    pub fn new(root: impl Into<PathBuf>, read_timeout: Duration) -> Self {
        IntersectionEngine {
            root: root.into(),
            read_timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        IntersectionEngine::new(config.layer_root.clone(), config.layer_timeout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Recursively list every `*.gpkg` under the layer root.
    pub async fn discover(&self) -> Result<Discovery, LayerError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || discover_layers(&root))
            .await
            .map_err(|e| LayerError::Discovery {
                root: self.root.clone(),
                message: format!("task join error: {}", e),
            })?
    }

    /// Test `parcel` against every layer, in order. Only layers with at
    /// least one intersecting feature, and layers that failed, are yielded.
    pub fn check_intersections<'a>(
        &'a self,
        parcel: &'a ParcelGeometry,
        layers: &'a [LayerFile],
    ) -> impl Stream<Item = Result<IntersectionResult, LayerError>> + Send + 'a {
        stream::iter(layers)
            .then(move |layer| self.check_layer(parcel, layer))
            .flat_map(stream::iter)
    }

    async fn check_layer(
        &self,
        parcel: &ParcelGeometry,
        layer: &LayerFile,
    ) -> Vec<Result<IntersectionResult, LayerError>> {
        let path = layer.path.clone();
        let relative = layer.relative.clone();
        let geometry = parcel.geometry.clone();
        let crs = parcel.crs;

        let work =
            tokio::task::spawn_blocking(move || scan_layer_file(&path, &relative, &geometry, crs));
        match tokio::time::timeout(self.read_timeout, work).await {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => vec![Err(LayerError::Read {
                layer: layer.relative.clone(),
                message: format!("task join error: {}", e),
            })],
            Err(_) => {
                tracing::warn!(layer = %layer.relative, timeout = ?self.read_timeout, "layer scan timed out");
                vec![Err(LayerError::Timeout {
                    layer: layer.relative.clone(),
                })]
            }
        }
    }
}

fn discover_layers(root: &Path) -> Result<Discovery, LayerError> {
    if !root.is_dir() {
        return Ok(Discovery::MissingRoot(root.to_path_buf()));
    }
    let discovery_error = |message: String| LayerError::Discovery {
        root: root.to_path_buf(),
        message,
    };

    let escaped = glob::Pattern::escape(&root.to_string_lossy());
    let pattern = format!("{}/**/*.gpkg", escaped.trim_end_matches('/'));
    let paths = glob::glob(&pattern).map_err(|e| discovery_error(e.to_string()))?;

    Ok(Discovery::Layers(collect_layers(root, paths)))
}

/// Keep the readable `.gpkg` files of a directory walk, sorted by relative
/// path. An entry the walk could not read is logged and skipped so the rest
/// of the tree is still checked.
fn collect_layers<E: std::fmt::Display>(
    root: &Path,
    entries: impl IntoIterator<Item = Result<PathBuf, E>>,
) -> Vec<LayerFile> {
    let mut layers = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "skipping unreadable layer entry");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        layers.push(LayerFile { path, relative });
    }
    layers.sort_by(|a, b| a.relative.cmp(&b.relative));
    layers
}

/// Check every feature table of one GeoPackage. Tables are identified as
/// `relative#table` when the file holds more than one.
fn scan_layer_file(
    path: &Path,
    relative: &str,
    parcel: &Geometry<f64>,
    parcel_crs: Crs,
) -> Vec<Result<IntersectionResult, LayerError>> {
    let read_error = |layer: &str, e: GpkgError| match e {
        GpkgError::Geometry(source) => LayerError::Geometry {
            layer: layer.to_string(),
            source,
        },
        other => LayerError::Read {
            layer: layer.to_string(),
            message: other.to_string(),
        },
    };

    let opened = GeoPackage::open(path).and_then(|gpkg| {
        let tables = gpkg.feature_tables()?;
        Ok((gpkg, tables))
    });
    let (gpkg, tables) = match opened {
        Ok(pair) => pair,
        Err(e) => return vec![Err(read_error(relative, e))],
    };
    let qualify = tables.len() > 1;

    let mut results = Vec::new();
    for table in &tables {
        let layer = if qualify {
            format!("{}#{}", relative, table.table)
        } else {
            relative.to_string()
        };
        let projected = match crs::reproject(parcel, parcel_crs, table.crs) {
            Ok(projected) => projected,
            Err(source) => {
                results.push(Err(LayerError::Reproject { layer, source }));
                continue;
            }
        };
        match gpkg.intersecting(table, &projected) {
            Ok(found) if found.matched > 0 => results.push(Ok(IntersectionResult {
                layer,
                matched: found.matched,
                sample: found.sample,
            })),
            Ok(_) => {}
            Err(e) => results.push(Err(read_error(&layer, e))),
        }
    }
    results
}
