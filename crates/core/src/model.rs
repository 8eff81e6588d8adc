use std::collections::BTreeMap;

use geo::Geometry;
use serde::Serialize;

use crate::crs::Crs;

/// Geometry of one cadastral parcel as served by the feed.
#[derive(Debug, Clone)]
pub struct ParcelGeometry {
    pub reference: String,
    /// Parcel surface in the feed's native CRS.
    pub geometry: Geometry<f64>,
    pub crs: Crs,
    /// Planar area in `crs` units (m² for projected systems).
    pub area: f64,
    /// Scalar properties of the feature (`localId`, `areaValue`, `label`...).
    pub attributes: BTreeMap<String, String>,
    /// Raw GML response, persisted as-is for auditing.
    pub payload: Vec<u8>,
}

impl ParcelGeometry {
    /// INSPIRE local id of the parcel, when the feed provided one.
    pub fn local_id(&self) -> Option<&str> {
        self.attributes.get("localId").map(String::as_str)
    }
}

/// A positive match of a parcel against one affection layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntersectionResult {
    /// Layer path relative to the layer root (`dir/file.gpkg`, or
    /// `dir/file.gpkg#table` when the file holds several feature tables).
    pub layer: String,
    /// Number of layer features the parcel intersects.
    pub matched: usize,
    /// Attributes of the first intersecting feature.
    pub sample: Option<BTreeMap<String, String>>,
}
