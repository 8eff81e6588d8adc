//! Minimal GML 3.2 reader for INSPIRE cadastral parcel responses.
//!
//! Only what the pipeline needs is extracted: the surface of each feature
//! (`Polygon`/`PolygonPatch` rings, any nesting under `MultiSurface` or
//! `Surface`), the `srsName` it is expressed in, and the feature's scalar
//! properties. Points such as `referencePoint` are ignored.

use std::collections::BTreeMap;

use geo::{Coord, LineString, MapCoords, MultiPolygon, Polygon};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::crs::Crs;
use crate::error::GeometryError;

/// One `member` of a feature collection.
#[derive(Debug, Clone, Default)]
pub struct GmlFeature {
    /// Surface of the feature, in `(x, y)` = `(easting|lon, northing|lat)` order.
    pub geometry: Option<MultiPolygon<f64>>,
    pub srs_name: Option<String>,
    /// Leaf text properties keyed by local element name. First value wins.
    pub attributes: BTreeMap<String, String>,
}

/// Parsed WFS `FeatureCollection`.
#[derive(Debug, Clone, Default)]
pub struct GmlDocument {
    pub features: Vec<GmlFeature>,
}

const FEATURE_WRAPPERS: &[&str] = &["member", "featureMember"];
const POLYGONS: &[&str] = &["Polygon", "PolygonPatch"];
const COORDINATE_LISTS: &[&str] = &["posList", "pos", "coordinates"];
/// Elements whose text is never a feature property.
const GEOMETRY_SCOPES: &[&str] = &[
    "boundedBy",
    "Envelope",
    "MultiSurface",
    "Surface",
    "Polygon",
    "PolygonPatch",
    "Point",
    "MultiPoint",
    "LineString",
    "MultiCurve",
    "Curve",
];

#[derive(Default)]
struct PolygonBuilder {
    exterior: Option<LineString<f64>>,
    interiors: Vec<LineString<f64>>,
}

#[derive(Clone, Copy, PartialEq)]
enum RingRole {
    Exterior,
    Interior,
}

#[derive(Default)]
struct ParserState {
    document: GmlDocument,
    document_srs: Option<String>,
    feature: Option<FeatureBuilder>,
    depth: usize,
    geometry_depth: usize,
    polygon: Option<PolygonBuilder>,
    ring_role: Option<RingRole>,
    ring: Vec<Coord<f64>>,
    /// `srsDimension` of the innermost geometry that declared one.
    dimension: usize,
    coordinate_list: Option<(String, usize)>,
    text: String,
}

#[derive(Default)]
struct FeatureBuilder {
    polygons: Vec<Polygon<f64>>,
    srs_name: Option<String>,
    attributes: BTreeMap<String, String>,
    /// Open elements below the feature wrapper and whether each has children.
    open: Vec<(String, bool)>,
}

/// Parse a GML feature collection (or a bare feature) into its features.
pub fn parse_document(bytes: &[u8]) -> Result<GmlDocument, GeometryError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);
    let mut state = ParserState {
        dimension: 2,
        ..ParserState::default()
    };
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => state.start(e, false)?,
            Ok(Event::Empty(ref e)) => state.start(e, true)?,
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                state.end(&name)?;
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| GeometryError::Xml(err.to_string()))?;
                state.text.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GeometryError::Xml(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    // A bare feature without a collection wrapper.
    if state.document.features.is_empty() {
        if let Some(feature) = state.feature.take() {
            let srs = state.document_srs.clone();
            state.document.features.push(feature.finish(srs));
        }
    }
    Ok(state.document)
}

impl ParserState {
    fn start(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<(), GeometryError> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        self.text.clear();

        let mut srs_name = None;
        let mut dimension = None;
        for attr in e.attributes() {
            let attr = attr.map_err(|err| GeometryError::Xml(err.to_string()))?;
            let value = attr
                .unescape_value()
                .map_err(|err| GeometryError::Xml(err.to_string()))?;
            match attr.key.local_name().as_ref() {
                b"srsName" => srs_name = Some(value.into_owned()),
                b"srsDimension" => dimension = value.trim().parse::<usize>().ok(),
                _ => {}
            }
        }

        if let Some(srs) = &srs_name {
            match self.feature.as_mut() {
                Some(feature) if feature.srs_name.is_none() => {
                    feature.srs_name = Some(srs.clone())
                }
                Some(_) => {}
                None => {
                    if self.document_srs.is_none() {
                        self.document_srs = Some(srs.clone());
                    }
                }
            }
        }
        if let Some(parent) = self.feature.as_mut().and_then(|f| f.open.last_mut()) {
            parent.1 = true;
        }
        if empty {
            return Ok(());
        }

        let root = self.depth == 0;
        self.depth += 1;
        if FEATURE_WRAPPERS.contains(&name.as_str()) {
            self.feature = Some(FeatureBuilder::default());
            return Ok(());
        }
        if root && name != "FeatureCollection" {
            // Feature served without a collection wrapper.
            self.feature = Some(FeatureBuilder::default());
        }

        if GEOMETRY_SCOPES.contains(&name.as_str()) {
            self.geometry_depth += 1;
            if let Some(d) = dimension {
                self.dimension = d;
            }
        }
        if POLYGONS.contains(&name.as_str()) {
            self.polygon = Some(PolygonBuilder::default());
        }
        match name.as_str() {
            "exterior" | "outerBoundaryIs" => self.ring_role = Some(RingRole::Exterior),
            "interior" | "innerBoundaryIs" => self.ring_role = Some(RingRole::Interior),
            "LinearRing" => self.ring.clear(),
            _ => {}
        }
        if COORDINATE_LISTS.contains(&name.as_str()) {
            self.coordinate_list = Some((name.clone(), dimension.unwrap_or(self.dimension)));
        }
        if let Some(feature) = self.feature.as_mut() {
            feature.open.push((name, false));
        }
        Ok(())
    }

    fn end(&mut self, name: &str) -> Result<(), GeometryError> {
        let text = std::mem::take(&mut self.text);
        self.depth = self.depth.saturating_sub(1);

        if let Some((list, dim)) = self.coordinate_list.take() {
            if list == name && self.ring_role.is_some() && self.polygon.is_some() {
                let coords = parse_coordinates(&list, &text, dim)?;
                self.ring.extend(coords);
            }
        }

        match name {
            "LinearRing" => {
                if let (Some(role), Some(polygon)) = (self.ring_role, self.polygon.as_mut()) {
                    let coords = std::mem::take(&mut self.ring);
                    if coords.len() < 3 {
                        return Err(GeometryError::Coordinates(format!(
                            "ring with {} positions",
                            coords.len()
                        )));
                    }
                    let ring = LineString::from(coords);
                    match role {
                        RingRole::Exterior => polygon.exterior = Some(ring),
                        RingRole::Interior => polygon.interiors.push(ring),
                    }
                }
            }
            "exterior" | "outerBoundaryIs" | "interior" | "innerBoundaryIs" => {
                self.ring_role = None
            }
            _ => {}
        }

        if POLYGONS.contains(&name) {
            if let Some(builder) = self.polygon.take() {
                let exterior = builder.exterior.ok_or(GeometryError::MissingGeometry)?;
                if let Some(feature) = self.feature.as_mut() {
                    feature
                        .polygons
                        .push(Polygon::new(exterior, builder.interiors));
                }
            }
        }
        if GEOMETRY_SCOPES.contains(&name) {
            self.geometry_depth = self.geometry_depth.saturating_sub(1);
            if self.geometry_depth == 0 {
                self.dimension = 2;
            }
        }

        if FEATURE_WRAPPERS.contains(&name) {
            if let Some(feature) = self.feature.take() {
                let srs = self.document_srs.clone();
                self.document.features.push(feature.finish(srs));
            }
            return Ok(());
        }

        if let Some(feature) = self.feature.as_mut() {
            let is_leaf = matches!(feature.open.pop(), Some((open, false)) if open == name);
            let trimmed = text.trim();
            if is_leaf && self.geometry_depth == 0 && !trimmed.is_empty() {
                feature
                    .attributes
                    .entry(name.to_string())
                    .or_insert_with(|| trimmed.to_string());
            }
        }
        Ok(())
    }
}

impl FeatureBuilder {
    fn finish(self, document_srs: Option<String>) -> GmlFeature {
        let srs_name = self.srs_name.or(document_srs);
        let geometry = if self.polygons.is_empty() {
            None
        } else {
            let multi = MultiPolygon::new(self.polygons);
            let lat_lon = srs_name
                .as_deref()
                .map(Crs::srs_name_is_lat_lon)
                .unwrap_or(false);
            Some(if lat_lon {
                multi.map_coords(|c| Coord { x: c.y, y: c.x })
            } else {
                multi
            })
        };
        GmlFeature {
            geometry,
            srs_name,
            attributes: self.attributes,
        }
    }
}

/// Decode `posList`/`pos` (whitespace separated, `dim` values per position)
/// or GML 2 `coordinates` (`x,y x,y ...`).
fn parse_coordinates(kind: &str, text: &str, dim: usize) -> Result<Vec<Coord<f64>>, GeometryError> {
    let number = |s: &str| {
        s.parse::<f64>()
            .map_err(|_| GeometryError::Coordinates(format!("'{}' is not a number", s)))
    };

    if kind == "coordinates" {
        return text
            .split_whitespace()
            .map(|tuple| {
                let mut parts = tuple.split(',');
                match (parts.next(), parts.next()) {
                    (Some(x), Some(y)) => Ok(Coord {
                        x: number(x)?,
                        y: number(y)?,
                    }),
                    _ => Err(GeometryError::Coordinates(format!("bad tuple '{}'", tuple))),
                }
            })
            .collect();
    }

    let dim = dim.max(2);
    let values = text
        .split_whitespace()
        .map(number)
        .collect::<Result<Vec<f64>, _>>()?;
    if values.len() % dim != 0 {
        return Err(GeometryError::Coordinates(format!(
            "{} values is not a multiple of dimension {}",
            values.len(),
            dim
        )));
    }
    Ok(values
        .chunks(dim)
        .map(|c| Coord { x: c[0], y: c[1] })
        .collect())
}
