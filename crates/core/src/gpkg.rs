//! Read-only access to OGC GeoPackage feature tables.

use std::collections::BTreeMap;
use std::path::Path;

use geo::{BoundingRect, Geometry, Intersects, Rect};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use crate::crs::Crs;
use crate::error::GeometryError;

#[derive(Debug, thiserror::Error)]
pub enum GpkgError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("table '{table}' has no usable spatial reference (srs_id {srs_id})")]
    UndefinedCrs { table: String, srs_id: i64 },
}

/// A feature table registered in `gpkg_contents`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub table: String,
    pub geometry_column: String,
    pub crs: Crs,
}

/// Outcome of scanning one table against a predicate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableMatches {
    pub matched: usize,
    /// Non-geometry attributes of the first matching feature.
    pub sample: Option<BTreeMap<String, String>>,
}

pub struct GeoPackage {
    conn: Connection,
}

impl GeoPackage {
    pub fn open(path: &Path) -> Result<Self, GpkgError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(GeoPackage { conn })
    }

    /// Feature tables in name order.
    pub fn feature_tables(&self) -> Result<Vec<FeatureTable>, GpkgError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.table_name, g.column_name, g.srs_id, s.organization, s.organization_coordsys_id
             FROM gpkg_contents c
             JOIN gpkg_geometry_columns g ON g.table_name = c.table_name
             LEFT JOIN gpkg_spatial_ref_sys s ON s.srs_id = g.srs_id
             WHERE c.data_type = 'features'
             ORDER BY c.table_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;

        let mut tables = Vec::new();
        for row in rows {
            let (table, geometry_column, srs_id, organization, coordsys_id) = row?;
            let code = match (organization, coordsys_id) {
                (Some(org), Some(id)) if org.eq_ignore_ascii_case("epsg") => id,
                _ => srs_id,
            };
            let code = u32::try_from(code)
                .ok()
                .filter(|c| *c > 0)
                .ok_or(GpkgError::UndefinedCrs {
                    table: table.clone(),
                    srs_id,
                })?;
            tables.push(FeatureTable {
                table,
                geometry_column,
                crs: Crs::epsg(code),
            });
        }
        Ok(tables)
    }

    /// Count the features of `table` that intersect `query` (already in the
    /// table's CRS). Rows with null or empty geometries are skipped.
    pub fn intersecting(
        &self,
        table: &FeatureTable,
        query: &Geometry<f64>,
    ) -> Result<TableMatches, GpkgError> {
        let query_bounds = query.bounding_rect();
        let sql = format!("SELECT * FROM {}", quote_identifier(&table.table));
        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let geometry_index = columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(&table.geometry_column))
            .ok_or_else(|| {
                GpkgError::Sqlite(rusqlite::Error::InvalidColumnName(
                    table.geometry_column.clone(),
                ))
            })?;

        let mut result = TableMatches::default();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let blob = match row.get_ref(geometry_index)? {
                ValueRef::Blob(bytes) => bytes,
                _ => continue,
            };
            let Some(geometry) = decode_geometry_blob(blob)? else {
                continue;
            };
            if !bounds_overlap(query_bounds, geometry.bounding_rect()) {
                continue;
            }
            if !query.intersects(&geometry) {
                continue;
            }
            result.matched += 1;
            if result.sample.is_none() {
                let mut attributes = BTreeMap::new();
                for (i, name) in columns.iter().enumerate() {
                    if i == geometry_index {
                        continue;
                    }
                    if let Some(value) = value_to_string(row.get_ref(i)?) {
                        attributes.insert(name.clone(), value);
                    }
                }
                result.sample = Some(attributes);
            }
        }
        Ok(result)
    }
}

fn bounds_overlap(a: Option<Rect<f64>>, b: Option<Rect<f64>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.intersects(&b),
        _ => true,
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn value_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(format!("<blob {} bytes>", b.len())),
    }
}

// ── Geometry blobs ───────────────────────────────────────────────────────────

const MAGIC: &[u8; 2] = b"GP";
const HEADER_LEN: usize = 8;
const FLAG_LITTLE_ENDIAN: u8 = 0b0000_0001;
const FLAG_EMPTY: u8 = 0b0001_0000;

fn envelope_len(flags: u8) -> Result<usize, GeometryError> {
    match (flags >> 1) & 0b111 {
        0 => Ok(0),
        1 => Ok(32),
        2 | 3 => Ok(48),
        4 => Ok(64),
        other => Err(GeometryError::Blob(format!(
            "invalid envelope indicator {}",
            other
        ))),
    }
}

/// Decode a GeoPackage binary geometry. `None` for the empty geometry.
pub fn decode_geometry_blob(blob: &[u8]) -> Result<Option<Geometry<f64>>, GeometryError> {
    if blob.len() < HEADER_LEN || &blob[..2] != MAGIC {
        return Err(GeometryError::Blob("missing GP header".to_string()));
    }
    let flags = blob[3];
    if flags & FLAG_EMPTY != 0 {
        return Ok(None);
    }
    let start = HEADER_LEN + envelope_len(flags)?;
    if blob.len() <= start {
        return Err(GeometryError::Blob(format!(
            "truncated blob ({} bytes)",
            blob.len()
        )));
    }
    let flat = flatten_wkb(&blob[start..])?;
    let mut wkb_bytes = flat.as_slice();
    wkb::wkb_to_geom(&mut wkb_bytes)
        .map(Some)
        .map_err(|e| GeometryError::Wkb(format!("{:?}", e)))
}

// ── WKB dimension flattening ─────────────────────────────────────────────────
//
// Layers digitised with elevation or measures store ISO types (1000 Z, 2000
// M, 3000 ZM) or EWKB flag bits. The `wkb` decoder only reads XY, so every
// geometry is rewritten as little-endian 2D WKB first.

const EWKB_Z: u32 = 0x8000_0000;
const EWKB_M: u32 = 0x4000_0000;
const EWKB_SRID: u32 = 0x2000_0000;
const EWKB_FLAGS: u32 = EWKB_Z | EWKB_M | EWKB_SRID;

struct WkbReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WkbReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], GeometryError> {
        let end = self.pos + n;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            GeometryError::Wkb(format!("truncated WKB at byte {}", self.pos))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self, little: bool) -> Result<u32, GeometryError> {
        let raw: [u8; 4] = self.take(4)?.try_into().map_err(|_| {
            GeometryError::Wkb("short integer".to_string())
        })?;
        Ok(if little {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    fn read_f64(&mut self, little: bool) -> Result<f64, GeometryError> {
        let raw: [u8; 8] = self.take(8)?.try_into().map_err(|_| {
            GeometryError::Wkb("short coordinate".to_string())
        })?;
        Ok(if little {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    }

    fn points(
        &mut self,
        little: bool,
        dims: usize,
        count: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), GeometryError> {
        for _ in 0..count {
            let x = self.read_f64(little)?;
            let y = self.read_f64(little)?;
            for _ in 2..dims {
                self.read_f64(little)?;
            }
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        Ok(())
    }

    fn geometry(&mut self, out: &mut Vec<u8>) -> Result<(), GeometryError> {
        let little = match self.take(1)?[0] {
            0 => false,
            1 => true,
            other => {
                return Err(GeometryError::Wkb(format!("invalid byte order {}", other)));
            }
        };
        let raw = self.read_u32(little)?;
        if raw & EWKB_SRID != 0 {
            self.take(4)?;
        }
        let iso = raw & !EWKB_FLAGS;
        let code = iso % 1000;
        let (has_z, has_m) = match iso / 1000 {
            0 => (false, false),
            1 => (true, false),
            2 => (false, true),
            3 => (true, true),
            other => {
                return Err(GeometryError::Wkb(format!("invalid dimension group {}", other)));
            }
        };
        let has_z = has_z || raw & EWKB_Z != 0;
        let has_m = has_m || raw & EWKB_M != 0;
        let dims = 2 + usize::from(has_z) + usize::from(has_m);

        out.push(1);
        out.extend_from_slice(&code.to_le_bytes());
        match code {
            1 => self.points(little, dims, 1, out),
            2 => {
                let count = self.read_u32(little)?;
                out.extend_from_slice(&count.to_le_bytes());
                self.points(little, dims, count, out)
            }
            3 => {
                let rings = self.read_u32(little)?;
                out.extend_from_slice(&rings.to_le_bytes());
                for _ in 0..rings {
                    let count = self.read_u32(little)?;
                    out.extend_from_slice(&count.to_le_bytes());
                    self.points(little, dims, count, out)?;
                }
                Ok(())
            }
            4..=7 => {
                let parts = self.read_u32(little)?;
                out.extend_from_slice(&parts.to_le_bytes());
                for _ in 0..parts {
                    self.geometry(out)?;
                }
                Ok(())
            }
            other => Err(GeometryError::Wkb(format!(
                "unsupported geometry type {}",
                other
            ))),
        }
    }
}

/// Rewrite any ISO or EWKB geometry as 2D little-endian WKB.
pub fn flatten_wkb(bytes: &[u8]) -> Result<Vec<u8>, GeometryError> {
    let mut reader = WkbReader { bytes, pos: 0 };
    let mut out = Vec::with_capacity(bytes.len());
    reader.geometry(&mut out)?;
    Ok(out)
}

/// Encode a geometry as a GeoPackage blob without envelope.
pub fn encode_geometry_blob(geometry: &Geometry<f64>, srs_id: i32) -> Result<Vec<u8>, GeometryError> {
    let body = wkb::geom_to_wkb(geometry).map_err(|e| GeometryError::Wkb(format!("{:?}", e)))?;
    let mut blob = Vec::with_capacity(HEADER_LEN + body.len());
    blob.extend_from_slice(MAGIC);
    blob.push(0);
    blob.push(FLAG_LITTLE_ENDIAN);
    blob.extend_from_slice(&srs_id.to_le_bytes());
    blob.extend_from_slice(&body);
    Ok(blob)
}
