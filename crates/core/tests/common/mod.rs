//! Fixtures shared by the pipeline tests: a stub cadastral WFS served on a
//! loopback port and a minimal GeoPackage writer.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use geo::{polygon, Geometry};
use geocore_core::gpkg::encode_geometry_blob;

/// Served as a 100 m square in EPSG:25830 near Madrid.
pub const KNOWN_REFERENCE: &str = "1234567AB1234C0001XY";
/// Second parcel, next to the first one.
pub const NEIGHBOUR_REFERENCE: &str = "1234567AB1234C0002XY";
/// Not in the feed: empty feature collection.
pub const ABSENT_REFERENCE: &str = "9999999ZZ0000A0000ZZ";
/// Answered with an OWS exception report and HTTP 200.
pub const EXCEPTION_REFERENCE: &str = "0000000EX0000E0000EX";
/// Answered with a feature that has no geometry.
pub const BROKEN_REFERENCE: &str = "1111111BR1111B1111BR";

pub struct StubFeed {
    pub url: String,
    requests: Arc<AtomicUsize>,
}

impl StubFeed {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

pub async fn spawn_feed() -> StubFeed {
    let requests = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/wfs", get(feed))
        .with_state(Arc::clone(&requests));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    StubFeed {
        url: format!("http://{}/wfs", addr),
        requests,
    }
}

async fn feed(
    State(requests): State<Arc<AtomicUsize>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    requests.fetch_add(1, Ordering::SeqCst);
    if params.get("request").map(String::as_str) != Some("GetFeature")
        || params.get("typenames").map(String::as_str) != Some("cp:CadastralParcel")
    {
        return (StatusCode::BAD_REQUEST, "bad request").into_response();
    }
    let filter = params.get("filter").cloned().unwrap_or_default();

    let body = if filter.contains(KNOWN_REFERENCE) {
        parcel_gml(KNOWN_REFERENCE, 440_200.0, 4_474_200.0)
    } else if filter.contains(NEIGHBOUR_REFERENCE) {
        parcel_gml(NEIGHBOUR_REFERENCE, 440_300.0, 4_474_200.0)
    } else if filter.contains(EXCEPTION_REFERENCE) {
        r#"<?xml version="1.0"?><ows:ExceptionReport xmlns:ows="http://www.opengis.net/ows/1.1" version="2.0.0">
<ows:Exception exceptionCode="OperationProcessingFailed"><ows:ExceptionText>fallo interno</ows:ExceptionText></ows:Exception>
</ows:ExceptionReport>"#
            .to_string()
    } else if filter.contains(BROKEN_REFERENCE) {
        format!(
            r#"<wfs:FeatureCollection xmlns:wfs="http://www.opengis.net/wfs/2.0" numberMatched="1" numberReturned="1">
<wfs:member><cp:CadastralParcel xmlns:cp="http://inspire.ec.europa.eu/schemas/cp/4.0">
<cp:nationalCadastralReference>{}</cp:nationalCadastralReference>
</cp:CadastralParcel></wfs:member></wfs:FeatureCollection>"#,
            BROKEN_REFERENCE
        )
    } else {
        r#"<wfs:FeatureCollection xmlns:wfs="http://www.opengis.net/wfs/2.0" numberMatched="0" numberReturned="0"/>"#
            .to_string()
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/gml+xml; version=3.2")],
        body,
    )
        .into_response()
}

/// INSPIRE parcel: a 100 m square with its south-west corner at `(x, y)`.
pub fn parcel_gml(reference: &str, x: f64, y: f64) -> String {
    let (x1, y1) = (x + 100.0, y + 100.0);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<wfs:FeatureCollection xmlns:wfs="http://www.opengis.net/wfs/2.0" xmlns:gml="http://www.opengis.net/gml/3.2"
  xmlns:cp="http://inspire.ec.europa.eu/schemas/cp/4.0" xmlns:base="http://inspire.ec.europa.eu/schemas/base/3.3"
  numberMatched="1" numberReturned="1">
 <wfs:member>
  <cp:CadastralParcel gml:id="ES.SDGC.CP.{r}">
   <cp:areaValue uom="m2">10000</cp:areaValue>
   <cp:geometry>
    <gml:MultiSurface gml:id="MS.{r}" srsName="http://www.opengis.net/def/crs/EPSG/0/25830">
     <gml:surfaceMember>
      <gml:Surface gml:id="S.{r}" srsName="http://www.opengis.net/def/crs/EPSG/0/25830">
       <gml:patches><gml:PolygonPatch><gml:exterior><gml:LinearRing>
        <gml:posList srsDimension="2" count="5">{x} {y} {x1} {y} {x1} {y1} {x} {y1} {x} {y}</gml:posList>
       </gml:LinearRing></gml:exterior></gml:PolygonPatch></gml:patches>
      </gml:Surface>
     </gml:surfaceMember>
    </gml:MultiSurface>
   </cp:geometry>
   <cp:inspireId><base:Identifier><base:localId>{r}</base:localId><base:namespace>ES.SDGC.CP</base:namespace></base:Identifier></cp:inspireId>
   <cp:label>1</cp:label>
   <cp:nationalCadastralReference>{r}</cp:nationalCadastralReference>
  </cp:CadastralParcel>
 </wfs:member>
</wfs:FeatureCollection>"#,
        r = reference,
        x = x,
        y = y,
        x1 = x1,
        y1 = y1
    )
}

/// Protected area around central Madrid, in ETRS89 geographic degrees.
pub fn madrid_protected_area() -> Geometry<f64> {
    polygon![(x: -3.8, y: 40.3), (x: -3.6, y: 40.3), (x: -3.6, y: 40.5), (x: -3.8, y: 40.5)].into()
}

/// Forest far from the parcels, in EPSG:25830 metres.
pub fn distant_forest() -> Geometry<f64> {
    polygon![
        (x: 500_000.0, y: 4_000_000.0),
        (x: 501_000.0, y: 4_000_000.0),
        (x: 501_000.0, y: 4_001_000.0),
        (x: 500_000.0, y: 4_001_000.0),
    ]
    .into()
}

/// Write a single-table GeoPackage at `path` whose features carry a `nombre`.
pub fn write_layer(path: &Path, table: &str, epsg: i32, features: &[(Geometry<f64>, &str)]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(&format!(
        "CREATE TABLE gpkg_spatial_ref_sys (srs_name TEXT NOT NULL, srs_id INTEGER PRIMARY KEY,
            organization TEXT NOT NULL, organization_coordsys_id INTEGER NOT NULL,
            definition TEXT NOT NULL, description TEXT);
         CREATE TABLE gpkg_contents (table_name TEXT PRIMARY KEY, data_type TEXT NOT NULL,
            identifier TEXT, description TEXT DEFAULT '', last_change DATETIME,
            min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE, srs_id INTEGER);
         CREATE TABLE gpkg_geometry_columns (table_name TEXT NOT NULL, column_name TEXT NOT NULL,
            geometry_type_name TEXT NOT NULL, srs_id INTEGER NOT NULL, z TINYINT NOT NULL,
            m TINYINT NOT NULL);
         INSERT INTO gpkg_spatial_ref_sys (srs_name, srs_id, organization, organization_coordsys_id, definition)
            VALUES ('EPSG:{e}', {e}, 'EPSG', {e}, 'undefined');
         CREATE TABLE \"{t}\" (fid INTEGER PRIMARY KEY AUTOINCREMENT, geom BLOB, nombre TEXT);
         INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id)
            VALUES ('{t}', 'features', '{t}', {e});
         INSERT INTO gpkg_geometry_columns VALUES ('{t}', 'geom', 'MULTIPOLYGON', {e}, 0, 0);",
        e = epsg,
        t = table
    ))
    .unwrap();
    for (geometry, name) in features {
        let blob = encode_geometry_blob(geometry, epsg).unwrap();
        conn.execute(
            &format!("INSERT INTO \"{}\" (geom, nombre) VALUES (?1, ?2)", table),
            rusqlite::params![blob, name],
        )
        .unwrap();
    }
}
