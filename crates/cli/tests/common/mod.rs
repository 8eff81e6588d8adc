//! Fixtures for end-to-end runs of the binary: a stub cadastral WFS served
//! from a background thread and a minimal GeoPackage writer.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use geo::{polygon, Geometry};
use geocore_core::gpkg::encode_geometry_blob;

/// Served as a 100 m square in EPSG:25830 near Madrid.
pub const KNOWN_REFERENCE: &str = "1234567AB1234C0001XY";
/// Not in the feed: empty feature collection.
pub const ABSENT_REFERENCE: &str = "9999999ZZ0000A0000ZZ";

/// Start the stub feed on a loopback port and return its URL. The server
/// lives until the test process exits.
pub fn spawn_feed() -> String {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let app = Router::new().route("/wfs", get(feed));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });
    let addr = rx.recv().unwrap();
    format!("http://{}/wfs", addr)
}

async fn feed(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let filter = params.get("filter").cloned().unwrap_or_default();
    let body = if filter.contains(KNOWN_REFERENCE) {
        parcel_gml(KNOWN_REFERENCE, 440_200.0, 4_474_200.0)
    } else {
        r#"<wfs:FeatureCollection xmlns:wfs="http://www.opengis.net/wfs/2.0" numberMatched="0" numberReturned="0"/>"#
            .to_string()
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/gml+xml; version=3.2")],
        body,
    )
}

/// INSPIRE parcel: a 100 m square with its south-west corner at `(x, y)`.
fn parcel_gml(reference: &str, x: f64, y: f64) -> String {
    let (x1, y1) = (x + 100.0, y + 100.0);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<wfs:FeatureCollection xmlns:wfs="http://www.opengis.net/wfs/2.0" xmlns:gml="http://www.opengis.net/gml/3.2"
  xmlns:cp="http://inspire.ec.europa.eu/schemas/cp/4.0" numberMatched="1" numberReturned="1">
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

/// Write a single-table GeoPackage at `path` whose features carry a `nombre`.
pub fn write_layer(path: &Path, table: &str, epsg: i32, features: &[(Geometry<f64>, &str)]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(&format!(
        "CREATE TABLE gpkg_spatial_ref_sys (srs_name TEXT, srs_id INTEGER PRIMARY KEY,
            organization TEXT, organization_coordsys_id INTEGER, definition TEXT);
         CREATE TABLE gpkg_contents (table_name TEXT PRIMARY KEY, data_type TEXT,
            identifier TEXT, srs_id INTEGER);
         CREATE TABLE gpkg_geometry_columns (table_name TEXT, column_name TEXT,
            geometry_type_name TEXT, srs_id INTEGER, z INTEGER, m INTEGER);
         INSERT INTO gpkg_spatial_ref_sys VALUES ('EPSG:{e}', {e}, 'EPSG', {e}, 'undefined');
         CREATE TABLE \"{t}\" (fid INTEGER PRIMARY KEY AUTOINCREMENT, geom BLOB, nombre TEXT);
         INSERT INTO gpkg_contents VALUES ('{t}', 'features', '{t}', {e});
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
