//! Retrieval of parcel geometries from the cadastral WFS.

use std::time::Duration;

use async_trait::async_trait;
use geo::{Area, Geometry, MultiPolygon};

use crate::config::PipelineConfig;
use crate::crs::Crs;
use crate::error::{FetchError, GeometryError};
use crate::gml;
use crate::model::ParcelGeometry;

/// A success body containing this text is a service exception report.
pub const SERVICE_EXCEPTION_MARKER: &str = "Exception";

/// CRS assumed when neither the feature nor the collection declares one.
const FALLBACK_CRS: Crs = Crs::ETRS89_UTM30N;

/// Resolves a cadastral reference into its parcel geometry.
#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<ParcelGeometry, FetchError>;
}

/// [`ReferenceFetcher`] backed by an INSPIRE `CadastralParcel` WFS 2.0.
#[derive(Debug, Clone)]
pub struct WfsFetcher {
    feed_url: String,
    timeout: Duration,
}

impl WfsFetcher {
    pub fn new(feed_url: impl Into<String>, timeout: Duration) -> Self {
        WfsFetcher {
            feed_url: feed_url.into(),
            timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        WfsFetcher::new(config.feed_url.clone(), config.fetch_timeout)
    }
}

#[async_trait]
impl ReferenceFetcher for WfsFetcher {
    async fn fetch(&self, reference: &str) -> Result<ParcelGeometry, FetchError> {
        let url = self.feed_url.clone();
        let timeout = self.timeout;
        let filter = reference_filter(reference);

        // ureq is synchronous, so wrap in spawn_blocking
        let (status, body) =
            tokio::task::spawn_blocking(move || get_feature(&url, timeout, &filter))
                .await
                .map_err(|e| FetchError::Worker(format!("task join error: {}", e)))??;

        classify_response(reference, status, body)
    }
}

/// FES 2.0 filter selecting one parcel by its national cadastral reference.
pub fn reference_filter(reference: &str) -> String {
    format!(
        concat!(
            "<fes:Filter xmlns:fes=\"http://www.opengis.net/fes/2.0\" ",
            "xmlns:cp=\"http://inspire.ec.europa.eu/schemas/cp/4.0\">",
            "<fes:PropertyIsEqualTo>",
            "<fes:ValueReference>cp:nationalCadastralReference</fes:ValueReference>",
            "<fes:Literal>{}</fes:Literal>",
            "</fes:PropertyIsEqualTo>",
            "</fes:Filter>"
        ),
        quick_xml::escape::escape(reference.trim())
    )
}

fn get_feature(url: &str, timeout: Duration, filter: &str) -> Result<(u16, Vec<u8>), FetchError> {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into();

    let mut response = agent
        .get(url)
        .query("service", "WFS")
        .query("version", "2.0.0")
        .query("request", "GetFeature")
        .query("typenames", "cp:CadastralParcel")
        .query("outputFormat", "application/gml+xml; version=3.2")
        .query("filter", filter)
        .call()
        .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = response.status().as_u16();
    let body = response
        .body_mut()
        .read_to_vec()
        .map_err(|e| FetchError::Network(format!("failed to read response body: {}", e)))?;
    Ok((status, body))
}

/// Turn a raw feed answer into a parcel or the matching [`FetchError`].
///
/// Checked in order: HTTP status, exception marker, XML validity, feature
/// count, surface geometry.
pub fn classify_response(
    reference: &str,
    status: u16,
    body: Vec<u8>,
) -> Result<ParcelGeometry, FetchError> {
    if !(200..300).contains(&status) {
        return Err(FetchError::Service(format!(
            "HTTP {}: {}",
            status,
            excerpt(&body)
        )));
    }
    let text = String::from_utf8_lossy(&body);
    if text.contains(SERVICE_EXCEPTION_MARKER) {
        return Err(FetchError::Service(excerpt(&body)));
    }
    parcel_from_payload(reference, body)
}

/// Decode a GML payload known to be a successful answer.
pub fn parcel_from_payload(reference: &str, payload: Vec<u8>) -> Result<ParcelGeometry, FetchError> {
    let document = match gml::parse_document(&payload) {
        Ok(document) => document,
        Err(source) => return Err(FetchError::GeometryFormat { source, payload }),
    };
    let mut features = document.features.into_iter();
    let Some(first) = features.next() else {
        return Err(FetchError::EmptyResult {
            reference: reference.to_string(),
        });
    };
    // All surfaces of the answer make up the parcel.
    let polygons: Vec<_> = first
        .geometry
        .into_iter()
        .chain(features.filter_map(|f| f.geometry))
        .flat_map(|multi| multi.0)
        .collect();
    if polygons.is_empty() {
        return Err(FetchError::GeometryFormat {
            source: GeometryError::MissingGeometry,
            payload,
        });
    }
    let crs = match first.srs_name.as_deref().map(Crs::from_srs_name) {
        None => FALLBACK_CRS,
        Some(Ok(crs)) => crs,
        Some(Err(e)) => {
            return Err(FetchError::GeometryFormat {
                source: GeometryError::Coordinates(e.to_string()),
                payload,
            })
        }
    };

    let geometry = Geometry::MultiPolygon(MultiPolygon::new(polygons));
    let area = geometry.unsigned_area();
    Ok(ParcelGeometry {
        reference: reference.to_string(),
        geometry,
        crs,
        area,
        attributes: first.attributes,
        payload,
    })
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    match trimmed.char_indices().nth(200) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
