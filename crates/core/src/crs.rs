//! Coordinate reference systems and parcel reprojection.
//!
//! CRSs are identified by EPSG code. Only the systems that show up in the
//! Spanish cadastre and in regional affection layers are known; anything
//! else is reported as [`CrsError::Unsupported`] so the layer is skipped with
//! an error instead of being compared in the wrong space.

use std::fmt;

use geo::{Coord, Geometry, MapCoords};
use proj4rs::proj::Proj;

use crate::error::CrsError;

/// An EPSG-identified coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Crs(u32);

impl Crs {
    pub const WGS84: Crs = Crs(4326);
    pub const ETRS89: Crs = Crs(4258);
    pub const ETRS89_UTM30N: Crs = Crs(25830);

    pub fn epsg(code: u32) -> Self {
        Crs(code)
    }

    pub fn code(self) -> u32 {
        self.0
    }

    /// Parse the `srsName` forms used by WFS and GML:
    /// `EPSG:25830`, `urn:ogc:def:crs:EPSG::25830`,
    /// `urn:ogc:def:crs:EPSG:6.6:25830`,
    /// `http://www.opengis.net/def/crs/EPSG/0/25830` and
    /// `http://www.opengis.net/gml/srs/epsg.xml#25830`.
    pub fn from_srs_name(name: &str) -> Result<Crs, CrsError> {
        let trimmed = name.trim();
        if !trimmed.to_ascii_lowercase().contains("epsg") {
            return Err(CrsError::UnknownName(trimmed.to_string()));
        }
        let digits: String = trimmed
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits
            .parse::<u32>()
            .map(Crs)
            .map_err(|_| CrsError::UnknownName(trimmed.to_string()))
    }

    /// True for geographic (longitude/latitude) systems.
    pub fn is_geographic(self) -> bool {
        matches!(self.0, 4326 | 4258 | 4230)
    }

    /// GML 3.2 writes geographic coordinates in the authority's axis order
    /// (latitude first) when the CRS is given as a URN or OGC URL. The
    /// legacy `EPSG:xxxx` form keeps longitude first.
    pub fn srs_name_is_lat_lon(name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        let authority_form = lower.starts_with("urn:") || lower.contains("opengis.net/def/crs");
        authority_form && Crs::from_srs_name(name).map(Crs::is_geographic).unwrap_or(false)
    }

    /// Unit label for areas computed in this CRS.
    pub fn area_unit(self) -> &'static str {
        if self.is_geographic() {
            "grados²"
        } else {
            "m²"
        }
    }

    fn proj_definition(self) -> Result<&'static str, CrsError> {
        let def = match self.0 {
            4326 => "+proj=latlong +datum=WGS84 +no_defs",
            4258 => "+proj=latlong +ellps=GRS80 +no_defs",
            4230 => "+proj=latlong +ellps=intl +towgs84=-87,-98,-121,0,0,0,0 +no_defs",
            3857 => "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs",
            3035 => "+proj=laea +lat_0=52 +lon_0=10 +x_0=4321000 +y_0=3210000 +ellps=GRS80 +units=m +no_defs",
            25828 => "+proj=utm +zone=28 +ellps=GRS80 +units=m +no_defs",
            25829 => "+proj=utm +zone=29 +ellps=GRS80 +units=m +no_defs",
            25830 => "+proj=utm +zone=30 +ellps=GRS80 +units=m +no_defs",
            25831 => "+proj=utm +zone=31 +ellps=GRS80 +units=m +no_defs",
            32628 => "+proj=utm +zone=28 +datum=WGS84 +units=m +no_defs",
            32629 => "+proj=utm +zone=29 +datum=WGS84 +units=m +no_defs",
            32630 => "+proj=utm +zone=30 +datum=WGS84 +units=m +no_defs",
            32631 => "+proj=utm +zone=31 +datum=WGS84 +units=m +no_defs",
            23029 => "+proj=utm +zone=29 +ellps=intl +towgs84=-87,-98,-121,0,0,0,0 +units=m +no_defs",
            23030 => "+proj=utm +zone=30 +ellps=intl +towgs84=-87,-98,-121,0,0,0,0 +units=m +no_defs",
            23031 => "+proj=utm +zone=31 +ellps=intl +towgs84=-87,-98,-121,0,0,0,0 +units=m +no_defs",
            other => return Err(CrsError::Unsupported(other)),
        };
        Ok(def)
    }

    fn to_proj(self) -> Result<Proj, CrsError> {
        Proj::from_proj_string(self.proj_definition()?)
            .map_err(|e| CrsError::Transform(format!("EPSG:{}: {}", self.0, e)))
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// Point transformer between two CRSs. Geographic input and output are in
/// degrees; the radian conversion proj4rs expects happens here.
pub struct Reprojector {
    from: Proj,
    to: Proj,
    from_geographic: bool,
    to_geographic: bool,
}

impl Reprojector {
    pub fn new(from: Crs, to: Crs) -> Result<Self, CrsError> {
        Ok(Reprojector {
            from: from.to_proj()?,
            to: to.to_proj()?,
            from_geographic: from.is_geographic(),
            to_geographic: to.is_geographic(),
        })
    }

    pub fn transform_coord(&self, coord: Coord<f64>) -> Result<Coord<f64>, CrsError> {
        let mut point = if self.from_geographic {
            (coord.x.to_radians(), coord.y.to_radians(), 0.0)
        } else {
            (coord.x, coord.y, 0.0)
        };
        proj4rs::transform::transform(&self.from, &self.to, &mut point)
            .map_err(|e| CrsError::Transform(e.to_string()))?;
        let (x, y) = if self.to_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        if !x.is_finite() || !y.is_finite() {
            return Err(CrsError::Transform(format!(
                "non-finite result for ({}, {})",
                coord.x, coord.y
            )));
        }
        Ok(Coord { x, y })
    }

    pub fn transform(&self, geometry: &Geometry<f64>) -> Result<Geometry<f64>, CrsError> {
        geometry.try_map_coords(|coord| self.transform_coord(coord))
    }
}

/// Reproject `geometry` from `from` to `to`; a no-op clone when they match.
pub fn reproject(geometry: &Geometry<f64>, from: Crs, to: Crs) -> Result<Geometry<f64>, CrsError> {
    if from == to {
        return Ok(geometry.clone());
    }
    Reprojector::new(from, to)?.transform(geometry)
}

#[cfg(test)]
mod tests {
    use geo::{polygon, Intersects};

    use super::*;

    #[test]
    fn parses_every_srs_name_form() {
        for name in [
            "EPSG:25830",
            "urn:ogc:def:crs:EPSG::25830",
            "urn:ogc:def:crs:EPSG:6.6:25830",
            "http://www.opengis.net/def/crs/EPSG/0/25830",
            "http://www.opengis.net/gml/srs/epsg.xml#25830",
        ] {
            assert_eq!(Crs::from_srs_name(name).unwrap(), Crs::ETRS89_UTM30N, "{}", name);
        }
        assert!(Crs::from_srs_name("CRS:84").is_err());
        assert!(Crs::from_srs_name("EPSG:").is_err());
    }

    #[test]
    fn lat_lon_order_only_for_authority_geographic_names() {
        assert!(Crs::srs_name_is_lat_lon("urn:ogc:def:crs:EPSG::4258"));
        assert!(Crs::srs_name_is_lat_lon(
            "http://www.opengis.net/def/crs/EPSG/0/4326"
        ));
        assert!(!Crs::srs_name_is_lat_lon("EPSG:4326"));
        assert!(!Crs::srs_name_is_lat_lon("urn:ogc:def:crs:EPSG::25830"));
    }

    #[test]
    fn unknown_code_is_unsupported() {
        let err = Reprojector::new(Crs::epsg(99999), Crs::ETRS89).err().unwrap();
        assert!(matches!(err, CrsError::Unsupported(99999)));
    }

    #[test]
    fn same_crs_is_identity() {
        let g: Geometry<f64> = polygon![(x: 1.0, y: 1.0), (x: 2.0, y: 1.0), (x: 2.0, y: 2.0)].into();
        assert_eq!(reproject(&g, Crs::ETRS89, Crs::ETRS89).unwrap(), g);
    }

    #[test]
    fn utm30_roundtrip_near_madrid() {
        let to_geo = Reprojector::new(Crs::ETRS89_UTM30N, Crs::ETRS89).unwrap();
        let back = Reprojector::new(Crs::ETRS89, Crs::ETRS89_UTM30N).unwrap();
        let original = Coord {
            x: 440_291.0,
            y: 4_474_254.0,
        };
        let geographic = to_geo.transform_coord(original).unwrap();
        assert!((geographic.x - -3.7038).abs() < 0.01, "lon {}", geographic.x);
        assert!((geographic.y - 40.4168).abs() < 0.01, "lat {}", geographic.y);
        let projected = back.transform_coord(geographic).unwrap();
        assert!((projected.x - original.x).abs() < 0.01);
        assert!((projected.y - original.y).abs() < 0.01);
    }

    /// Testing after moving the parcel into the layer's CRS must agree with
    /// testing after moving the layer into the parcel's CRS.
    #[test]
    fn reprojecting_parcel_or_layer_gives_same_answer() {
        let parcel: Geometry<f64> = polygon![
            (x: 440_200.0, y: 4_474_200.0),
            (x: 440_300.0, y: 4_474_200.0),
            (x: 440_300.0, y: 4_474_300.0),
            (x: 440_200.0, y: 4_474_300.0),
        ]
        .into();
        let layers: Vec<Geometry<f64>> = vec![
            // contains the parcel
            polygon![(x: -3.8, y: 40.3), (x: -3.6, y: 40.3), (x: -3.6, y: 40.5), (x: -3.8, y: 40.5)]
                .into(),
            // far away (Seville)
            polygon![(x: -6.0, y: 37.3), (x: -5.9, y: 37.3), (x: -5.9, y: 37.4), (x: -6.0, y: 37.4)]
                .into(),
            // thin strip crossing the parcel's longitude
            polygon![(x: -3.7045, y: 40.0), (x: -3.7030, y: 40.0), (x: -3.7030, y: 41.0), (x: -3.7045, y: 41.0)]
                .into(),
        ];

        for layer in &layers {
            let parcel_in_layer = reproject(&parcel, Crs::ETRS89_UTM30N, Crs::ETRS89).unwrap();
            let layer_in_parcel = reproject(layer, Crs::ETRS89, Crs::ETRS89_UTM30N).unwrap();
            assert_eq!(
                parcel_in_layer.intersects(layer),
                parcel.intersects(&layer_in_parcel)
            );
        }

        let contained = reproject(&parcel, Crs::ETRS89_UTM30N, Crs::ETRS89).unwrap();
        assert!(contained.intersects(&layers[0]));
        assert!(!contained.intersects(&layers[1]));
    }
}
