//! Geometry primitives used by the collection store and geofence engine.
//!
//! This module wraps `geo_types`/`geo` for predicate evaluation and adds the
//! domain variants (`Circle`, `Feature`, `FeatureCollection`) that the wire
//! protocol exposes but `geo` has no opinion about.

pub mod geohash;

use geo::{Contains, Intersects};
use geo_types::{LineString as GeoLineString, Point as GeoPoint, Polygon as GeoPolygon};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Axis-aligned bounding rectangle in (lat, lon).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl Rect {
    pub const ZERO: Rect = Rect {
        min_lat: 0.0,
        min_lon: 0.0,
        max_lat: 0.0,
        max_lon: 0.0,
    };

    pub fn point(lat: f64, lon: f64) -> Self {
        Rect {
            min_lat: lat,
            min_lon: lon,
            max_lat: lat,
            max_lon: lon,
        }
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            min_lat: self.min_lat.min(other.min_lat),
            min_lon: self.min_lon.min(other.min_lon),
            max_lat: self.max_lat.max(other.max_lat),
            max_lon: self.max_lon.max(other.max_lon),
        }
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }
}

/// Tagged-variant geometry, matching the capability interface described for
/// polymorphism over geometries: every variant can produce a rect, a center,
/// a distance to another geometry, and within/intersects predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point {
        lat: f64,
        lon: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        z: Option<f64>,
    },
    Rect {
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    },
    Circle {
        lat: f64,
        lon: f64,
        meters: f64,
    },
    LineString(Vec<(f64, f64)>),
    Polygon {
        exterior: Vec<(f64, f64)>,
        #[serde(default)]
        holes: Vec<Vec<(f64, f64)>>,
    },
    MultiPoint(Vec<(f64, f64)>),
    MultiLineString(Vec<Vec<(f64, f64)>>),
    MultiPolygon(Vec<(Vec<(f64, f64)>, Vec<Vec<(f64, f64)>>)>),
    Feature {
        geometry: Box<Geometry>,
        properties: Json,
    },
    FeatureCollection(Vec<Geometry>),
}

/// Mean earth radius in meters, matching the value used across the geo
/// ecosystem for haversine great-circle distance.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

impl Geometry {
    pub fn point(lat: f64, lon: f64) -> Self {
        Geometry::Point { lat, lon, z: None }
    }

    /// Axis-aligned bounding rectangle.
    pub fn rect(&self) -> Rect {
        match self {
            Geometry::Point { lat, lon, .. } => Rect::point(*lat, *lon),
            Geometry::Rect {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => Rect {
                min_lat: *min_lat,
                min_lon: *min_lon,
                max_lat: *max_lat,
                max_lon: *max_lon,
            },
            Geometry::Circle { lat, lon, meters } => {
                // approximate: 1 degree latitude is ~111_320m; longitude shrinks with cos(lat)
                let dlat = meters / 111_320.0;
                let dlon = meters / (111_320.0 * lat.to_radians().cos().max(1e-9));
                Rect {
                    min_lat: lat - dlat,
                    min_lon: lon - dlon,
                    max_lat: lat + dlat,
                    max_lon: lon + dlon,
                }
            }
            Geometry::LineString(pts) | Geometry::MultiPoint(pts) => bounds_of(pts.iter().copied()),
            Geometry::Polygon { exterior, .. } => bounds_of(exterior.iter().copied()),
            Geometry::MultiLineString(lines) => {
                bounds_of(lines.iter().flat_map(|l| l.iter().copied()))
            }
            Geometry::MultiPolygon(polys) => {
                bounds_of(polys.iter().flat_map(|(ext, _)| ext.iter().copied()))
            }
            Geometry::Feature { geometry, .. } => geometry.rect(),
            Geometry::FeatureCollection(items) => items
                .iter()
                .map(|g| g.rect())
                .reduce(|a, b| a.union(&b))
                .unwrap_or(Rect::ZERO),
        }
    }

    /// Representative center point, used for nearby/roam distance and for
    /// the `POINT` output shape.
    pub fn center(&self) -> (f64, f64) {
        match self {
            Geometry::Point { lat, lon, .. } => (*lat, *lon),
            Geometry::Circle { lat, lon, .. } => (*lat, *lon),
            _ => self.rect().center(),
        }
    }

    /// Great-circle distance in meters between this geometry's center and
    /// another's.
    pub fn distance_meters(&self, other: &Geometry) -> f64 {
        let (lat1, lon1) = self.center();
        let (lat2, lon2) = other.center();
        haversine_meters(lat1, lon1, lat2, lon2)
    }

    /// `WITHIN`: true if `self` is entirely inside `other`.
    pub fn within(&self, other: &Geometry) -> bool {
        if let Geometry::Circle { lat, lon, meters } = other {
            return self.distance_meters(&Geometry::point(*lat, *lon)) <= *meters;
        }
        match (self.to_geo(), other.to_geo()) {
            (Some(a), Some(b)) => b.contains(&a),
            _ => other.rect().intersects(&self.rect()) && self.rect().union(&other.rect()) == other.rect(),
        }
    }

    /// `INTERSECTS`: true if `self` and `other` share any point.
    pub fn intersects(&self, other: &Geometry) -> bool {
        if let Geometry::Circle { lat, lon, meters } = self {
            return other.distance_meters(&Geometry::point(*lat, *lon)) <= *meters
                || self.rect().intersects(&other.rect());
        }
        if let Geometry::Circle { lat, lon, meters } = other {
            return self.distance_meters(&Geometry::point(*lat, *lon)) <= *meters
                || self.rect().intersects(&other.rect());
        }
        match (self.to_geo(), other.to_geo()) {
            (Some(a), Some(b)) => a.intersects(&b),
            _ => self.rect().intersects(&other.rect()),
        }
    }

    /// Best-effort conversion to a `geo_types` geometry for the variants
    /// `geo`'s predicates understand natively. `Circle`/`Feature`/
    /// `FeatureCollection` are handled above the conversion boundary.
    fn to_geo(&self) -> Option<geo_types::Geometry<f64>> {
        match self {
            Geometry::Point { lat, lon, .. } => {
                Some(geo_types::Geometry::Point(GeoPoint::new(*lon, *lat)))
            }
            Geometry::Rect {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => Some(geo_types::Geometry::Rect(geo_types::Rect::new(
                geo_types::coord! { x: *min_lon, y: *min_lat },
                geo_types::coord! { x: *max_lon, y: *max_lat },
            ))),
            Geometry::LineString(pts) => Some(geo_types::Geometry::LineString(to_linestring(pts))),
            Geometry::Polygon { exterior, holes } => {
                let ext = to_linestring(exterior);
                let holes = holes.iter().map(|h| to_linestring(h)).collect();
                Some(geo_types::Geometry::Polygon(GeoPolygon::new(ext, holes)))
            }
            Geometry::MultiPoint(pts) => Some(geo_types::Geometry::MultiPoint(
                geo_types::MultiPoint(pts.iter().map(|&(lat, lon)| GeoPoint::new(lon, lat)).collect()),
            )),
            Geometry::MultiLineString(lines) => Some(geo_types::Geometry::MultiLineString(
                geo_types::MultiLineString(lines.iter().map(|l| to_linestring(l)).collect()),
            )),
            Geometry::MultiPolygon(polys) => Some(geo_types::Geometry::MultiPolygon(
                geo_types::MultiPolygon(
                    polys
                        .iter()
                        .map(|(ext, holes)| {
                            GeoPolygon::new(
                                to_linestring(ext),
                                holes.iter().map(|h| to_linestring(h)).collect(),
                            )
                        })
                        .collect(),
                ),
            )),
            Geometry::Feature { geometry, .. } => geometry.to_geo(),
            Geometry::FeatureCollection(_) | Geometry::Circle { .. } => None,
        }
    }
}

fn to_linestring(pts: &[(f64, f64)]) -> GeoLineString<f64> {
    GeoLineString::from(
        pts.iter()
            .map(|&(lat, lon)| geo_types::coord! { x: lon, y: lat })
            .collect::<Vec<_>>(),
    )
}

fn bounds_of(pts: impl Iterator<Item = (f64, f64)>) -> Rect {
    let mut r: Option<Rect> = None;
    for (lat, lon) in pts {
        let p = Rect::point(lat, lon);
        r = Some(match r {
            Some(r) => r.union(&p),
            None => p,
        });
    }
    r.unwrap_or(Rect::ZERO)
}

/// Slippy-map tile bounds for `(x, y, z)` — the standard Web Mercator
/// tiling scheme behind the `TILE x y z` area form.
pub fn tile_bounds(x: u32, y: u32, z: u8) -> Rect {
    let n = 2f64.powi(z as i32);
    let lon_deg = |xt: f64| xt / n * 360.0 - 180.0;
    let lat_deg = |yt: f64| {
        let unit = std::f64::consts::PI * (1.0 - 2.0 * yt / n);
        unit.sinh().atan().to_degrees()
    };
    Rect {
        min_lat: lat_deg(y as f64 + 1.0),
        min_lon: lon_deg(x as f64),
        max_lat: lat_deg(y as f64),
        max_lon: lon_deg(x as f64 + 1.0),
    }
}

/// Decode a Bing/Microsoft quadkey into the `(x, y, z)` tile it names, for
/// the `QUADKEY k` area form.
pub fn quadkey_to_tile(key: &str) -> Option<(u32, u32, u8)> {
    if key.is_empty() || key.len() > 32 {
        return None;
    }
    let z = key.len() as u8;
    let (mut x, mut y) = (0u32, 0u32);
    for (i, c) in key.chars().enumerate() {
        let mask = 1u32 << (z as u32 - 1 - i as u32);
        match c {
            '0' => {}
            '1' => x |= mask,
            '2' => y |= mask,
            '3' => {
                x |= mask;
                y |= mask;
            }
            _ => return None,
        }
    }
    Some((x, y, z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_within_circle() {
        let p = Geometry::point(33.5, -112.1);
        let c = Geometry::Circle {
            lat: 33.5,
            lon: -112.1,
            meters: 100.0,
        };
        assert!(p.within(&c));
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Geometry::point(0.0, 0.0);
        let b = Geometry::point(1.0, 1.0);
        assert!((a.distance_meters(&b) - b.distance_meters(&a)).abs() < 1e-6);
    }

    #[test]
    fn polygon_contains_interior_point() {
        let square = Geometry::Polygon {
            exterior: vec![(0.0, 0.0), (0.0, 2.0), (2.0, 2.0), (2.0, 0.0), (0.0, 0.0)],
            holes: vec![],
        };
        let inside = Geometry::point(1.0, 1.0);
        assert!(inside.within(&square));
        let outside = Geometry::point(5.0, 5.0);
        assert!(!outside.within(&square));
    }
}
