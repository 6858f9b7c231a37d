//! Geographic Math
//!
//! Great-circle distance and play-area containment.
//! Pure functions over WGS84 degrees; no side effects.

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the Haversine formula (meters).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude on the Haversine sphere.
pub const METERS_PER_DEGREE_LAT: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// A latitude/longitude pair in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lng: f64,
}

impl GeoPoint {
    /// Create a point from degrees.
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Return the point displaced by the given meters north and east.
    ///
    /// Uses the local flat-earth approximation, accurate to well under
    /// a meter for the few-kilometer offsets a play area spans.
    pub fn offset_meters(self, north_m: f64, east_m: f64) -> Self {
        let dlat = north_m / METERS_PER_DEGREE_LAT;
        let dlng = east_m / (METERS_PER_DEGREE_LAT * self.lat.to_radians().cos());
        Self::new(self.lat + dlat, self.lng + dlng)
    }
}

/// Haversine great-circle distance between two points, in meters.
pub fn distance_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Axis-aligned latitude/longitude rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    /// Southern edge
    pub min_lat: f64,
    /// Western edge
    pub min_lng: f64,
    /// Northern edge
    pub max_lat: f64,
    /// Eastern edge
    pub max_lng: f64,
}

impl BoundingBox {
    /// Create a box from two opposite corners in any order.
    pub fn from_corners(a: GeoPoint, b: GeoPoint) -> Self {
        Self {
            min_lat: a.lat.min(b.lat),
            min_lng: a.lng.min(b.lng),
            max_lat: a.lat.max(b.lat),
            max_lng: a.lng.max(b.lng),
        }
    }

    /// Square box of the given half-extent centered on a point.
    pub fn around(center: GeoPoint, half_extent_m: f64) -> Self {
        Self::from_corners(
            center.offset_meters(-half_extent_m, -half_extent_m),
            center.offset_meters(half_extent_m, half_extent_m),
        )
    }

    /// Inclusive containment check.
    pub fn contains(&self, point: GeoPoint) -> bool {
        point.lat >= self.min_lat
            && point.lat <= self.max_lat
            && point.lng >= self.min_lng
            && point.lng <= self.max_lng
    }

    /// Center of the box.
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

/// Check whether a point lies inside an axis-aligned bounding box.
#[inline]
pub fn is_within_bounds(point: GeoPoint, bbox: &BoundingBox) -> bool {
    bbox.contains(point)
}

/// Closed polygon given by its vertices (first vertex is not repeated).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPolygon {
    /// Vertices in order
    pub vertices: Vec<GeoPoint>,
}

impl GeoPolygon {
    /// Create a polygon from vertices.
    pub fn new(vertices: Vec<GeoPoint>) -> Self {
        Self { vertices }
    }

    /// Even-odd ray casting containment. Degenerate polygons contain nothing.
    pub fn contains(&self, point: GeoPoint) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }

        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let vi = self.vertices[i];
            let vj = self.vertices[j];
            if (vi.lat > point.lat) != (vj.lat > point.lat) {
                let cross_lng =
                    vi.lng + (point.lat - vi.lat) * (vj.lng - vi.lng) / (vj.lat - vi.lat);
                if point.lng < cross_lng {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Smallest bounding box enclosing the polygon.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let first = *self.vertices.first()?;
        Some(self.vertices.iter().fold(
            BoundingBox::from_corners(first, first),
            |acc, v| BoundingBox {
                min_lat: acc.min_lat.min(v.lat),
                min_lng: acc.min_lng.min(v.lng),
                max_lat: acc.max_lat.max(v.lat),
                max_lng: acc.max_lng.max(v.lng),
            },
        ))
    }
}

/// Bounded play area, rectangular or polygonal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayArea {
    /// Axis-aligned rectangle
    Rect(BoundingBox),
    /// Arbitrary simple polygon
    Polygon(GeoPolygon),
}

impl PlayArea {
    /// Check whether a point lies inside the play area.
    pub fn contains(&self, point: GeoPoint) -> bool {
        match self {
            PlayArea::Rect(bbox) => bbox.contains(point),
            PlayArea::Polygon(poly) => poly.contains(point),
        }
    }

    /// Enclosing rectangle, used for sampling positions.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        match self {
            PlayArea::Rect(bbox) => Some(*bbox),
            PlayArea::Polygon(poly) => poly.bounding_box(),
        }
    }
}
