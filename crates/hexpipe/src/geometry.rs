use crate::cell::CellId;
use crate::error::GeometryError;
use serde::Serialize;

/// Axis-aligned bounds in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl BBox {
    fn around(ring: &[[f64; 2]]) -> Self {
        let mut bbox = BBox {
            min_lng: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lng: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for [lng, lat] in ring {
            bbox.min_lng = bbox.min_lng.min(*lng);
            bbox.min_lat = bbox.min_lat.min(*lat);
            bbox.max_lng = bbox.max_lng.max(*lng);
            bbox.max_lat = bbox.max_lat.max(*lat);
        }
        bbox
    }

    /// `[minLng, minLat, maxLng, maxLat]`, the GeoJSON member order.
    pub fn to_array(self) -> [f64; 4] {
        [self.min_lng, self.min_lat, self.max_lng, self.max_lat]
    }
}

/// A single closed ring of `[lng, lat]` vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub ring: Vec<[f64; 2]>,
    pub bbox: BBox,
}

/// Builds the closed boundary polygon of `cell`.
pub fn build_polygon(cell: CellId) -> Result<Polygon, GeometryError> {
    let boundary = cell.index().boundary();

    let mut ring: Vec<[f64; 2]> = boundary.iter().map(|ll| [ll.lng(), ll.lat()]).collect();
    let Some(&first) = ring.first() else {
        return Err(GeometryError::EmptyBoundary(cell.canonical()));
    };
    if ring.last() != Some(&first) {
        ring.push(first);
    }

    let bbox = BBox::around(&ring);
    Ok(Polygon { ring, bbox })
}
