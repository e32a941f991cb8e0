//! Reader/writer for the polygon footprint stored in a GeoJSON feature collection.
//!
//! Only `features[0].geometry.coordinates[0]` (the outer ring of the first
//! polygon) is interpreted. Everything else in the document, including
//! feature properties the renderer relies on, is carried through untouched
//! and in its original key order.

use crate::error::LocateError;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const RING_POINTER: &str = "/features/0/geometry/coordinates/0";

/// A coordinate pair in the axis order of the source file (lon-like, lat-like).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeoPoint {
    pub x: Decimal,
    pub y: Decimal,
}

impl GeoPoint {
    pub fn new(x: Decimal, y: Decimal) -> Self {
        Self { x, y }
    }

    /// Returns `None` for non-finite or out-of-range input.
    pub fn from_f64(x: f64, y: f64) -> Option<Self> {
        Some(Self {
            x: Decimal::from_f64(x)?,
            y: Decimal::from_f64(y)?,
        })
    }

    pub fn to_f64(self) -> Option<(f64, f64)> {
        Some((self.x.to_f64()?, self.y.to_f64()?))
    }
}

/// An ordered ring of coordinates. Derived footprints are always closed
/// five-point rectangles; reference footprints are taken as found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoPolygon {
    ring: Vec<GeoPoint>,
}

impl GeoPolygon {
    pub fn new(ring: Vec<GeoPoint>) -> Self {
        Self { ring }
    }

    /// Closed axis-aligned ring, counter-clockwise from the south-west corner.
    pub fn from_bounds(west: Decimal, south: Decimal, east: Decimal, north: Decimal) -> Self {
        let sw = GeoPoint::new(west, south);
        Self::new(vec![
            sw,
            GeoPoint::new(east, south),
            GeoPoint::new(east, north),
            GeoPoint::new(west, north),
            sw,
        ])
    }

    pub fn ring(&self) -> &[GeoPoint] {
        &self.ring
    }

    pub fn is_closed(&self) -> bool {
        self.ring.len() >= 2 && self.ring.first() == self.ring.last()
    }

    pub fn distinct_vertices(&self) -> usize {
        let mut seen: Vec<GeoPoint> = Vec::with_capacity(self.ring.len());
        for p in &self.ring {
            if !seen.contains(p) {
                seen.push(*p);
            }
        }
        seen.len()
    }

    /// Floating-point view of the ring, as it will appear once serialized.
    pub fn to_f64_pairs(&self) -> Option<Vec<[f64; 2]>> {
        self.ring
            .iter()
            .map(|p| p.to_f64().map(|(x, y)| [x, y]))
            .collect()
    }

    fn to_json(&self) -> Result<Value, LocateError> {
        let pairs = self
            .to_f64_pairs()
            .ok_or_else(|| LocateError::malformed("coordinate does not fit in an f64"))?;
        Ok(Value::Array(
            pairs
                .into_iter()
                .map(|[x, y]| Value::Array(vec![Value::from(x), Value::from(y)]))
                .collect(),
        ))
    }
}

/// A parsed GeoJSON document together with its validated first ring.
#[derive(Debug, Clone)]
pub struct GeometryDocument {
    root: Value,
    polygon: GeoPolygon,
}

impl GeometryDocument {
    pub fn open(path: &Path) -> Result<Self, LocateError> {
        let file = File::open(path).map_err(|e| LocateError::io(path, e))?;
        let root: Value = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            LocateError::malformed(format!("'{}' is not valid JSON: {e}", path.display()))
        })?;
        Self::from_value(root)
    }

    pub fn from_value(root: Value) -> Result<Self, LocateError> {
        let polygon = first_ring(&root)?;
        Ok(Self { root, polygon })
    }

    pub fn polygon(&self) -> &GeoPolygon {
        &self.polygon
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Copy of this document with the first ring replaced by `polygon`.
    pub fn with_polygon(&self, polygon: &GeoPolygon) -> Result<Self, LocateError> {
        let mut root = self.root.clone();
        let ring = root
            .pointer_mut(RING_POINTER)
            .ok_or_else(|| LocateError::malformed("document has no first ring to replace"))?;
        *ring = polygon.to_json()?;
        Ok(Self {
            root,
            polygon: polygon.clone(),
        })
    }

    /// Writes the document to a new, uniquely named file in `dir` and keeps it.
    pub fn write_temp(&self, dir: &Path) -> Result<PathBuf, LocateError> {
        let file = tempfile::Builder::new()
            .prefix("area_")
            .suffix(".geojson")
            .tempfile_in(dir)
            .map_err(|e| LocateError::io(dir, e))?;
        let path = file.path().to_path_buf();

        {
            let mut writer = BufWriter::new(file.as_file());
            serde_json::to_writer(&mut writer, &self.root)
                .map_err(|e| LocateError::io(&path, e.into()))?;
            writer.flush().map_err(|e| LocateError::io(&path, e))?;
        }

        file.keep().map_err(|e| LocateError::io(&path, e.error))?;
        Ok(path)
    }
}

/// Reads the first ring of the first feature of a GeoJSON file.
pub fn read_polygon(path: &Path) -> Result<GeoPolygon, LocateError> {
    Ok(GeometryDocument::open(path)?.polygon)
}

/// Writes `reference` with its first ring replaced by `ring` to a new file in `dir`.
pub fn write_polygon(
    dir: &Path,
    reference: &GeometryDocument,
    ring: &GeoPolygon,
) -> Result<PathBuf, LocateError> {
    reference.with_polygon(ring)?.write_temp(dir)
}

fn first_ring(root: &Value) -> Result<GeoPolygon, LocateError> {
    let features = root
        .get("features")
        .and_then(Value::as_array)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| LocateError::malformed("features not found"))?;
    if features.len() > 1 {
        tracing::warn!(features = features.len(), "Geometry has several features, using the first");
    }

    let feature = &features[0];
    let feature_type = feature.get("type").and_then(Value::as_str);
    if feature_type != Some("Feature") {
        return Err(LocateError::malformed(format!(
            "invalid feature type {feature_type:?}, expected \"Feature\""
        )));
    }

    let geometry = feature
        .get("geometry")
        .ok_or_else(|| LocateError::malformed("first feature has no geometry"))?;
    let geometry_type = geometry.get("type").and_then(Value::as_str);
    if geometry_type != Some("Polygon") {
        return Err(LocateError::malformed(format!(
            "invalid geometry type {geometry_type:?}, expected \"Polygon\""
        )));
    }

    let rings = geometry
        .get("coordinates")
        .and_then(Value::as_array)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| LocateError::malformed("coordinates not found"))?;
    if rings.len() > 1 {
        tracing::warn!(rings = rings.len(), "Polygon has several rings, using the first");
    }

    let ring = rings[0]
        .as_array()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| LocateError::malformed("first ring is empty"))?;

    let points = ring
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let pair = p.as_array().filter(|pair| pair.len() >= 2);
            pair.and_then(|pair| GeoPoint::from_f64(pair[0].as_f64()?, pair[1].as_f64()?))
                .ok_or_else(|| LocateError::malformed(format!("vertex {i} is not a coordinate pair")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let polygon = GeoPolygon::new(points);
    if !polygon.is_closed() {
        tracing::warn!("First ring is not closed");
    }
    Ok(polygon)
}
