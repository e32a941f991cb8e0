//! Pixel rectangle -> geographic rectangle.
//!
//! The reference raster is assumed to be axis aligned with its footprint:
//! vertex 0 of the footprint ring sits at the bottom-left of the image and
//! vertex 2 at the top-right. Pixel rows grow downwards while the latitude-like
//! axis grows upwards, hence the `h - y` terms below.

use crate::error::LocateError;
use crate::geometry::GeoPolygon;
use crate::matcher::MatchResult;
use rust_decimal::Decimal;

/// Half-open pixel rectangle inside the reference raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub top_left: (u32, u32),
    pub bottom_right: (u32, u32),
}

impl From<&MatchResult> for PixelRect {
    fn from(m: &MatchResult) -> Self {
        Self {
            top_left: m.top_left,
            bottom_right: m.bottom_right,
        }
    }
}

/// Interpolates `rect` onto the footprint of a `pixel_size` reference raster.
///
/// Returns a closed five-point ring: south-west, south-east, north-east,
/// north-west, south-west.
pub fn project(
    reference: &GeoPolygon,
    pixel_size: (u32, u32),
    rect: PixelRect,
) -> Result<GeoPolygon, LocateError> {
    let ring = reference.ring();
    if ring.len() < 3 || reference.distinct_vertices() < 3 {
        return Err(LocateError::Projection(format!(
            "reference footprint needs 3 distinct vertices, found {}",
            reference.distinct_vertices()
        )));
    }
    let (w, h) = pixel_size;
    if w == 0 || h == 0 {
        return Err(LocateError::Projection("reference raster has no pixels".into()));
    }

    let (c0, c2) = (ring[0], ring[2]);
    let w = Decimal::from(w);
    let h = Decimal::from(h);
    let (ax, ay) = (Decimal::from(rect.top_left.0), Decimal::from(rect.top_left.1));
    let (bx, by) = (Decimal::from(rect.bottom_right.0), Decimal::from(rect.bottom_right.1));

    let span_x = checked(c2.x.checked_sub(c0.x))?;
    let span_y = checked(c2.y.checked_sub(c0.y))?;

    let west = lerp(c0.x, span_x, ax, w)?;
    let east = lerp(c0.x, span_x, bx, w)?;
    let south = lerp(c0.y, span_y, checked(h.checked_sub(by))?, h)?;
    let north = lerp(c0.y, span_y, checked(h.checked_sub(ay))?, h)?;

    Ok(GeoPolygon::from_bounds(west, south, east, north))
}

/// `origin + span * offset / extent`, multiplying before dividing.
fn lerp(origin: Decimal, span: Decimal, offset: Decimal, extent: Decimal) -> Result<Decimal, LocateError> {
    let scaled = checked(span.checked_mul(offset))?;
    let step = checked(scaled.checked_div(extent))?;
    checked(origin.checked_add(step))
}

fn checked(value: Option<Decimal>) -> Result<Decimal, LocateError> {
    value.ok_or_else(|| LocateError::Projection("decimal overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeoPoint;

    fn square_100() -> GeoPolygon {
        let pts = [(0, 0), (0, 100), (100, 100), (100, 0), (0, 0)];
        GeoPolygon::new(
            pts.iter()
                .map(|&(x, y)| GeoPoint::new(Decimal::from(x), Decimal::from(y)))
                .collect(),
        )
    }

    fn rect(ax: u32, ay: u32, bx: u32, by: u32) -> PixelRect {
        PixelRect {
            top_left: (ax, ay),
            bottom_right: (bx, by),
        }
    }

    fn pairs(p: &GeoPolygon) -> Vec<[f64; 2]> {
        p.to_f64_pairs().unwrap()
    }

    #[test]
    fn center_half_maps_to_center_quarter() {
        let out = project(&square_100(), (1000, 1000), rect(250, 250, 750, 750)).unwrap();
        assert_eq!(
            pairs(&out),
            vec![[25.0, 25.0], [75.0, 25.0], [75.0, 75.0], [25.0, 75.0], [25.0, 25.0]]
        );
        assert!(out.is_closed());
    }

    #[test]
    fn pixel_rows_grow_southwards() {
        // Top strip of the image is the northern strip of the footprint.
        let out = project(&square_100(), (200, 100), rect(0, 0, 200, 10)).unwrap();
        assert_eq!(
            pairs(&out),
            vec![[0.0, 90.0], [100.0, 90.0], [100.0, 100.0], [0.0, 100.0], [0.0, 90.0]]
        );
    }

    #[test]
    fn translation_in_pixels_is_translation_in_degrees() {
        let reference = GeoPolygon::new(
            [(301, 598), (301, 601), (306, 601), (306, 598), (301, 598)]
                .iter()
                .map(|&(x, y)| GeoPoint::new(Decimal::new(x, 1), Decimal::new(y, 1)))
                .collect(),
        );
        let a = project(&reference, (500, 300), rect(100, 50, 200, 150)).unwrap();
        let b = project(&reference, (500, 300), rect(150, 80, 250, 180)).unwrap();

        // 50px east of 500px spanning 0.5 deg, 30px south of 300px spanning 0.3 deg.
        let dx = Decimal::new(5, 2);
        let dy = Decimal::new(3, 2);
        for (pa, pb) in a.ring().iter().zip(b.ring()) {
            assert_eq!(pb.x - pa.x, dx);
            assert_eq!(pa.y - pb.y, dy);
        }
    }

    #[test]
    fn scaling_in_pixels_scales_in_degrees() {
        let small = project(&square_100(), (1000, 1000), rect(100, 100, 200, 200)).unwrap();
        let large = project(&square_100(), (1000, 1000), rect(200, 200, 400, 400)).unwrap();
        let anchor = GeoPoint::new(Decimal::ZERO, Decimal::new(100, 0));
        for (s, l) in small.ring().iter().zip(large.ring()) {
            // Distances from the north-west image corner double.
            assert_eq!((l.x - anchor.x), (s.x - anchor.x) * Decimal::from(2));
            assert_eq!((anchor.y - l.y), (anchor.y - s.y) * Decimal::from(2));
        }
    }

    #[test]
    fn decimal_arithmetic_is_exact_for_thirds() {
        let out = project(&square_100(), (3, 3), rect(1, 1, 2, 2)).unwrap();
        let ring = out.ring();
        // 100 * 1 / 3 computed once per corner, no accumulated drift.
        assert_eq!(ring[0].x, Decimal::new(100, 0) / Decimal::new(3, 0));
        assert_eq!(ring[0], ring[4]);
    }

    #[test]
    fn degenerate_reference_is_rejected() {
        let p = GeoPoint::from_f64(1.0, 1.0).unwrap();
        let reference = GeoPolygon::new(vec![p, p, p, p]);
        assert!(matches!(
            project(&reference, (10, 10), rect(0, 0, 5, 5)),
            Err(LocateError::Projection(_))
        ));
        assert!(matches!(
            project(&square_100(), (0, 10), rect(0, 0, 5, 5)),
            Err(LocateError::Projection(_))
        ));
    }
}
