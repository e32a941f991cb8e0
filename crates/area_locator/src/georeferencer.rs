use crate::catalog::Catalog;
use crate::error::LocateError;
use crate::geometry::{write_polygon, GeoPolygon, GeometryDocument};
use crate::matcher::{MatchResult, MultiScaleMatcher};
use crate::projector::{project, PixelRect};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;

const OUTLINE: Rgb<u8> = Rgb([255, 0, 0]);
const OUTLINE_WIDTH: u32 = 2;

/// A city's reference raster together with its footprint document.
pub struct ReferenceImage {
    pub path: PathBuf,
    pub raster: RgbImage,
    pub geometry: GeometryDocument,
}

impl ReferenceImage {
    pub fn load(catalog: &Catalog, city: &str) -> Result<Self, LocateError> {
        let path = catalog.reference_image_path(city)?;
        let raster = image::open(&path)
            .map_err(|source| LocateError::UnreadableImage {
                what: path.display().to_string(),
                source,
            })?
            .to_rgb8();
        let geometry = GeometryDocument::open(&catalog.geometry_path(city)?)?;
        Ok(Self {
            path,
            raster,
            geometry,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.raster.dimensions()
    }

    pub fn footprint(&self) -> &GeoPolygon {
        self.geometry.polygon()
    }
}

/// Result of turning an area photo into a footprint.
#[derive(Debug, Clone)]
pub struct AreaSelection {
    /// Freshly written GeoJSON owned by the caller (delete it when done).
    pub geometry_path: PathBuf,
    pub polygon: GeoPolygon,
    pub matched: MatchResult,
    /// The reference raster with the matched rectangle outlined, PNG encoded.
    pub annotated_png: Vec<u8>,
}

/// Locates area photos against the catalog's reference maps.
pub struct Georeferencer {
    catalog: Catalog,
    matcher: MultiScaleMatcher,
    scratch_dir: PathBuf,
}

impl Georeferencer {
    pub fn new(catalog: Catalog, matcher: MultiScaleMatcher, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            matcher,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Finds `area_image` (any encoded raster) in `city`'s reference map and
    /// writes the matching footprint to a new file in the scratch directory.
    pub fn select_area(&self, city: &str, area_image: &[u8]) -> Result<AreaSelection, LocateError> {
        let started = Instant::now();
        let reference = ReferenceImage::load(&self.catalog, city)?;
        let query = image::load_from_memory(area_image).map_err(LocateError::InvalidPhoto)?;

        let reference_gray = DynamicImage::ImageRgb8(reference.raster.clone()).to_luma8();
        let matched = self.matcher.locate(&reference_gray, &query.to_luma8())?;
        tracing::info!(
            city,
            scale = matched.scale,
            score = matched.score,
            top_left = ?matched.top_left,
            bottom_right = ?matched.bottom_right,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Area located"
        );

        let annotated_png = annotate(&reference.raster, &matched)?;
        let polygon = project(reference.footprint(), reference.dimensions(), PixelRect::from(&matched))?;
        let geometry_path = write_polygon(&self.scratch_dir, &reference.geometry, &polygon)?;
        tracing::info!(
            city,
            path = %geometry_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Area geometry written"
        );

        Ok(AreaSelection {
            geometry_path,
            polygon,
            matched,
            annotated_png,
        })
    }
}

fn annotate(reference: &RgbImage, matched: &MatchResult) -> Result<Vec<u8>, LocateError> {
    let mut canvas = reference.clone();
    let (w, h) = canvas.dimensions();
    let (x0, y0) = matched.top_left;
    let (x1, y1) = (matched.bottom_right.0.min(w), matched.bottom_right.1.min(h));

    for y in y0..y1 {
        for x in x0..x1 {
            let on_edge = x < x0 + OUTLINE_WIDTH
                || x + OUTLINE_WIDTH >= x1
                || y < y0 + OUTLINE_WIDTH
                || y + OUTLINE_WIDTH >= y1;
            if on_edge {
                canvas.put_pixel(x, y, OUTLINE);
            }
        }
    }

    let mut png = Vec::new();
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|source| LocateError::UnreadableImage {
            what: "annotated preview".into(),
            source,
        })?;
    Ok(png)
}
