use crate::error::LocateError;
use std::path::{Path, PathBuf};

/// Supported cities and the regional OSM extract each one is rendered from.
const CITIES: &[(&str, &str)] = &[
    ("St. Petersburg", "northwestern-fed-district-latest-free.shp"),
    ("Moscow", "central-fed-district-latest-free.shp"),
    ("Grozniy", "north-caucasus-fed-district-latest-free.shp"),
    ("Tokyo", "kanto-latest-free.shp"),
];

/// Color schemes understood by the poster renderer.
pub const COLOR_SCHEMES: &[&str] = &["black", "white", "coral", "black&red", "blood&milk"];

/// Static lookup of per-city assets under a files root:
///
/// ```text
/// <root>/img/<city>.png          reference raster
/// <root>/geojson/<city>.geojson  reference footprint
/// <root>/shp/<extract>.shp       base shapefile
/// ```
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cities(&self) -> impl Iterator<Item = &'static str> {
        CITIES.iter().map(|(name, _)| *name)
    }

    pub fn color_schemes(&self) -> &'static [&'static str] {
        COLOR_SCHEMES
    }

    pub fn is_color_scheme(&self, color: &str) -> bool {
        COLOR_SCHEMES.contains(&color)
    }

    fn city(&self, city: &str) -> Result<&'static (&'static str, &'static str), LocateError> {
        CITIES
            .iter()
            .find(|(name, _)| *name == city)
            .ok_or_else(|| LocateError::UnknownCity(city.to_string()))
    }

    pub fn reference_image_path(&self, city: &str) -> Result<PathBuf, LocateError> {
        let (name, _) = self.city(city)?;
        Ok(self.root.join("img").join(format!("{name}.png")))
    }

    /// Full, uncropped footprint for `city`. Shared by every request: never delete it.
    pub fn geometry_path(&self, city: &str) -> Result<PathBuf, LocateError> {
        let (name, _) = self.city(city)?;
        Ok(self.root.join("geojson").join(format!("{name}.geojson")))
    }

    pub fn shapefile_path(&self, city: &str) -> Result<PathBuf, LocateError> {
        let (_, shp) = self.city(city)?;
        Ok(self.root.join("shp").join(shp))
    }
}
