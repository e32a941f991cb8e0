//! Area georeferencing for map posters.
//!
//! Given a city reference map (a raster plus a GeoJSON footprint) and an
//! arbitrary crop of that map supplied by a user, this crate:
//!
//! - finds the crop inside the reference raster at an unknown scale
//!   ([`MultiScaleMatcher`]),
//! - maps the matched pixel rectangle onto the reference footprint
//!   ([`project`]), using decimal arithmetic,
//! - writes the derived footprint back into a copy of the reference GeoJSON
//!   document ([`GeometryDocument`]).
//!
//! All of it is synchronous and CPU-bound; async callers are expected to run
//! [`Georeferencer::select_area`] on a dedicated thread pool.

pub mod catalog;
pub mod error;
pub mod geometry;
pub mod georeferencer;
pub mod matcher;
pub mod projector;

#[cfg(test)]
pub(crate) mod fixtures;

pub use catalog::{Catalog, COLOR_SCHEMES};
pub use error::LocateError;
pub use geometry::{read_polygon, write_polygon, GeoPoint, GeoPolygon, GeometryDocument};
pub use georeferencer::{AreaSelection, Georeferencer, ReferenceImage};
pub use matcher::{MatchResult, MatcherConfig, MultiScaleMatcher};
pub use projector::{project, PixelRect};
