use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::intersects::Intersects;
use geo::algorithm::map_coords::MapCoords;
use tracing::warn;

use crate::crs::TransformSource;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::object_id::ObjectId;
use crate::object_store::ObjectStore;
use crate::repo_version::{config_keys, ConfigSource};
use crate::schema::Feature;
use crate::serialise::{hex_hash, Value};

// -------------------------------------------------------------------------------------------------
// match results
// -------------------------------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Matching,
    NonMatching,
    /// The feature being tested doesn't exist.
    Nonexistent,
    /// The feature exists but its blob is not present locally (partial clone).
    Promised,
}

// -------------------------------------------------------------------------------------------------
// spatial filter spec
// -------------------------------------------------------------------------------------------------
/// The user-provided definition of a spatial filter: a CRS and a geometry
/// (WKT or hex-WKB), either given literally or loaded from a blob checked
/// into the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialFilterSpec {
    pub crs: String,
    pub geometry: String,
    /// Set when the spec was loaded via an in-repo reference.
    pub reference: Option<String>,
    pub object_id: Option<String>,
}

/// A spatial filter blob holds the CRS and the geometry separated by a blank
/// line.
pub fn split_filter_blob(contents: &str) -> Result<(String, String)> {
    let (crs, geometry) = contents.split_once("\n\n").ok_or_else(|| {
        Error::NoSpatialFilter(
            "spatial filter file should contain the CRS, a blank line, then the geometry".into(),
        )
    })?;
    Ok((crs.trim().to_string(), geometry.trim().to_string()))
}

/// The spatial filter recorded in repository config, if any.
pub fn load_repo_config(
    config: &dyn ConfigSource,
    store: &dyn ObjectStore,
) -> Result<Option<SpatialFilterSpec>> {
    if let Some(geometry) = config.get_config(config_keys::SPATIALFILTER_GEOMETRY) {
        let crs = config.get_config(config_keys::SPATIALFILTER_CRS).ok_or_else(|| {
            Error::NoSpatialFilter("spatial filter CRS is missing from config".into())
        })?;
        return Ok(Some(SpatialFilterSpec {
            crs,
            geometry,
            reference: None,
            object_id: None,
        }));
    }

    if let Some(reference) = config.get_config(config_keys::SPATIALFILTER_REFERENCE) {
        let object_id = config
            .get_config(config_keys::SPATIALFILTER_OBJECTID)
            .ok_or_else(|| {
                Error::NoSpatialFilter("spatial filter object ID is missing from config".into())
            })?;
        let data = store.read_blob(&ObjectId::from_hex(&object_id)?)?;
        let contents = String::from_utf8(data)
            .map_err(|_| Error::NoSpatialFilter("spatial filter blob is not UTF-8".into()))?;
        let (crs, geometry) = split_filter_blob(&contents)?;
        return Ok(Some(SpatialFilterSpec {
            crs,
            geometry,
            reference: Some(reference),
            object_id: Some(object_id),
        }));
    }

    Ok(None)
}

// -------------------------------------------------------------------------------------------------
// SpatialFilter
// -------------------------------------------------------------------------------------------------
/// Decides whether a feature geometry does or does not match the user's
/// specified area.
///
/// A filter has a particular CRS and should only be applied to geometries in
/// that CRS - use [`SpatialFilter::transform_for_dataset`] to get a filter in
/// a dataset's CRS.
pub struct SpatialFilter {
    crs_spec: Option<String>,
    geometry: Option<geo_types::Geometry<f64>>,
    /// (min-x, max-x, min-y, max-y) of the filter geometry.
    envelope: Option<(f64, f64, f64, f64)>,
    /// Identifies the original filter spec, so a working copy can detect that
    /// a different filter has since been applied. `None` on derived filters.
    hex_hash: Option<String>,
}

impl SpatialFilter {
    /// The filter that matches everything.
    pub fn match_all() -> SpatialFilter {
        SpatialFilter {
            crs_spec: None,
            geometry: None,
            envelope: None,
            hex_hash: None,
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.geometry.is_none()
    }

    pub fn crs_spec(&self) -> Option<&str> {
        self.crs_spec.as_deref()
    }

    /// Identifies the filter spec this filter was built from.
    pub fn hex_hash(&self) -> Option<&str> {
        self.hex_hash.as_deref()
    }

    pub fn from_spec(spec: &SpatialFilterSpec) -> Result<SpatialFilter> {
        let gpkg = parse_filter_geometry(&spec.geometry)?;
        let wkb = gpkg.to_wkb()?;
        let geometry = gpkg.to_geo()?;
        match &geometry {
            geo_types::Geometry::Polygon(_) | geo_types::Geometry::MultiPolygon(_) => {}
            _ => {
                return Err(Error::InvalidOperation(
                    "spatial filter geometry must be a polygon or multipolygon".into(),
                ))
            }
        }
        let envelope = geometry.bounding_rect().ok_or_else(|| {
            Error::InvalidOperation("spatial filter geometry must not be empty".into())
        })?;

        let mut hasher_input = spec.crs.trim().as_bytes().to_vec();
        hasher_input.extend_from_slice(&wkb);

        Ok(SpatialFilter {
            crs_spec: Some(spec.crs.clone()),
            geometry: Some(geometry),
            envelope: Some((
                envelope.min().x,
                envelope.max().x,
                envelope.min().y,
                envelope.max().y,
            )),
            hex_hash: Some(hex_hash(&hasher_input)),
        })
    }

    /// The filter from repository config, or match-all if none is configured.
    pub fn from_repo_config(
        config: &dyn ConfigSource,
        store: &dyn ObjectStore,
    ) -> Result<SpatialFilter> {
        match load_repo_config(config, store)? {
            Some(spec) => Self::from_spec(&spec),
            None => Ok(Self::match_all()),
        }
    }

    /// Derive the per-dataset filter: the filter geometry transformed into
    /// the dataset's CRS. A dataset with no geometry column or no CRS - or a
    /// CRS we cannot transform into - gets the match-all filter, since
    /// filtering must never drop features we can't prove are outside the
    /// region.
    pub fn transform_for_dataset(
        &self,
        dataset: &Dataset,
        source: &dyn TransformSource,
    ) -> Result<SpatialFilter> {
        let (crs_spec, geometry) = match (&self.crs_spec, &self.geometry) {
            (Some(crs_spec), Some(geometry)) => (crs_spec, geometry),
            _ => return Ok(Self::match_all()),
        };

        let schema = dataset.schema()?;
        let geom_columns = schema.geometry_columns();
        let crs_name = match geom_columns.first().and_then(|c| c.geometry_crs.as_deref()) {
            Some(name) => name,
            None => return Ok(Self::match_all()),
        };
        let dataset_crs = match dataset.get_crs_definition(crs_name)? {
            Some(definition) => definition,
            None => return Ok(Self::match_all()),
        };

        let transform = match source.transform(crs_spec, &dataset_crs)? {
            Some(transform) => transform,
            None => {
                warn!(
                    "no transform from the spatial filter CRS to {crs_name} for dataset {}; \
                     not filtering this dataset",
                    dataset.path()
                );
                return Ok(Self::match_all());
            }
        };

        let transformed = geometry.try_map_coords(|coord| {
            let (x, y) = transform.transform_xy(coord.x, coord.y)?;
            Ok::<_, Error>(geo_types::Coord { x, y })
        })?;
        let envelope = transformed.bounding_rect().ok_or_else(|| {
            Error::Crs("spatial filter geometry became empty under transform".into())
        })?;

        Ok(SpatialFilter {
            crs_spec: Some(dataset_crs),
            geometry: Some(transformed),
            envelope: Some((
                envelope.min().x,
                envelope.max().x,
                envelope.min().y,
                envelope.max().y,
            )),
            hex_hash: None,
        })
    }

    /// Whether the given stored geometry matches the filter region.
    ///
    /// Geometry-free rows are never filtered out. If the geometry cannot be
    /// parsed the filter matches - user data is never dropped because of a
    /// parser bug.
    pub fn matches_geometry(&self, geometry: Option<&Geometry>) -> MatchResult {
        let (filter_geom, filter_env) = match (&self.geometry, &self.envelope) {
            (Some(g), Some(e)) => (g, e),
            _ => return MatchResult::Matching,
        };
        let geometry = match geometry {
            None => return MatchResult::Matching,
            Some(geometry) => geometry,
        };

        // Quick check - envelope intersects envelope?
        match geometry.envelope_2d_or_compute() {
            Ok(Some(feature_env)) => {
                if !bbox_intersects_fast(*filter_env, feature_env) {
                    return MatchResult::NonMatching;
                }
            }
            Ok(None) => {
                // Empty geometry; intersects nothing.
                return MatchResult::NonMatching;
            }
            Err(e) => {
                warn!("error reading geometry envelope while spatial filtering: {e}");
                return MatchResult::Matching;
            }
        }

        // Slow check - geometry intersects geometry?
        match geometry.to_geo() {
            Ok(feature_geom) => {
                if filter_geom.intersects(&feature_geom) {
                    MatchResult::Matching
                } else {
                    MatchResult::NonMatching
                }
            }
            Err(e) => {
                warn!("error applying spatial filter to geometry: {e}");
                MatchResult::Matching
            }
        }
    }

    /// Whether the given feature matches, looking up its geometry column by
    /// name.
    pub fn matches_feature(&self, feature: &Feature, geom_column: &str) -> MatchResult {
        match feature.get(geom_column) {
            Some(Value::Geometry(geometry)) => self.matches_geometry(Some(geometry)),
            _ => MatchResult::Matching,
        }
    }

    /// Whether the given feature (which may not exist) matches.
    pub fn matches(&self, feature: Option<&Feature>, geom_column: &str) -> MatchResult {
        match feature {
            None => MatchResult::Nonexistent,
            Some(feature) => self.matches_feature(feature, geom_column),
        }
    }
}

fn parse_filter_geometry(geometry_spec: &str) -> Result<Geometry> {
    let trimmed = geometry_spec.trim();
    let looks_like_hex =
        trimmed.len() >= 10 && trimmed.len() % 2 == 0 && trimmed.bytes().all(|b| b.is_ascii_hexdigit());
    if looks_like_hex {
        Geometry::from_hex_wkb(trimmed)
    } else {
        Geometry::from_wkt(trimmed)
    }
}

/// Envelope overlap test, both in (min-x, max-x, min-y, max-y) order.
fn bbox_intersects_fast(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> bool {
    a.0 <= b.1 && b.0 <= a.1 && a.2 <= b.3 && b.2 <= a.3
}
