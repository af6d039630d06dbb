use std::f64::consts::PI;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};
use crate::serialise::uint32_hash;

/// WGS 84, the target CRS for all envelope indexing.
pub const EPSG_4326: &str = "EPSG:4326";

pub const EPSG_4326_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]]"#;

// Auto-generated identifiers for CRSs with no usable authority or name.
const MIN_CUSTOM_ID: u32 = 200_000;
const MAX_CUSTOM_ID: u32 = 209_199;
const CUSTOM_RANGE: u32 = MAX_CUSTOM_ID - MIN_CUSTOM_ID + 1;

lazy_static! {
    static ref ROOT_NAME: Regex =
        Regex::new(r#"(?i)^\s*[A-Z]*\s*[\[(]\s*"((?:""|[^"])*)""#).unwrap();
    static ref ROOT_AUTHORITY: Regex = Regex::new(
        r#"(?i)AUTHORITY\s*[\[(]\s*"((?:""|[^"])*)"\s*,\s*"((?:""|[^"])*)"\s*[\])]\s*[\])]\s*$"#
    )
    .unwrap();
    static ref AUTH_CODE: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*:[0-9]+$").unwrap();
}

// -------------------------------------------------------------------------------------------------
// WKT parsing helpers
// -------------------------------------------------------------------------------------------------
/// Normalise a WKT definition so that semantically-equal definitions hash
/// equally: all whitespace outside quoted strings is removed.
pub fn normalise_wkt(wkt: &str) -> String {
    let mut out = String::with_capacity(wkt.len());
    let mut in_quotes = false;
    for c in wkt.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        }
        if in_quotes || !c.is_whitespace() {
            out.push(c);
        }
    }
    out
}

/// The root name of a WKT definition, eg `NZGD2000 / New Zealand Transverse Mercator 2000`.
pub fn parse_name(wkt: &str) -> Option<String> {
    ROOT_NAME.captures(wkt).map(|c| c[1].to_string())
}

/// The root `AUTHORITY["name","code"]` of a WKT definition, if present.
/// The regex is preferred over a full parser since projection libraries are
/// opinionated and sometimes discard an authority they disagree with.
pub fn parse_authority(wkt: &str) -> Option<(String, String)> {
    ROOT_AUTHORITY
        .captures(wkt)
        .map(|c| (c[1].to_string(), c[2].to_string()))
}

fn find_identifier_str(crs: &str) -> Option<String> {
    if AUTH_CODE.is_match(crs.trim()) {
        // Already an identifier like "EPSG:2193" rather than a WKT definition.
        return Some(crs.trim().to_string());
    }
    if let Some((auth_name, auth_code)) = parse_authority(crs) {
        if !auth_name.is_empty() && !auth_code.is_empty() {
            return Some(format!("{auth_name}:{auth_code}"));
        }
        let code = if !auth_name.is_empty() { auth_name } else { auth_code };
        let code = code.trim();
        if !matches!(code, "" | "0" | "EPSG" | "ESRI") {
            return Some(code.to_string());
        }
    }
    parse_name(crs).map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

fn generate_identifier_int(crs: &str) -> u32 {
    let basis = find_identifier_str(crs).unwrap_or_else(|| normalise_wkt(crs));
    (uint32_hash(basis.as_bytes()) % CUSTOM_RANGE) + MIN_CUSTOM_ID
}

/// A stable, unique string identifier for the given CRS definition.
/// Eg `EPSG:2193`, or `CUSTOM:201234` for a CRS with no usable authority.
pub fn get_identifier_str(crs: &str) -> String {
    let result = find_identifier_str(crs)
        .unwrap_or_else(|| format!("CUSTOM:{}", generate_identifier_int(crs)));
    result.replace('/', "_")
}

/// A stable, unique integer identifier for the given CRS definition.
/// Eg 2193, or an auto-generated value in the custom range.
pub fn get_identifier_int(crs: &str) -> u32 {
    if let Some((_, auth_code)) = parse_authority(crs) {
        if let Ok(code) = auth_code.parse::<u32>() {
            if code > 0 {
                return code;
            }
        }
    }
    generate_identifier_int(crs)
}

/// The relative meta path for a CRS definition, eg `crs/EPSG:4326.wkt`.
pub fn meta_path(identifier: &str) -> String {
    format!("crs/{identifier}.wkt")
}

// -------------------------------------------------------------------------------------------------
// coordinate transforms
// -------------------------------------------------------------------------------------------------
/// A point transform between two coordinate reference systems.
///
/// The core deliberately does not link a projection engine; callers that need
/// arbitrary reprojection plug one in through [`TransformSource`]. The
/// built-in source covers the identity transform and spherical web-mercator.
pub trait CrsTransform: Send + Sync {
    fn transform_xy(&self, x: f64, y: f64) -> Result<(f64, f64)>;

    /// Short human-readable description, eg `EPSG:3857 -> EPSG:4326`.
    fn desc(&self) -> String;
}

/// Builds transforms between CRSs given as WKT definitions or `AUTH:CODE` strings.
pub trait TransformSource {
    /// Returns `None` when no transform between the two CRSs is available.
    fn transform(&self, src: &str, dst: &str) -> Result<Option<Arc<dyn CrsTransform>>>;
}

pub struct IdentityTransform {
    desc: String,
}

impl CrsTransform for IdentityTransform {
    fn transform_xy(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        Ok((x, y))
    }

    fn desc(&self) -> String {
        self.desc.clone()
    }
}

const EARTH_RADIUS: f64 = 6_378_137.0;

/// Spherical web-mercator (EPSG:3857) to and from WGS 84 longitude/latitude.
pub struct WebMercatorTransform {
    to_lonlat: bool,
}

impl CrsTransform for WebMercatorTransform {
    fn transform_xy(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        if self.to_lonlat {
            let lon = x / EARTH_RADIUS * 180.0 / PI;
            let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0) * 180.0 / PI;
            Ok((lon, lat))
        } else {
            let mx = EARTH_RADIUS * x.to_radians();
            let my = EARTH_RADIUS * (PI / 4.0 + y.to_radians() / 2.0).tan().ln();
            Ok((mx, my))
        }
    }

    fn desc(&self) -> String {
        if self.to_lonlat {
            "EPSG:3857 -> EPSG:4326".to_string()
        } else {
            "EPSG:4326 -> EPSG:3857".to_string()
        }
    }
}

/// The built-in transform source: identity when the identifiers match,
/// web-mercator to and from WGS 84, nothing else.
pub struct BuiltinTransforms;

impl TransformSource for BuiltinTransforms {
    fn transform(&self, src: &str, dst: &str) -> Result<Option<Arc<dyn CrsTransform>>> {
        let src_id = get_identifier_str(src);
        let dst_id = get_identifier_str(dst);
        if src_id == dst_id {
            return Ok(Some(Arc::new(IdentityTransform {
                desc: format!("IDENTITY({src_id})"),
            })));
        }
        match (src_id.as_str(), dst_id.as_str()) {
            ("EPSG:3857", "EPSG:4326") => {
                Ok(Some(Arc::new(WebMercatorTransform { to_lonlat: true })))
            }
            ("EPSG:4326", "EPSG:3857") => {
                Ok(Some(Arc::new(WebMercatorTransform { to_lonlat: false })))
            }
            _ => Ok(None),
        }
    }
}

/// Like [`TransformSource::transform`] but failing with `CrsError` rather than
/// returning `None` when no transform is available.
pub fn require_transform(
    source: &dyn TransformSource,
    src: &str,
    dst: &str,
) -> Result<Arc<dyn CrsTransform>> {
    source.transform(src, dst)?.ok_or_else(|| {
        Error::Crs(format!(
            "no transform available from {} to {}",
            get_identifier_str(src),
            get_identifier_str(dst)
        ))
    })
}

// -------------------------------------------------------------------------------------------------
// test
// -------------------------------------------------------------------------------------------------
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn identifier_from_wkt() {
        assert_eq!(get_identifier_str(EPSG_4326_WKT), "EPSG:4326");
        assert_eq!(get_identifier_int(EPSG_4326_WKT), 4326);
        assert_eq!(parse_name(EPSG_4326_WKT).unwrap(), "WGS 84");
    }

    #[test]
    fn identifier_from_auth_code() {
        assert_eq!(get_identifier_str("EPSG:2193"), "EPSG:2193");
    }

    #[test]
    fn custom_identifier_is_stable() {
        let wkt = r#"GEOGCS["nameless thing",DATUM["x",SPHEROID["y",1,2]]]"#;
        let id = get_identifier_str(wkt);
        assert_eq!(id, get_identifier_str(wkt));
        // Named CRSs use the name, so this one is not in the custom range.
        assert_eq!(id, "nameless thing");

        let anon = r#"GEOGCS["",DATUM["x",SPHEROID["y",1,2]]]"#;
        let n = get_identifier_int(anon);
        assert!((MIN_CUSTOM_ID..=MAX_CUSTOM_ID).contains(&n));
    }

    #[test]
    fn normalise_wkt_strips_whitespace() {
        assert_eq!(
            normalise_wkt("GEOGCS[ \"WGS 84\",\n  DATUM[\"X\"] ]"),
            "GEOGCS[\"WGS 84\",DATUM[\"X\"]]"
        );
    }

    #[test]
    fn web_mercator_roundtrip() {
        let fwd = BuiltinTransforms
            .transform("EPSG:4326", "EPSG:3857")
            .unwrap()
            .unwrap();
        let rev = BuiltinTransforms
            .transform("EPSG:3857", "EPSG:4326")
            .unwrap()
            .unwrap();
        let (mx, my) = fwd.transform_xy(174.78, -41.29).unwrap();
        let (lon, lat) = rev.transform_xy(mx, my).unwrap();
        assert!((lon - 174.78).abs() < 1e-9);
        assert!((lat - -41.29).abs() < 1e-9);
    }

    #[test]
    fn identity_when_identifiers_match() {
        let t = BuiltinTransforms
            .transform(EPSG_4326_WKT, "EPSG:4326")
            .unwrap()
            .unwrap();
        assert_eq!(t.transform_xy(1.5, 2.5).unwrap(), (1.5, 2.5));
        assert!(BuiltinTransforms.transform("EPSG:2193", "EPSG:4326").unwrap().is_none());
    }
}
