use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use geozero::{CoordDimensions, GeomProcessor, GeozeroGeometry, ToGeo, ToWkb};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

// http://www.geopackage.org/spec/#gpb_format
const GPKG_LE_BIT: u8 = 0b1;
const GPKG_ENVELOPE_BITS: u8 = 0b1110;
const GPKG_EMPTY_BIT: u8 = 0b10000;
const GPKG_EXTENDED_BIT: u8 = 0b100000;

pub const GPKG_ENVELOPE_NONE: u8 = 0;
pub const GPKG_ENVELOPE_XY: u8 = 1;
pub const GPKG_ENVELOPE_XYZ: u8 = 2;
pub const GPKG_ENVELOPE_XYM: u8 = 3;
pub const GPKG_ENVELOPE_XYZM: u8 = 4;

/// WKB for `POINT(NaN NaN)`. WKB cannot represent an empty point any other way,
/// so the GPKG spec says to use this.
pub const WKB_POINT_EMPTY_LE: &[u8] = &[
    0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF8, 0x7F, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xF8, 0x7F,
];

// -------------------------------------------------------------------------------------------------
// Geometry
// -------------------------------------------------------------------------------------------------
/// A geometry in the stored format - StandardGeoPackageBinary.
///
/// Layout, all little-endian once normalised: magic "GP", version 0, flags,
/// 32-bit SRS id (zeroed at commit time), optional envelope of IEEE doubles,
/// then standard WKB.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Geometry(Vec<u8>);

impl std::fmt::Debug for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Geometry({})", hex::encode(&self.0))
    }
}

/// Parsed GeoPackage-binary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpkgHeader {
    pub is_le: bool,
    pub is_empty: bool,
    pub envelope_type: u8,
    pub srs_id: i32,
    pub wkb_offset: usize,
}

fn envelope_size(envelope_type: u8) -> Result<usize> {
    match envelope_type {
        GPKG_ENVELOPE_NONE => Ok(0),
        GPKG_ENVELOPE_XY => Ok(32),
        GPKG_ENVELOPE_XYZ | GPKG_ENVELOPE_XYM => Ok(48),
        GPKG_ENVELOPE_XYZM => Ok(64),
        other => Err(Error::InvalidFileFormat(format!(
            "invalid envelope contents indicator: {other}"
        ))),
    }
}

impl Geometry {
    /// Wrap stored GeoPackage-binary bytes. Only the magic is checked here;
    /// use [`Geometry::parse_header`] for full validation.
    pub fn of(bytes: Vec<u8>) -> Result<Geometry> {
        if bytes.len() < 8 || &bytes[0..2] != b"GP" {
            return Err(Error::InvalidFileFormat(format!(
                "invalid StandardGeoPackageBinary geometry: {}",
                hex::encode(&bytes[..bytes.len().min(100)])
            )));
        }
        Ok(Geometry(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn parse_header(&self) -> Result<GpkgHeader> {
        let b = &self.0;
        let version = b[2];
        if version != 0 {
            return Err(Error::InvalidFileFormat(format!(
                "expected GeoPackage v1 geometry, got version {version}"
            )));
        }
        let flags = b[3];
        if flags & GPKG_EXTENDED_BIT != 0 {
            return Err(Error::NotYetImplemented(
                "ExtendedGeoPackageBinary geometries are not supported".into(),
            ));
        }
        let is_le = flags & GPKG_LE_BIT != 0;
        let envelope_type = (flags & GPKG_ENVELOPE_BITS) >> 1;
        let wkb_offset = 8 + envelope_size(envelope_type)?;
        if b.len() < wkb_offset {
            return Err(Error::InvalidFileFormat(
                "GeoPackage geometry truncated before WKB".into(),
            ));
        }
        let srs_id = if is_le {
            LittleEndian::read_i32(&b[4..8])
        } else {
            byteorder::BigEndian::read_i32(&b[4..8])
        };
        Ok(GpkgHeader {
            is_le,
            is_empty: flags & GPKG_EMPTY_BIT != 0,
            envelope_type,
            srs_id,
            wkb_offset,
        })
    }

    /// The SRS id embedded in the header. Stored geometries have this zeroed
    /// at commit time.
    pub fn srs_id(&self) -> Result<i32> {
        Ok(self.parse_header()?.srs_id)
    }

    pub fn with_srs_id(&self, srs_id: i32) -> Geometry {
        let mut bytes = self.0.clone();
        LittleEndian::write_i32(&mut bytes[4..8], srs_id);
        Geometry(bytes)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.parse_header()?.is_empty)
    }

    /// The raw WKB part of this geometry, whatever its byte order.
    pub fn wkb_slice(&self) -> Result<&[u8]> {
        let header = self.parse_header()?;
        Ok(&self.0[header.wkb_offset..])
    }

    /// Little-endian ISO WKB for this geometry. Big-endian stored WKB is
    /// transcoded on the way out.
    pub fn to_wkb(&self) -> Result<Vec<u8>> {
        let wkb = self.wkb_slice()?;
        let info = wkb_info(wkb)?;
        if info.is_le {
            Ok(wkb.to_vec())
        } else {
            transcode_wkb_le(wkb, info.has_z)
        }
    }

    /// Uppercase hex-encoded little-endian WKB, as used in patch documents.
    pub fn to_hex_wkb(&self) -> Result<String> {
        Ok(hex::encode_upper(self.to_wkb()?))
    }

    pub fn to_geo(&self) -> Result<geo_types::Geometry<f64>> {
        geozero::wkb::Wkb(self.wkb_slice()?.to_vec())
            .to_geo()
            .map_err(|e| Error::Geometry(format!("failed to parse WKB: {e}")))
    }

    /// Build a normalised geometry from WKB bytes.
    pub fn from_wkb(wkb: &[u8]) -> Result<Geometry> {
        build_normalised(wkb)
    }

    pub fn from_hex_wkb(hex_wkb: &str) -> Result<Geometry> {
        let wkb = hex::decode(hex_wkb)
            .map_err(|e| Error::Geometry(format!("bad hex WKB {hex_wkb:?}: {e}")))?;
        Self::from_wkb(&wkb)
    }

    pub fn from_wkt(wkt: &str) -> Result<Geometry> {
        lazy_static! {
            static ref EMPTY_POINT: Regex = Regex::new(r"(?i)^\s*POINT\s*(Z\s*)?EMPTY\s*$").unwrap();
            static ref HAS_Z: Regex = Regex::new(
                r"(?i)\b(POINT|LINESTRING|POLYGON|MULTIPOINT|MULTILINESTRING|MULTIPOLYGON|GEOMETRYCOLLECTION)\s*Z\b"
            )
            .unwrap();
        }
        if EMPTY_POINT.is_match(wkt) {
            return Self::from_wkb(WKB_POINT_EMPTY_LE);
        }
        let dims = if HAS_Z.is_match(wkt) {
            CoordDimensions::xyz()
        } else {
            CoordDimensions::xy()
        };
        let wkb = geozero::wkt::WktStr(wkt)
            .to_wkb(dims)
            .map_err(|e| Error::Geometry(format!("failed to parse WKT: {e}")))?;
        Self::from_wkb(&wkb)
    }

    /// The stored 2D envelope as (min-x, max-x, min-y, max-y), if the header
    /// carries one. `None` for empty geometries or geometries without one.
    pub fn envelope_2d(&self) -> Result<Option<(f64, f64, f64, f64)>> {
        let header = self.parse_header()?;
        if header.is_empty {
            return Ok(None);
        }
        if header.envelope_type == GPKG_ENVELOPE_NONE {
            return Ok(None);
        }
        let read = |i: usize| -> f64 {
            let off = 8 + i * 8;
            if header.is_le {
                LittleEndian::read_f64(&self.0[off..off + 8])
            } else {
                byteorder::BigEndian::read_f64(&self.0[off..off + 8])
            }
        };
        let env = (read(0), read(1), read(2), read(3));
        if env.0.is_nan() || env.1.is_nan() || env.2.is_nan() || env.3.is_nan() {
            return Ok(None);
        }
        Ok(Some(env))
    }

    /// Like [`Geometry::envelope_2d`], but scans the WKB coordinates when the
    /// header carries no envelope.
    pub fn envelope_2d_or_compute(&self) -> Result<Option<(f64, f64, f64, f64)>> {
        if let Some(env) = self.envelope_2d()? {
            return Ok(Some(env));
        }
        let extent = scan_wkb(self.wkb_slice()?)?;
        if extent.finite_coords == 0 {
            return Ok(None);
        }
        Ok(Some((extent.minx, extent.maxx, extent.miny, extent.maxy)))
    }
}

// -------------------------------------------------------------------------------------------------
// WKB inspection
// -------------------------------------------------------------------------------------------------
struct WkbInfo {
    is_le: bool,
    flat_type: u32,
    has_z: bool,
}

fn wkb_info(wkb: &[u8]) -> Result<WkbInfo> {
    if wkb.len() < 5 {
        return Err(Error::InvalidFileFormat("WKB truncated".into()));
    }
    let is_le = match wkb[0] {
        0 => false,
        1 => true,
        other => {
            return Err(Error::InvalidFileFormat(format!(
                "invalid WKB byte-order marker: {other}"
            )))
        }
    };
    let raw = if is_le {
        LittleEndian::read_u32(&wkb[1..5])
    } else {
        byteorder::BigEndian::read_u32(&wkb[1..5])
    };
    let t16 = raw & 0xFFFF;
    let iso_zm = t16 / 1000;
    let has_z = iso_zm == 1 || iso_zm == 3 || raw & 0x8000_0000 != 0;
    Ok(WkbInfo {
        is_le,
        flat_type: t16 % 1000,
        has_z,
    })
}

const WKB_POINT: u32 = 1;

fn transcode_wkb_le(wkb: &[u8], has_z: bool) -> Result<Vec<u8>> {
    let dims = if has_z {
        CoordDimensions::xyz()
    } else {
        CoordDimensions::xy()
    };
    geozero::wkb::Wkb(wkb.to_vec())
        .to_wkb(dims)
        .map_err(|e| Error::Geometry(format!("failed to transcode WKB: {e}")))
}

// -------------------------------------------------------------------------------------------------
// coordinate extent scan
// -------------------------------------------------------------------------------------------------
/// Gathers the coordinate extent of a geometry without materialising it.
#[derive(Debug)]
struct Extent {
    minx: f64,
    miny: f64,
    maxx: f64,
    maxy: f64,
    minz: f64,
    maxz: f64,
    finite_coords: usize,
    has_z: bool,
}

impl Default for Extent {
    fn default() -> Self {
        Extent {
            minx: f64::INFINITY,
            miny: f64::INFINITY,
            maxx: f64::NEG_INFINITY,
            maxy: f64::NEG_INFINITY,
            minz: f64::INFINITY,
            maxz: f64::NEG_INFINITY,
            finite_coords: 0,
            has_z: false,
        }
    }
}

impl Extent {
    fn add(&mut self, x: f64, y: f64, z: Option<f64>) {
        if x.is_finite() && y.is_finite() {
            self.finite_coords += 1;
            self.minx = self.minx.min(x);
            self.maxx = self.maxx.max(x);
            self.miny = self.miny.min(y);
            self.maxy = self.maxy.max(y);
        }
        if let Some(z) = z {
            self.has_z = true;
            if z.is_finite() {
                self.minz = self.minz.min(z);
                self.maxz = self.maxz.max(z);
            }
        }
    }
}

impl GeomProcessor for Extent {
    fn dimensions(&self) -> CoordDimensions {
        CoordDimensions::xyzm()
    }

    fn multi_dim(&self) -> bool {
        true
    }

    fn xy(&mut self, x: f64, y: f64, _idx: usize) -> geozero::error::Result<()> {
        self.add(x, y, None);
        Ok(())
    }

    fn coordinate(
        &mut self,
        x: f64,
        y: f64,
        z: Option<f64>,
        _m: Option<f64>,
        _t: Option<f64>,
        _tm: Option<u64>,
        _idx: usize,
    ) -> geozero::error::Result<()> {
        self.add(x, y, z);
        Ok(())
    }
}

fn scan_wkb(wkb: &[u8]) -> Result<Extent> {
    let mut extent = Extent::default();
    geozero::wkb::Wkb(wkb.to_vec())
        .process_geom(&mut extent)
        .map_err(|e| Error::Geometry(format!("failed to scan WKB: {e}")))?;
    Ok(extent)
}

// -------------------------------------------------------------------------------------------------
// normalisation
// -------------------------------------------------------------------------------------------------
/// The envelope type a normalised geometry should carry.
///
/// Points never get envelopes (an envelope doubles their size and any
/// consumer can trivially read the point itself). Empty geometries never get
/// envelopes. XY and XYM geometries get XY envelopes; XYZ and XYZM get XYZ.
fn desired_envelope_type(is_empty: bool, flat_type: u32, has_z: bool) -> u8 {
    if is_empty || flat_type == WKB_POINT {
        GPKG_ENVELOPE_NONE
    } else if has_z {
        GPKG_ENVELOPE_XYZ
    } else {
        GPKG_ENVELOPE_XY
    }
}

/// Checks whether the given geometry is little-endian throughout, has the
/// envelope it should have, and has a zeroed srs_id. If so it is returned
/// unmodified; otherwise a rewritten little-endian geometry with the right
/// envelope and srs_id=0 is built.
pub fn normalise(gpkg: &Geometry) -> Result<Geometry> {
    let header = gpkg.parse_header()?;
    if header.is_le {
        let wkb = &gpkg.as_bytes()[header.wkb_offset..];
        let info = wkb_info(wkb)?;
        let want = desired_envelope_type(header.is_empty, info.flat_type, info.has_z);
        if info.is_le && header.envelope_type == want {
            if header.srs_id == 0 {
                return Ok(gpkg.clone());
            }
            return Ok(gpkg.with_srs_id(0));
        }
    }
    build_normalised(gpkg.wkb_slice()?)
}

/// Builds a normalised GeoPackage geometry around the given WKB:
/// little-endian, srs_id 0, envelope per policy.
fn build_normalised(wkb: &[u8]) -> Result<Geometry> {
    let info = wkb_info(wkb)?;
    let wkb = if info.is_le {
        wkb.to_vec()
    } else {
        transcode_wkb_le(wkb, info.has_z)?
    };
    let extent = scan_wkb(&wkb)?;
    let is_empty = extent.finite_coords == 0;
    let envelope_type = desired_envelope_type(is_empty, info.flat_type, info.has_z);

    let mut flags = GPKG_LE_BIT;
    if is_empty {
        flags |= GPKG_EMPTY_BIT;
    }
    flags |= envelope_type << 1;

    let mut out = Vec::with_capacity(8 + envelope_size(envelope_type)? + wkb.len());
    out.extend_from_slice(b"GP");
    out.push(0); // version
    out.push(flags);
    out.write_i32::<LittleEndian>(0).unwrap(); // srs_id, zeroed for storage
    if envelope_type != GPKG_ENVELOPE_NONE {
        out.write_f64::<LittleEndian>(extent.minx).unwrap();
        out.write_f64::<LittleEndian>(extent.maxx).unwrap();
        out.write_f64::<LittleEndian>(extent.miny).unwrap();
        out.write_f64::<LittleEndian>(extent.maxy).unwrap();
        if envelope_type == GPKG_ENVELOPE_XYZ {
            out.write_f64::<LittleEndian>(extent.minz).unwrap();
            out.write_f64::<LittleEndian>(extent.maxz).unwrap();
        }
    }
    out.extend_from_slice(&wkb);
    Geometry::of(out)
}

// -------------------------------------------------------------------------------------------------
// test
// -------------------------------------------------------------------------------------------------
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    fn point_wkb(x: f64, y: f64) -> Vec<u8> {
        let mut wkb = vec![0x01];
        wkb.write_u32::<LittleEndian>(1).unwrap();
        wkb.write_f64::<LittleEndian>(x).unwrap();
        wkb.write_f64::<LittleEndian>(y).unwrap();
        wkb
    }

    #[test]
    fn point_gets_no_envelope() {
        let g = Geometry::from_wkb(&point_wkb(1.0, 2.0)).unwrap();
        // GP, v0, flags = LE only, srs 0
        assert_eq!(&g.as_bytes()[..8], &[0x47, 0x50, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        let header = g.parse_header().unwrap();
        assert_eq!(header.envelope_type, GPKG_ENVELOPE_NONE);
        assert!(!header.is_empty);
        assert_eq!(g.to_wkb().unwrap(), point_wkb(1.0, 2.0));
    }

    #[test]
    fn polygon_gets_xy_envelope() {
        let g =
            Geometry::from_wkt("POLYGON((0 0, 4 0, 4 3, 0 3, 0 0))").unwrap();
        let header = g.parse_header().unwrap();
        assert!(header.is_le);
        assert_eq!(header.envelope_type, GPKG_ENVELOPE_XY);
        assert_eq!(header.srs_id, 0);
        assert_eq!(g.envelope_2d().unwrap(), Some((0.0, 4.0, 0.0, 3.0)));
    }

    #[test]
    fn empty_point() {
        let g = Geometry::from_wkt("POINT EMPTY").unwrap();
        let header = g.parse_header().unwrap();
        assert!(header.is_empty);
        assert_eq!(header.envelope_type, GPKG_ENVELOPE_NONE);
        assert_eq!(g.envelope_2d_or_compute().unwrap(), None);
    }

    #[test]
    fn normalise_zeroes_srs_id() {
        let g = Geometry::from_wkb(&point_wkb(1.0, 2.0)).unwrap().with_srs_id(4326);
        assert_eq!(g.srs_id().unwrap(), 4326);
        let n = normalise(&g).unwrap();
        assert_eq!(n.srs_id().unwrap(), 0);
        assert_eq!(n.to_wkb().unwrap(), g.to_wkb().unwrap());
    }

    #[test]
    fn normalise_is_idempotent() {
        let g = Geometry::from_wkt("LINESTRING(0 0, 10 10)").unwrap();
        let n = normalise(&g).unwrap();
        assert_eq!(n.as_bytes(), g.as_bytes());
    }

    #[test]
    fn hex_wkb_roundtrip() {
        let g = Geometry::from_wkt("POINT(170.5 -43.2)").unwrap();
        let hex_wkb = g.to_hex_wkb().unwrap();
        let g2 = Geometry::from_hex_wkb(&hex_wkb).unwrap();
        assert_eq!(g.as_bytes(), g2.as_bytes());
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(Geometry::of(b"XX\x00\x01\x00\x00\x00\x00".to_vec()).is_err());
    }
}
