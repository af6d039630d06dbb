use std::cmp::Ordering;
use std::io::Cursor;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use byteorder::{BigEndian, ReadBytesExt};
use rmp::Marker;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::geometry::Geometry;

/// MessagePack extension code for geometry values.
const EXTENSION_G: i8 = b'G' as i8;

// -------------------------------------------------------------------------------------------------
// Value
// -------------------------------------------------------------------------------------------------
/// A primitive value as stored in a feature or legend blob.
///
/// The set of kinds mirrors what the canonical MessagePack encoding can carry:
/// nulls, booleans, integers, floats, text, raw bytes, homogeneous arrays, and
/// geometries (stored via an extension tag).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Only used for integers greater than `i64::MAX`.
    UInt(u64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Array(Vec<Value>),
    Geometry(Geometry),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Value::Geometry(g) => Some(g),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::UInt(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Blob(_) => 4,
            Value::Array(_) => 5,
            Value::Geometry(_) => 6,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Value::Int(v) => *v as f64,
            Value::UInt(v) => *v as f64,
            Value::Float(v) => *v,
            _ => unreachable!("as_f64 called on non-numeric value"),
        }
    }

    fn numeric_subrank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::UInt(_) => 1,
            Value::Float(_) => 2,
            _ => unreachable!("numeric_subrank called on non-numeric value"),
        }
    }
}

impl Eq for Value {}

// Deltas are ordered by key for stable output, so values need a total order.
// Numbers compare numerically across the integer/float kinds; everything else
// compares within its kind, with kinds ranked.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::UInt(a), Value::UInt(b)) => a.cmp(b),
            // Cross-kind numerics compare numerically, tie-broken by kind so
            // that the order never calls distinct values equal.
            (a, b) if a.type_rank() == 2 && b.type_rank() == 2 => a
                .as_f64()
                .total_cmp(&b.as_f64())
                .then_with(|| a.numeric_subrank().cmp(&b.numeric_subrank())),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Geometry(a), Value::Geometry(b)) => a.as_bytes().cmp(b.as_bytes()),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// -------------------------------------------------------------------------------------------------
// MessagePack encoding
// -------------------------------------------------------------------------------------------------
/// Encode a value as canonical MessagePack bytes.
///
/// The encoding is deterministic: integers use the smallest representation
/// that fits, floats are always 64-bit, strings and byte arrays use distinct
/// markers, and geometries use extension tag `b'G'`. Semantically equal inputs
/// produce byte-identical output on all platforms.
pub fn msg_pack(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    pack_into(&mut buf, value).expect("writing msgpack to a Vec cannot fail");
    buf
}

/// Encode a slice of values as a canonical MessagePack array.
/// This is the encoding used for primary-key tuples.
pub fn msg_pack_values(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    pack_array_into(&mut buf, values).expect("writing msgpack to a Vec cannot fail");
    buf
}

fn pack_array_into(buf: &mut Vec<u8>, values: &[Value]) -> std::result::Result<(), std::io::Error> {
    rmp::encode::write_array_len(buf, values.len() as u32).map_err(flatten_write_err)?;
    for v in values {
        pack_into(buf, v)?;
    }
    Ok(())
}

fn pack_into(buf: &mut Vec<u8>, value: &Value) -> std::result::Result<(), std::io::Error> {
    use rmp::encode;
    match value {
        Value::Null => {
            encode::write_nil(buf)?;
        }
        Value::Bool(v) => {
            encode::write_bool(buf, *v)?;
        }
        Value::Int(v) => {
            encode::write_sint(buf, *v).map_err(flatten_write_err)?;
        }
        Value::UInt(v) => {
            encode::write_uint(buf, *v).map_err(flatten_write_err)?;
        }
        Value::Float(v) => {
            encode::write_f64(buf, *v).map_err(flatten_write_err)?;
        }
        Value::Text(v) => {
            encode::write_str(buf, v).map_err(flatten_write_err)?;
        }
        Value::Blob(v) => {
            encode::write_bin(buf, v).map_err(flatten_write_err)?;
        }
        Value::Array(vs) => {
            pack_array_into(buf, vs)?;
        }
        Value::Geometry(g) => {
            let data = g.as_bytes();
            encode::write_ext_meta(buf, data.len() as u32, EXTENSION_G)
                .map_err(flatten_write_err)?;
            use std::io::Write;
            buf.write_all(data)?;
        }
    }
    Ok(())
}

fn flatten_write_err(e: rmp::encode::ValueWriteError) -> std::io::Error {
    match e {
        rmp::encode::ValueWriteError::InvalidMarkerWrite(e) => e,
        rmp::encode::ValueWriteError::InvalidDataWrite(e) => e,
    }
}

/// Decode a single MessagePack value.
pub fn msg_unpack(data: &[u8]) -> Result<Value> {
    let mut rd = Cursor::new(data);
    let value = unpack_from(&mut rd)?;
    Ok(value)
}

/// Decode a MessagePack value that must be an array, yielding its elements.
pub fn msg_unpack_array(data: &[u8]) -> Result<Vec<Value>> {
    match msg_unpack(data)? {
        Value::Array(vs) => Ok(vs),
        other => Err(Error::InvalidFileFormat(format!(
            "expected msgpack array, got {other:?}"
        ))),
    }
}

fn unpack_from(rd: &mut Cursor<&[u8]>) -> Result<Value> {
    let marker = rmp::decode::read_marker(rd)
        .map_err(|_| Error::InvalidFileFormat("truncated msgpack data".into()))?;
    let value = match marker {
        Marker::Null => Value::Null,
        Marker::True => Value::Bool(true),
        Marker::False => Value::Bool(false),
        Marker::FixPos(v) => Value::Int(v as i64),
        Marker::FixNeg(v) => Value::Int(v as i64),
        Marker::U8 => Value::Int(rd.read_u8()? as i64),
        Marker::U16 => Value::Int(rd.read_u16::<BigEndian>()? as i64),
        Marker::U32 => Value::Int(rd.read_u32::<BigEndian>()? as i64),
        Marker::U64 => {
            let v = rd.read_u64::<BigEndian>()?;
            match i64::try_from(v) {
                Ok(v) => Value::Int(v),
                Err(_) => Value::UInt(v),
            }
        }
        Marker::I8 => Value::Int(rd.read_i8()? as i64),
        Marker::I16 => Value::Int(rd.read_i16::<BigEndian>()? as i64),
        Marker::I32 => Value::Int(rd.read_i32::<BigEndian>()? as i64),
        Marker::I64 => Value::Int(rd.read_i64::<BigEndian>()?),
        Marker::F32 => Value::Float(rd.read_f32::<BigEndian>()? as f64),
        Marker::F64 => Value::Float(rd.read_f64::<BigEndian>()?),
        Marker::FixStr(len) => read_str(rd, len as usize)?,
        Marker::Str8 => {
            let len = rd.read_u8()? as usize;
            read_str(rd, len)?
        }
        Marker::Str16 => {
            let len = rd.read_u16::<BigEndian>()? as usize;
            read_str(rd, len)?
        }
        Marker::Str32 => {
            let len = rd.read_u32::<BigEndian>()? as usize;
            read_str(rd, len)?
        }
        Marker::Bin8 => {
            let len = rd.read_u8()? as usize;
            Value::Blob(read_bytes(rd, len)?)
        }
        Marker::Bin16 => {
            let len = rd.read_u16::<BigEndian>()? as usize;
            Value::Blob(read_bytes(rd, len)?)
        }
        Marker::Bin32 => {
            let len = rd.read_u32::<BigEndian>()? as usize;
            Value::Blob(read_bytes(rd, len)?)
        }
        Marker::FixArray(len) => read_array(rd, len as usize)?,
        Marker::Array16 => {
            let len = rd.read_u16::<BigEndian>()? as usize;
            read_array(rd, len)?
        }
        Marker::Array32 => {
            let len = rd.read_u32::<BigEndian>()? as usize;
            read_array(rd, len)?
        }
        Marker::FixExt1 => read_ext(rd, 1)?,
        Marker::FixExt2 => read_ext(rd, 2)?,
        Marker::FixExt4 => read_ext(rd, 4)?,
        Marker::FixExt8 => read_ext(rd, 8)?,
        Marker::FixExt16 => read_ext(rd, 16)?,
        Marker::Ext8 => {
            let len = rd.read_u8()? as usize;
            read_ext(rd, len)?
        }
        Marker::Ext16 => {
            let len = rd.read_u16::<BigEndian>()? as usize;
            read_ext(rd, len)?
        }
        Marker::Ext32 => {
            let len = rd.read_u32::<BigEndian>()? as usize;
            read_ext(rd, len)?
        }
        marker => {
            return Err(Error::InvalidFileFormat(format!(
                "unsupported msgpack marker: {marker:?}"
            )))
        }
    };
    Ok(value)
}

fn read_bytes(rd: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    use std::io::Read;
    let mut buf = vec![0u8; len];
    rd.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_str(rd: &mut Cursor<&[u8]>, len: usize) -> Result<Value> {
    let bytes = read_bytes(rd, len)?;
    let s = String::from_utf8(bytes)
        .map_err(|_| Error::InvalidFileFormat("invalid UTF-8 in msgpack string".into()))?;
    Ok(Value::Text(s))
}

fn read_array(rd: &mut Cursor<&[u8]>, len: usize) -> Result<Value> {
    let mut items = Vec::with_capacity(len.min(4096));
    for _ in 0..len {
        items.push(unpack_from(rd)?);
    }
    Ok(Value::Array(items))
}

fn read_ext(rd: &mut Cursor<&[u8]>, len: usize) -> Result<Value> {
    let ext_type = rd.read_i8()?;
    let data = read_bytes(rd, len)?;
    if ext_type == EXTENSION_G {
        Ok(Value::Geometry(Geometry::of(data)?))
    } else {
        tracing::warn!("unexpected msgpack extension: {ext_type}");
        Ok(Value::Blob(data))
    }
}

// -------------------------------------------------------------------------------------------------
// hashing helpers
// -------------------------------------------------------------------------------------------------
/// First 40 hex characters of the SHA-256 of the input. 160 bits, same length
/// as a Git id, but not the object-store hash.
pub fn hex_hash(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data)[..20])
}

/// First 20 bytes of the SHA-256 of the input, rendered as URL-safe base64.
pub fn b64_hash(data: &[u8]) -> String {
    URL_SAFE.encode(&Sha256::digest(data)[..20])
}

/// First 4 bytes of the SHA-256 of the input as a big-endian unsigned integer.
pub fn uint32_hash(data: &[u8]) -> u32 {
    let digest = Sha256::digest(data);
    u32::from_be_bytes(digest[..4].try_into().unwrap())
}

/// bytes -> URL-safe base64 text.
pub fn b64encode_str(data: &[u8]) -> String {
    URL_SAFE.encode(data)
}

/// URL-safe base64 text -> bytes.
pub fn b64decode_str(text: &str) -> Result<Vec<u8>> {
    URL_SAFE
        .decode(text)
        .map_err(|e| Error::InvalidFileFormat(format!("bad base64 {text:?}: {e}")))
}

// -------------------------------------------------------------------------------------------------
// test
// -------------------------------------------------------------------------------------------------
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn pack_pk_tuple() {
        // A single-element tuple of the integer 42: fixarray-1, positive fixint.
        let packed = msg_pack_values(&[Value::Int(42)]);
        assert_eq!(packed, vec![0x91, 0x2a]);
        assert_eq!(b64encode_str(&packed), "kSo=");
        assert_eq!(hex_hash(&packed), "b0aeef385533fa12987a563b267b66ff48f26d10");
        assert_eq!(b64_hash(&packed), "sK7vOFUz-hKYelY7Jntm_0jybRA=");
    }

    #[test]
    fn minimal_int_widths() {
        assert_eq!(msg_pack(&Value::Int(0)), vec![0x00]);
        assert_eq!(msg_pack(&Value::Int(127)), vec![0x7f]);
        assert_eq!(msg_pack(&Value::Int(128)), vec![0xcc, 0x80]);
        assert_eq!(msg_pack(&Value::Int(-1)), vec![0xff]);
        assert_eq!(msg_pack(&Value::Int(-33)), vec![0xd0, 0xdf]);
        assert_eq!(msg_pack(&Value::Int(65536)), vec![0xce, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn roundtrip_all_kinds() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-123456789),
            Value::UInt(u64::MAX),
            Value::Float(1.5),
            Value::Text("pōneke".to_string()),
            Value::Blob(vec![0, 1, 2, 255]),
            Value::Array(vec![Value::Int(1), Value::Text("two".to_string())]),
        ];
        for v in values {
            assert_eq!(msg_unpack(&msg_pack(&v)).unwrap(), v);
        }
    }

    #[test]
    fn geometry_ext() {
        let g = Geometry::of(b"GP\x00\x01\x00\x00\x00\x00\x01\x01\x00\x00\x00".to_vec()).unwrap();
        let packed = msg_pack(&Value::Geometry(g.clone()));
        // ext8 marker, length, type 'G'
        assert_eq!(packed[0], 0xc7);
        assert_eq!(packed[2] as u8, b'G');
        assert_eq!(msg_unpack(&packed).unwrap(), Value::Geometry(g));
    }

    #[test]
    fn value_ordering() {
        let mut values = vec![
            Value::Text("b".to_string()),
            Value::Int(10),
            Value::Null,
            Value::Int(2),
            Value::Text("a".to_string()),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Int(2),
                Value::Int(10),
                Value::Text("a".to_string()),
                Value::Text("b".to_string()),
            ]
        );
        assert_eq!(Value::Int(2).cmp(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(Value::UInt(u64::MAX).cmp(&Value::Int(-1)), Ordering::Greater);
    }
}
