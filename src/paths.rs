use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object_store::{EntryKind, ObjectStore, Tree};
use crate::schema::{DataType, Schema};
use crate::serialise::{b64_hash, b64decode_str, b64encode_str, hex_hash, msg_pack_values, msg_unpack_array, Value};

pub const PATH_STRUCTURE_ITEM: &str = "path-structure.json";

const LOWERCASE_HEX_ALPHABET: &str = "0123456789abcdef";

// https://datatracker.ietf.org/doc/html/rfc3548.html#section-4
const BASE64_URLSAFE_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

// -------------------------------------------------------------------------------------------------
// FixedLengthIntEncoder
// -------------------------------------------------------------------------------------------------
/// Encodes an integer into a fixed length string using a supplied alphabet.
/// As a trivial example, the alphabet could be "01" (base-2) and the length 3:
/// 0="000", 1="001", 2="010", up to 7="111". For inputs of 8 or greater (or
/// less than 0) the outputs simply repeat.
///
/// This is what spreads PKs into a tree structure in a predictable and compact
/// way.
struct FixedLengthIntEncoder {
    alphabet: Vec<char>,
    length: usize,
    separator: Option<char>,
    group_length: usize,
}

impl FixedLengthIntEncoder {
    fn new(alphabet: &str, length: usize, separator: Option<char>, group_length: usize) -> Self {
        let alphabet: Vec<char> = alphabet.chars().collect();
        // Separator chars must be distinct from alphabet chars.
        debug_assert!(separator.map_or(true, |s| !alphabet.contains(&s)));
        FixedLengthIntEncoder {
            alphabet,
            length,
            separator,
            group_length,
        }
    }

    fn base(&self) -> i64 {
        self.alphabet.len() as i64
    }

    fn encode_int(&self, integer: i64) -> String {
        let base = self.base();
        let mut n = integer;
        let mut digits = Vec::with_capacity(self.length);
        for _ in 0..self.length {
            let remainder = n.rem_euclid(base);
            n = n.div_euclid(base);
            digits.push(self.alphabet[remainder as usize]);
        }
        digits.reverse();

        let mut out = String::with_capacity(self.length + self.length / self.group_length);
        for (i, c) in digits.into_iter().enumerate() {
            if i > 0 && i % self.group_length == 0 {
                if let Some(sep) = self.separator {
                    out.push(sep);
                }
            }
            out.push(c);
        }
        out
    }

    /// Inverse of `encode_int`. Skips characters it doesn't recognise and
    /// always returns the smallest possible non-negative answer.
    fn decode_int(&self, string: &str) -> i64 {
        let mut result = 0i64;
        let mut coefficient = 1i64;
        for c in string.chars().rev() {
            if let Some(value) = self.alphabet.iter().position(|a| *a == c) {
                result += coefficient * value as i64;
                coefficient *= self.base();
            }
        }
        result
    }
}

// -------------------------------------------------------------------------------------------------
// PathEncoder
// -------------------------------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathScheme {
    /// Msgpack and hash the pk values, then distribute evenly by hash chars.
    #[serde(rename = "msgpack/hash")]
    MsgpackHash,
    /// Modulus of the branch factor. Single-integer pks only; neighbouring pks
    /// land in neighbouring trees, which packs far better on bulk inserts.
    #[serde(rename = "int")]
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathEncoding {
    Hex,
    Base64,
}

/// A system for transforming a primary key to a path (and back again).
///
/// The path structure attempts to spread features so every tree has a
/// relatively small number of children, so neighbouring pks tend to be
/// neighbours in trees, and so small datasets have few trees: a few levels of
/// trees with a low branch factor can still branch out into millions of
/// features.
///
/// Which encoder a dataset uses is recorded in `meta/path-structure.json`;
/// absence of that item means the dataset predates it and uses the legacy
/// 2-level 256-branch hex structure. The encoder is fixed for a dataset's
/// lifetime - changing it would require rewriting every feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEncoder {
    pub scheme: PathScheme,
    pub branches: usize,
    pub levels: usize,
    pub encoding: PathEncoding,
}

impl PathEncoder {
    /// The encoder previously used for all datasets.
    pub fn legacy() -> PathEncoder {
        PathEncoder {
            scheme: PathScheme::MsgpackHash,
            branches: 256,
            levels: 2,
            encoding: PathEncoding::Hex,
        }
    }

    /// The encoder used for datasets with a single integer pk.
    pub fn int_pk() -> PathEncoder {
        PathEncoder {
            scheme: PathScheme::Int,
            branches: 64,
            levels: 4,
            encoding: PathEncoding::Base64,
        }
    }

    /// The encoder used for all other datasets.
    pub fn general() -> PathEncoder {
        PathEncoder {
            scheme: PathScheme::MsgpackHash,
            branches: 64,
            levels: 4,
            encoding: PathEncoding::Base64,
        }
    }

    /// The encoder to use for a dataset being created with the given schema.
    pub fn for_schema(schema: &Schema) -> PathEncoder {
        let pks = schema.pk_columns();
        if pks.len() == 1 && pks[0].data_type == DataType::Integer {
            PathEncoder::int_pk()
        } else {
            PathEncoder::general()
        }
    }

    pub fn from_meta_json(value: &serde_json::Value) -> Result<PathEncoder> {
        let encoder: PathEncoder = serde_json::from_value(value.clone()).map_err(|_| {
            Error::NotYetImplemented(format!(
                "Sorry, this repo uses a feature path scheme which isn't supported by this version: {value}"
            ))
        })?;
        encoder.group_length()?;
        Ok(encoder)
    }

    pub fn to_meta_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("path structure serialization cannot fail")
    }

    pub fn is_legacy(&self) -> bool {
        *self == Self::legacy()
    }

    fn alphabet(&self) -> &'static str {
        match self.encoding {
            PathEncoding::Hex => LOWERCASE_HEX_ALPHABET,
            PathEncoding::Base64 => BASE64_URLSAFE_ALPHABET,
        }
    }

    fn hash(&self, data: &[u8]) -> String {
        match self.encoding {
            PathEncoding::Hex => hex_hash(data),
            PathEncoding::Base64 => b64_hash(data),
        }
    }

    /// How many alphabet chars make up one level. Eg two hex chars for 256
    /// branches, one base64 char for 64 branches.
    fn group_length(&self) -> Result<usize> {
        let base = self.alphabet().chars().count();
        let group_length = (self.branches.max(1) as f64).ln() / (base as f64).ln();
        let group_length = group_length.round() as u32;
        if base.pow(group_length) != self.branches {
            return Err(Error::InvalidOperation(format!(
                "invalid path specification: {:?} encoding and {} branches are incompatible",
                self.encoding, self.branches
            )));
        }
        Ok(group_length as usize)
    }

    fn max_trees(&self) -> i64 {
        (self.branches as i64).pow(self.levels as u32)
    }

    fn path_int_encoder(&self) -> Result<FixedLengthIntEncoder> {
        let group_length = self.group_length()?;
        Ok(FixedLengthIntEncoder::new(
            self.alphabet(),
            self.levels * group_length,
            Some('/'),
            group_length,
        ))
    }

    fn single_tree_int_encoder(&self) -> Result<FixedLengthIntEncoder> {
        let group_length = self.group_length()?;
        Ok(FixedLengthIntEncoder::new(self.alphabet(), group_length, None, group_length))
    }

    /// The filename a feature with the given pk values is stored under.
    pub fn encode_filename(&self, pk_values: &[Value]) -> String {
        b64encode_str(&msg_pack_values(pk_values))
    }

    /// The relative path (under `feature/`) a feature with the given pk
    /// values should be written to.
    pub fn encode_pks_to_path(&self, pk_values: &[Value]) -> Result<String> {
        match self.scheme {
            PathScheme::MsgpackHash => {
                let packed = msg_pack_values(pk_values);
                let pk_hash = self.hash(&packed);
                let group_length = self.group_length()?;
                let chars: Vec<char> = pk_hash.chars().collect();
                let mut parts: Vec<String> = (0..self.levels)
                    .map(|i| chars[i * group_length..(i + 1) * group_length].iter().collect())
                    .collect();
                parts.push(b64encode_str(&packed));
                Ok(parts.join("/"))
            }
            PathScheme::Int => {
                let pk = match pk_values {
                    [Value::Int(pk)] => *pk,
                    _ => {
                        return Err(Error::InvalidOperation(
                            "int path scheme can only encode a single integer value".into(),
                        ))
                    }
                };
                let t = pk.div_euclid(self.branches as i64).rem_euclid(self.max_trees());
                let tree_path = self.path_int_encoder()?.encode_int(t);
                Ok(format!("{tree_path}/{}", self.encode_filename(pk_values)))
            }
        }
    }

    /// Recover the pk values encoded in a feature path.
    pub fn decode_path_to_pks(path: &str) -> Result<Vec<Value>> {
        let basename = path.rsplit('/').next().unwrap_or(path);
        msg_unpack_array(&b64decode_str(basename)?)
    }

    /// Like [`PathEncoder::decode_path_to_pks`] for single-pk datasets.
    pub fn decode_path_to_1pk(path: &str) -> Result<Value> {
        let mut pks = Self::decode_path_to_pks(path)?;
        if pks.len() != 1 {
            return Err(Error::InvalidOperation(format!(
                "expected a single pk value, got {}",
                pks.len()
            )));
        }
        Ok(pks.remove(0))
    }

    /// All possible tree names at one level of this encoding: one name per
    /// branch. Used to probe trees for density sampling and to find the end of
    /// the assigned pk range.
    pub fn tree_names(&self) -> Result<Vec<String>> {
        let encoder = self.single_tree_int_encoder()?;
        Ok((0..self.branches as i64).map(|i| encoder.encode_int(i)).collect())
    }

    /// Looks at a few trees to determine where new features can be inserted:
    /// returns the start of a large empty range that won't collide with any
    /// existing feature, usually one higher than all existing pk values.
    /// Only meaningful for the int scheme.
    pub fn find_start_of_unassigned_range(
        &self,
        store: &dyn ObjectStore,
        feature_tree: Option<&Tree>,
    ) -> Result<i64> {
        let feature_tree = match feature_tree {
            Some(t) if !t.entries.is_empty() => t,
            _ => return Ok(0),
        };

        let mut best_empty_range_size = 0usize;
        let mut empty_range_size = 0usize;
        let mut best_last_seen: Option<String> = None;
        let mut last_seen: Option<String> = None;
        for name in self.tree_names()? {
            if feature_tree.get(&name).is_some() {
                if empty_range_size > best_empty_range_size {
                    best_empty_range_size = empty_range_size;
                    best_last_seen = last_seen.clone();
                }
                last_seen = Some(name);
                empty_range_size = 0;
            } else {
                empty_range_size += 1;
            }
        }
        if empty_range_size > best_empty_range_size {
            best_last_seen = last_seen;
        }

        let best_last_seen = match best_last_seen {
            Some(name) => name,
            None => return Ok(0),
        };

        let decoder = self.single_tree_int_encoder()?;
        let mut current = store.read_tree(&feature_tree.get(&best_last_seen).unwrap().id)?;
        loop {
            if current.entries.is_empty() {
                return Ok(0);
            }
            let max_subtree = current
                .entries
                .iter()
                .filter(|e| e.kind == EntryKind::Tree)
                .max_by_key(|e| decoder.decode_int(&e.name));
            match max_subtree {
                Some(entry) => current = store.read_tree(&entry.id)?,
                None => break,
            }
        }

        let mut max_pk = None;
        for entry in &current.entries {
            if entry.kind != EntryKind::Blob {
                continue;
            }
            if let Value::Int(pk) = Self::decode_path_to_1pk(&entry.name)? {
                max_pk = Some(max_pk.map_or(pk, |m: i64| m.max(pk)));
            }
        }
        match max_pk {
            Some(pk) => Ok(pk + 1),
            None => Ok(0),
        }
    }
}
