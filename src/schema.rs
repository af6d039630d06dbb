use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::serialise::{hex_hash, msg_pack, msg_unpack, Value};

/// A feature keyed by user-visible column name.
pub type Feature = BTreeMap<String, Value>;

/// A "raw" feature keyed by internal column id. Raw dicts contain exactly the
/// values stored in the tree, which may include ids no longer in the schema.
pub type RawFeature = BTreeMap<String, Value>;

// -------------------------------------------------------------------------------------------------
// Legend
// -------------------------------------------------------------------------------------------------
/// A legend is like a table-header that describes how a stored row is read.
/// Legends are immutable.
///
/// A row is stored as two value arrays - the primary-key values are embedded in
/// the feature's path and the remaining values in the blob body - so a legend
/// is two ordered arrays of column ids, one for each part. Zipping ids with
/// values yields a raw feature dict; the current schema is then consulted for
/// user-visible names and ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Legend {
    pk_columns: Vec<String>,
    non_pk_columns: Vec<String>,
}

impl Legend {
    pub fn new(pk_columns: Vec<String>, non_pk_columns: Vec<String>) -> Legend {
        Legend {
            pk_columns,
            non_pk_columns,
        }
    }

    pub fn pk_columns(&self) -> &[String] {
        &self.pk_columns
    }

    pub fn non_pk_columns(&self) -> &[String] {
        &self.non_pk_columns
    }

    /// Load a legend from its stored binary form.
    pub fn loads(data: &[u8]) -> Result<Legend> {
        let err = || Error::InvalidFileFormat("malformed legend".into());
        let parts = match msg_unpack(data)? {
            Value::Array(parts) if parts.len() == 2 => parts,
            _ => return Err(err()),
        };
        let mut lists = parts.into_iter().map(|part| match part {
            Value::Array(ids) => ids
                .into_iter()
                .map(|id| match id {
                    Value::Text(id) => Ok(id),
                    _ => Err(err()),
                })
                .collect::<Result<Vec<String>>>(),
            _ => Err(err()),
        });
        let pk_columns = lists.next().unwrap()?;
        let non_pk_columns = lists.next().unwrap()?;
        Ok(Legend::new(pk_columns, non_pk_columns))
    }

    /// Write this legend to its stored binary form.
    pub fn dumps(&self) -> Vec<u8> {
        let as_values = |ids: &[String]| {
            Value::Array(ids.iter().map(|id| Value::Text(id.clone())).collect())
        };
        msg_pack(&Value::Array(vec![
            as_values(&self.pk_columns),
            as_values(&self.non_pk_columns),
        ]))
    }

    /// Platform-independent 160-bit hex hash, used as the legend's filename.
    pub fn hex_hash(&self) -> String {
        hex_hash(&self.dumps())
    }

    /// Zip stored value tuples with this legend's column ids into a raw dict.
    pub fn value_tuples_to_raw_dict(
        &self,
        pk_values: &[Value],
        non_pk_values: &[Value],
    ) -> Result<RawFeature> {
        if pk_values.len() != self.pk_columns.len()
            || non_pk_values.len() != self.non_pk_columns.len()
        {
            return Err(Error::InvalidFileFormat(format!(
                "feature has {}+{} values but legend has {}+{} columns",
                pk_values.len(),
                non_pk_values.len(),
                self.pk_columns.len(),
                self.non_pk_columns.len()
            )));
        }
        let mut raw = RawFeature::new();
        for (column, value) in self.pk_columns.iter().zip(pk_values) {
            raw.insert(column.clone(), value.clone());
        }
        for (column, value) in self.non_pk_columns.iter().zip(non_pk_values) {
            raw.insert(column.clone(), value.clone());
        }
        Ok(raw)
    }

    /// Inverse of [`Legend::value_tuples_to_raw_dict`]. Columns missing from
    /// the raw dict read as null.
    pub fn raw_dict_to_value_tuples(&self, raw: &RawFeature) -> (Vec<Value>, Vec<Value>) {
        let get = |column: &String| raw.get(column).cloned().unwrap_or(Value::Null);
        (
            self.pk_columns.iter().map(get).collect(),
            self.non_pk_columns.iter().map(get).collect(),
        )
    }
}

// -------------------------------------------------------------------------------------------------
// ColumnSchema
// -------------------------------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Blob,
    Date,
    Float,
    Geometry,
    Integer,
    Interval,
    Numeric,
    Text,
    Time,
    Timestamp,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Blob => "blob",
            DataType::Date => "date",
            DataType::Float => "float",
            DataType::Geometry => "geometry",
            DataType::Integer => "integer",
            DataType::Interval => "interval",
            DataType::Numeric => "numeric",
            DataType::Text => "text",
            DataType::Time => "time",
            DataType::Timestamp => "timestamp",
        }
    }
}

/// The schema for a single column.
///
/// The id is a Kart-specific identifier that is constant for the column's
/// lifetime, even through renames and reorders. The name is the user-visible
/// identifier and can change from commit to commit.
///
/// Field order here is the canonical serialization order; optional fields that
/// are unset are not serialized, so re-serialization is byte-stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub id: String,
    pub name: String,
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry_type: Option<String>,
    #[serde(rename = "geometryCRS", skip_serializing_if = "Option::is_none")]
    pub geometry_crs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: &str, data_type: DataType) -> ColumnSchema {
        ColumnSchema {
            id: Self::new_id(),
            name: name.to_string(),
            data_type,
            primary_key_index: None,
            geometry_type: None,
            geometry_crs: None,
            length: None,
            precision: None,
            scale: None,
            size: None,
            timezone: None,
        }
    }

    pub fn with_pk_index(mut self, pk_index: u32) -> ColumnSchema {
        self.primary_key_index = Some(pk_index);
        self
    }

    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// A stable column id derived from the given bytes. Used by importers that
    /// must produce the same ids on re-import.
    pub fn deterministic_id(data: &[u8]) -> String {
        let digest = Sha256::digest(data);
        uuid::Uuid::from_bytes(digest[..16].try_into().unwrap()).to_string()
    }

    pub fn is_pk(&self) -> bool {
        self.primary_key_index.is_some()
    }
}

// -------------------------------------------------------------------------------------------------
// Schema
// -------------------------------------------------------------------------------------------------
/// An ordered list of [`ColumnSchema`]s. Immutable once constructed;
/// construction derives and validates the legend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    legend: Legend,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSchema>) -> Result<Schema> {
        let legend = Self::derive_legend(&columns)?;
        Ok(Schema { columns, legend })
    }

    fn derive_legend(columns: &[ColumnSchema]) -> Result<Legend> {
        // Primary key columns first, in pk-index order, then the rest in
        // schema order. The pk indices must form the range 0..k.
        let mut ordered: Vec<&ColumnSchema> = columns.iter().collect();
        ordered.sort_by_key(|c| c.primary_key_index.map(|i| i as i64).unwrap_or(i64::MAX));
        let mut pk_ids = Vec::new();
        let mut non_pk_ids = Vec::new();
        for (i, column) in ordered.iter().enumerate() {
            match column.primary_key_index {
                Some(pk_index) => {
                    if i as u32 != pk_index {
                        return Err(Error::InvalidOperation(format!(
                            "expected contiguous primaryKeyIndex {i} but found {pk_index}"
                        )));
                    }
                    pk_ids.push(column.id.clone());
                }
                None => non_pk_ids.push(column.id.clone()),
            }
        }
        Ok(Legend::new(pk_ids, non_pk_ids))
    }

    /// Load a schema from `schema.json` bytes.
    pub fn loads(data: &[u8]) -> Result<Schema> {
        let columns: Vec<ColumnSchema> = serde_json::from_slice(data)?;
        Schema::new(columns)
    }

    /// Write this schema to `schema.json` bytes. Canonical: optional fields
    /// that are unset are omitted and keys are in canonical order, so the
    /// content hash is reproducible.
    pub fn dumps(&self) -> Vec<u8> {
        serde_json::to_vec(&self.columns).expect("schema serialization cannot fail")
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Schema> {
        let columns: Vec<ColumnSchema> = serde_json::from_value(value.clone())?;
        Schema::new(columns)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.columns).expect("schema serialization cannot fail")
    }

    pub fn hex_hash(&self) -> String {
        hex_hash(&self.dumps())
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn legend(&self) -> &Legend {
        &self.legend
    }

    pub fn pk_columns(&self) -> Vec<&ColumnSchema> {
        let mut pks: Vec<&ColumnSchema> = self.columns.iter().filter(|c| c.is_pk()).collect();
        pks.sort_by_key(|c| c.primary_key_index);
        pks
    }

    pub fn first_pk_column(&self) -> Option<&ColumnSchema> {
        self.pk_columns().into_iter().next()
    }

    pub fn non_pk_columns(&self) -> Vec<&ColumnSchema> {
        self.columns.iter().filter(|c| !c.is_pk()).collect()
    }

    pub fn geometry_columns(&self) -> Vec<&ColumnSchema> {
        self.columns
            .iter()
            .filter(|c| c.data_type == DataType::Geometry)
            .collect()
    }

    pub fn has_geometry(&self) -> bool {
        !self.geometry_columns().is_empty()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Raw feature dict - values keyed by column id - to a dict keyed by
    /// column name. Columns present in the schema but missing from the raw
    /// dict read as null; raw values for unknown ids are dropped.
    pub fn feature_from_raw_dict(&self, raw: &RawFeature) -> Feature {
        self.columns
            .iter()
            .map(|c| {
                (
                    c.name.clone(),
                    raw.get(&c.id).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    /// A feature keyed by column name to a raw dict keyed by column id.
    /// Columns missing from the feature become null.
    pub fn feature_to_raw_dict(&self, feature: &Feature) -> RawFeature {
        self.columns
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    feature.get(&c.name).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    /// Like [`Schema::feature_to_raw_dict`], for a positional value sequence
    /// in schema order.
    pub fn feature_to_raw_dict_positional(&self, values: &[Value]) -> Result<RawFeature> {
        if values.len() != self.columns.len() {
            return Err(Error::InvalidOperation(format!(
                "feature has {} values but schema has {} columns",
                values.len(),
                self.columns.len()
            )));
        }
        Ok(self
            .columns
            .iter()
            .zip(values)
            .map(|(c, v)| (c.id.clone(), v.clone()))
            .collect())
    }

    /// Does a schema change from `self` to `other` leave every feature at the
    /// same path? Only if the primary key columns are unchanged. Rows written
    /// under a PK-compatible predecessor remain readable without rewriting.
    pub fn is_pk_compatible(&self, other: &Schema) -> bool {
        self.legend.pk_columns() == other.legend.pk_columns()
    }

    /// Fixes up pk values that were parsed from text: ensures integer and
    /// float pk columns get properly typed values.
    pub fn sanitise_pks(&self, mut pk_values: Vec<Value>) -> Result<Vec<Value>> {
        for (value, column) in pk_values.iter_mut().zip(self.pk_columns()) {
            if let Value::Text(s) = value {
                match column.data_type {
                    DataType::Integer => {
                        let n: i64 = s.parse().map_err(|_| {
                            Error::InvalidOperation(format!("invalid integer pk value: {s:?}"))
                        })?;
                        *value = Value::Int(n);
                    }
                    DataType::Float => {
                        let n: f64 = s.parse().map_err(|_| {
                            Error::InvalidOperation(format!("invalid float pk value: {s:?}"))
                        })?;
                        *value = Value::Float(n);
                    }
                    _ => {}
                }
            }
        }
        Ok(pk_values)
    }

    /// Returns `new_schema` with column ids copied over from `self` wherever a
    /// column is recognisably "the same": first matched by name (handles
    /// reorders), then by position (handles renames). Both passes require the
    /// pk index to agree and the roundtrip context to accept the pairing.
    pub fn align_to_self(
        &self,
        new_schema: &Schema,
        ctx: &dyn RoundtripContext,
    ) -> Result<Schema> {
        let old_cols = &self.columns;
        let mut new_cols = new_schema.columns.clone();
        let mut old_done = vec![false; old_cols.len()];
        let mut new_done = vec![false; new_cols.len()];

        // Align columns by name + type - handles reordering.
        for j in 0..new_cols.len() {
            if let Some(i) = old_cols.iter().position(|c| c.name == new_cols[j].name) {
                try_align(old_cols, &mut new_cols, &mut old_done, &mut new_done, i, j, ctx);
            }
        }

        // Align columns by position + type - handles renames.
        for k in 0..old_cols.len().min(new_cols.len()) {
            try_align(old_cols, &mut new_cols, &mut old_done, &mut new_done, k, k, ctx);
        }

        Schema::new(new_cols)
    }

    /// Classifies which columns are affected by which kinds of change between
    /// `self` and `new_schema`.
    pub fn diff_types(&self, new_schema: &Schema) -> SchemaDiffTypes {
        let old_ids: Vec<&str> = self.columns.iter().map(|c| c.id.as_str()).collect();
        let new_ids: Vec<&str> = new_schema.columns.iter().map(|c| c.id.as_str()).collect();

        let mut result = SchemaDiffTypes::default();
        for id in &new_ids {
            if !old_ids.contains(id) {
                result.inserts.insert(id.to_string());
            }
        }
        for id in &old_ids {
            if !new_ids.contains(id) {
                result.deletes.insert(id.to_string());
            }
        }

        for (new_index, new_col) in new_schema.columns.iter().enumerate() {
            let old_index = match old_ids.iter().position(|id| *id == new_col.id) {
                Some(i) => i,
                None => continue,
            };
            let old_col = &self.columns[old_index];

            if old_index != new_index {
                result.position_updates.insert(new_col.id.clone());
            }
            if old_col.name != new_col.name {
                result.name_updates.insert(new_col.id.clone());
            }
            let strip = |c: &ColumnSchema| {
                let mut c = c.clone();
                c.name = String::new();
                c.primary_key_index = None;
                c
            };
            if strip(old_col) != strip(new_col) {
                result.type_updates.insert(new_col.id.clone());
            }
            if old_col.primary_key_index != new_col.primary_key_index {
                result.pk_updates.insert(new_col.id.clone());
            }
        }
        result
    }

    /// Returns true if the feature is valid against this schema. Populates
    /// `violations` with one example violation per column; existing entries
    /// are kept, so this can be called over a stream of features and will
    /// accumulate at most one message per column.
    pub fn validate_feature(
        &self,
        feature: &Feature,
        violations: &mut BTreeMap<String, String>,
    ) -> bool {
        let mut has_violation = !violations.is_empty();
        for col in &self.columns {
            if violations.contains_key(&col.name) {
                continue;
            }
            let value = feature.get(&col.name).unwrap_or(&Value::Null);
            if let Some(violation) = find_column_violation(col, value) {
                violations.insert(col.name.clone(), violation);
                has_violation = true;
            }
        }
        !has_violation
    }
}

fn try_align(
    old_cols: &[ColumnSchema],
    new_cols: &mut [ColumnSchema],
    old_done: &mut [bool],
    new_done: &mut [bool],
    i: usize,
    j: usize,
    ctx: &dyn RoundtripContext,
) -> bool {
    if old_done[i] || new_done[j] {
        return false;
    }
    if old_cols[i].primary_key_index != new_cols[j].primary_key_index {
        return false;
    }
    if ctx.try_align_schema_col(&old_cols[i], &mut new_cols[j]) {
        new_cols[j].id = old_cols[i].id.clone();
        old_done[i] = true;
        new_done[j] = true;
        true
    } else {
        false
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchemaDiffTypes {
    pub inserts: BTreeSet<String>,
    pub deletes: BTreeSet<String>,
    pub position_updates: BTreeSet<String>,
    pub name_updates: BTreeSet<String>,
    pub type_updates: BTreeSet<String>,
    pub pk_updates: BTreeSet<String>,
}

// -------------------------------------------------------------------------------------------------
// roundtrip context
// -------------------------------------------------------------------------------------------------
/// Decides whether two columns with the same name or position could be
/// versions of the same column.
///
/// The default context treats any data-type change as a real change. A
/// context for a storage back-end that cannot represent every data type may
/// treat its known systematic downgrades (eg numeric stored as text) as
/// non-changes, restoring the original attributes on the new column before
/// returning true.
pub trait RoundtripContext {
    fn try_align_schema_col(&self, old_col: &ColumnSchema, new_col: &mut ColumnSchema) -> bool;
}

pub struct DefaultRoundtripContext;

impl RoundtripContext for DefaultRoundtripContext {
    fn try_align_schema_col(&self, old_col: &ColumnSchema, new_col: &mut ColumnSchema) -> bool {
        new_col.data_type == old_col.data_type
    }
}

// -------------------------------------------------------------------------------------------------
// per-value validation
// -------------------------------------------------------------------------------------------------
lazy_static! {
    static ref DATE_RE: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap();
    static ref TIME_RE: Regex = Regex::new(r"^\d{2}:\d{2}:\d{2}(\.\d+)?Z?$").unwrap();
    static ref TIMESTAMP_RE: Regex =
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z?$").unwrap();
    static ref INTERVAL_RE: Regex =
        Regex::new(r"^P(\d+Y)?(\d+M)?(\d+W)?(\d+D)?(T(\d+H)?(\d+M)?(\d+(\.\d+)?S)?)?$").unwrap();
}

fn fmt_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Text(v) => {
            if v.chars().count() > 100 {
                let head: String = v.chars().take(40).collect();
                let tail: String = v.chars().rev().take(40).collect::<Vec<_>>().into_iter().rev().collect();
                format!("{head:?}.....{tail:?}")
            } else {
                format!("{v:?}")
            }
        }
        Value::Blob(v) => {
            if v.len() > 100 {
                format!("{}.....{}", hex::encode(&v[..40]), hex::encode(&v[v.len() - 40..]))
            } else {
                hex::encode(v)
            }
        }
        Value::Array(_) => "<array>".to_string(),
        Value::Geometry(_) => "<geometry>".to_string(),
    }
}

fn value_matches_type(data_type: DataType, value: &Value) -> bool {
    match data_type {
        DataType::Boolean => matches!(value, Value::Bool(_)),
        DataType::Blob => matches!(value, Value::Blob(_)),
        DataType::Float => matches!(value, Value::Float(_) | Value::Int(_)),
        DataType::Geometry => matches!(value, Value::Geometry(_)),
        DataType::Integer => matches!(value, Value::Int(_) | Value::UInt(_)),
        DataType::Date
        | DataType::Interval
        | DataType::Numeric
        | DataType::Text
        | DataType::Time
        | DataType::Timestamp => matches!(value, Value::Text(_)),
    }
}

fn signed_bit_length(v: i64) -> u32 {
    if v < 0 {
        64 - (v + 1).unsigned_abs().leading_zeros() + 1
    } else {
        64 - (v as u64).leading_zeros() + 1
    }
}

/// How the value violates the column's constraints, or `None` if compliant.
/// Null is always compliant - nullability is not modelled here.
pub fn find_column_violation(col: &ColumnSchema, value: &Value) -> Option<String> {
    if value.is_null() {
        return None;
    }
    if !value_matches_type(col.data_type, value) {
        return Some(format!(
            "In column '{}' value {} doesn't match schema type {}",
            col.name,
            fmt_value(value),
            col.data_type.name()
        ));
    }

    match (col.data_type, value) {
        (DataType::Blob, Value::Blob(v)) => {
            let length = col.length? as usize;
            if length > 0 && v.len() > length {
                return Some(format!(
                    "In column '{}' value {} exceeds limit of {} bytes",
                    col.name,
                    fmt_value(value),
                    length
                ));
            }
            None
        }
        (DataType::Text, Value::Text(v)) => {
            let length = col.length? as usize;
            if length > 0 && v.chars().count() > length {
                return Some(format!(
                    "In column '{}' value {} exceeds limit of {} characters",
                    col.name,
                    fmt_value(value),
                    length
                ));
            }
            None
        }
        (DataType::Integer, Value::Int(v)) => {
            let size = col.size?;
            if size > 0 && signed_bit_length(*v) > size {
                let bounds = 1i128 << (size - 1);
                return Some(format!(
                    "In column '{}' value {} does not fit into an int{}: {} to {}",
                    col.name,
                    v,
                    size,
                    -bounds,
                    bounds - 1
                ));
            }
            None
        }
        (DataType::Date, Value::Text(v)) => (!DATE_RE.is_match(v)).then(|| {
            format!(
                "In column '{}' value {} is not an ISO 8601 date ie YYYY-MM-DD",
                col.name,
                fmt_value(value)
            )
        }),
        (DataType::Time, Value::Text(v)) => (!TIME_RE.is_match(v)).then(|| {
            format!(
                "In column '{}' value {} is not an ISO 8601 time ie hh:mm:ss.ssss",
                col.name,
                fmt_value(value)
            )
        }),
        (DataType::Timestamp, Value::Text(v)) => (!TIMESTAMP_RE.is_match(v)).then(|| {
            format!(
                "In column '{}' value {} is not an ISO 8601 UTC datetime ie YYYY-MM-DDThh:mm:ss.ssss",
                col.name,
                fmt_value(value)
            )
        }),
        (DataType::Interval, Value::Text(v)) => (!INTERVAL_RE.is_match(v)).then(|| {
            format!(
                "In column '{}' value {} is not an ISO 8601 duration ie PxYxMxDTxHxMxS",
                col.name,
                fmt_value(value)
            )
        }),
        _ => None,
    }
}

// -------------------------------------------------------------------------------------------------
// test
// -------------------------------------------------------------------------------------------------
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    fn col(id: &str, name: &str, data_type: DataType) -> ColumnSchema {
        let mut c = ColumnSchema::new(name, data_type);
        c.id = id.to_string();
        c
    }

    fn pk_col(id: &str, name: &str, data_type: DataType) -> ColumnSchema {
        col(id, name, data_type).with_pk_index(0)
    }

    fn sample_schema() -> Schema {
        let mut geom = col("g1", "geom", DataType::Geometry);
        geom.geometry_type = Some("POINT".to_string());
        geom.geometry_crs = Some("EPSG:4326".to_string());
        Schema::new(vec![
            pk_col("a1", "id", DataType::Integer),
            col("b2", "name", DataType::Text),
            geom,
        ])
        .unwrap()
    }

    #[test]
    fn legend_binary_form() {
        let legend = Legend::new(
            vec!["a1".to_string()],
            vec!["b2".to_string(), "c3".to_string()],
        );
        assert_eq!(hex::encode(legend.dumps()), "9291a2613192a26232a26333");
        assert_eq!(legend.hex_hash(), "c28c04ab388c01a57042a27b1b7d8bd2326d6f71");
        assert_eq!(Legend::loads(&legend.dumps()).unwrap(), legend);
    }

    #[test]
    fn legend_derivation() {
        let schema = sample_schema();
        assert_eq!(schema.legend().pk_columns(), &["a1".to_string()]);
        assert_eq!(
            schema.legend().non_pk_columns(),
            &["b2".to_string(), "g1".to_string()]
        );
    }

    #[test]
    fn noncontiguous_pk_indexes_rejected() {
        let result = Schema::new(vec![
            col("a1", "id", DataType::Integer).with_pk_index(1),
            col("b2", "name", DataType::Text),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn schema_json_roundtrip_is_stable() {
        let schema = sample_schema();
        let dumped = schema.dumps();
        let reloaded = Schema::loads(&dumped).unwrap();
        assert_eq!(reloaded, schema);
        assert_eq!(reloaded.dumps(), dumped);
        assert_eq!(reloaded.hex_hash(), schema.hex_hash());
    }

    #[test]
    fn loads_drops_explicit_nulls() {
        let a = br#"[{"id":"a1","name":"id","dataType":"integer","primaryKeyIndex":0,"size":null}]"#;
        let b = br#"[{"id":"a1","name":"id","dataType":"integer","primaryKeyIndex":0}]"#;
        assert_eq!(Schema::loads(a).unwrap().dumps(), Schema::loads(b).unwrap().dumps());
    }

    #[test]
    fn raw_dict_roundtrip() {
        let schema = sample_schema();
        let mut feature = Feature::new();
        feature.insert("id".to_string(), Value::Int(42));
        feature.insert("name".to_string(), Value::Text("hello".to_string()));
        feature.insert("geom".to_string(), Value::Null);

        let raw = schema.feature_to_raw_dict(&feature);
        assert_eq!(raw.get("a1"), Some(&Value::Int(42)));
        assert_eq!(schema.feature_from_raw_dict(&raw), feature);
    }

    #[test]
    fn align_handles_rename() {
        let old = Schema::new(vec![
            pk_col("a1", "id", DataType::Integer),
            col("b2", "given_name", DataType::Text),
            col("c3", "surname", DataType::Text),
        ])
        .unwrap();
        let new = Schema::new(vec![
            pk_col("x", "id", DataType::Integer),
            col("y", "first_name", DataType::Text),
            col("z", "surname", DataType::Text),
        ])
        .unwrap();
        let aligned = old.align_to_self(&new, &DefaultRoundtripContext).unwrap();
        // id and surname matched by name; first_name inherits given_name's id
        // by position.
        assert_eq!(aligned.columns()[0].id, "a1");
        assert_eq!(aligned.columns()[1].id, "b2");
        assert_eq!(aligned.columns()[1].name, "first_name");
        assert_eq!(aligned.columns()[2].id, "c3");
    }

    #[test]
    fn align_handles_reorder() {
        let old = Schema::new(vec![
            pk_col("a1", "id", DataType::Integer),
            col("b2", "name", DataType::Text),
            col("c3", "notes", DataType::Text),
        ])
        .unwrap();
        let new = Schema::new(vec![
            pk_col("p", "id", DataType::Integer),
            col("q", "notes", DataType::Text),
            col("r", "name", DataType::Text),
        ])
        .unwrap();
        let aligned = old.align_to_self(&new, &DefaultRoundtripContext).unwrap();
        assert_eq!(aligned.columns()[1].id, "c3");
        assert_eq!(aligned.columns()[2].id, "b2");
    }

    #[test]
    fn align_respects_type_change() {
        let old = Schema::new(vec![pk_col("a1", "id", DataType::Integer), col("b2", "v", DataType::Geometry)]).unwrap();
        let new = Schema::new(vec![pk_col("x", "id", DataType::Integer), col("y", "v", DataType::Integer)]).unwrap();
        let aligned = old.align_to_self(&new, &DefaultRoundtripContext).unwrap();
        // Geometry data cannot become integer data - these must be different columns.
        assert_eq!(aligned.columns()[1].id, "y");
    }

    #[test]
    fn pk_compatibility() {
        let s1 = sample_schema();
        let s2 = Schema::new(vec![
            pk_col("a1", "id", DataType::Integer),
            col("d4", "extra", DataType::Text),
        ])
        .unwrap();
        assert!(s1.is_pk_compatible(&s2));

        let s3 = Schema::new(vec![pk_col("other", "id", DataType::Integer)]).unwrap();
        assert!(!s1.is_pk_compatible(&s3));
    }

    #[test]
    fn diff_types_classification() {
        let old = sample_schema();
        let mut renamed = old.columns()[1].clone();
        renamed.name = "title".to_string();
        let new = Schema::new(vec![
            old.columns()[0].clone(),
            old.columns()[2].clone(),
            renamed,
            col("d4", "extra", DataType::Text),
        ])
        .unwrap();
        let diff = old.diff_types(&new);
        assert!(diff.inserts.contains("d4"));
        assert!(diff.name_updates.contains("b2"));
        assert!(diff.position_updates.contains("b2"));
        assert!(diff.position_updates.contains("g1"));
        assert!(diff.deletes.is_empty());
        assert!(diff.pk_updates.is_empty());
    }

    #[test]
    fn value_validation() {
        let mut c = col("a", "d", DataType::Date);
        assert!(find_column_violation(&c, &Value::Text("2024-01-31".into())).is_none());
        assert!(find_column_violation(&c, &Value::Text("31/01/2024".into())).is_some());
        assert!(find_column_violation(&c, &Value::Null).is_none());

        c = col("a", "t", DataType::Time);
        assert!(find_column_violation(&c, &Value::Text("23:59:59.999Z".into())).is_none());
        assert!(find_column_violation(&c, &Value::Text("23:59".into())).is_some());

        c = col("a", "ts", DataType::Timestamp);
        assert!(find_column_violation(&c, &Value::Text("2024-01-31T23:59:59Z".into())).is_none());
        assert!(find_column_violation(&c, &Value::Text("2024-01-31 23:59:59".into())).is_some());

        c = col("a", "iv", DataType::Interval);
        assert!(find_column_violation(&c, &Value::Text("P1Y2M3DT4H5M6.5S".into())).is_none());
        assert!(find_column_violation(&c, &Value::Text("1 year".into())).is_some());

        c = col("a", "n", DataType::Integer);
        c.size = Some(16);
        assert!(find_column_violation(&c, &Value::Int(32767)).is_none());
        assert!(find_column_violation(&c, &Value::Int(-32768)).is_none());
        assert!(find_column_violation(&c, &Value::Int(32768)).is_some());

        c = col("a", "s", DataType::Text);
        c.length = Some(5);
        assert!(find_column_violation(&c, &Value::Text("short".into())).is_none());
        assert!(find_column_violation(&c, &Value::Text("too long".into())).is_some());

        c = col("a", "s", DataType::Text);
        assert!(find_column_violation(&c, &Value::Int(1)).is_some());
    }

    #[test]
    fn validate_feature_accumulates_one_violation_per_column() {
        let mut c = col("a", "n", DataType::Integer);
        c.size = Some(8);
        let schema = Schema::new(vec![pk_col("pk", "id", DataType::Integer), c]).unwrap();

        let mut violations = BTreeMap::new();
        let mut feature = Feature::new();
        feature.insert("id".to_string(), Value::Int(1));
        feature.insert("n".to_string(), Value::Int(1000));
        assert!(!schema.validate_feature(&feature, &mut violations));

        feature.insert("n".to_string(), Value::Int(2000));
        assert!(!schema.validate_feature(&feature, &mut violations));
        assert_eq!(violations.len(), 1);
        assert!(violations["n"].contains("1000"));
    }

    #[test]
    fn sanitise_pks_coerces_text() {
        let schema = sample_schema();
        let pks = schema
            .sanitise_pks(vec![Value::Text("42".to_string())])
            .unwrap();
        assert_eq!(pks, vec![Value::Int(42)]);
    }
}
