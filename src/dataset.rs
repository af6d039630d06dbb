use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::error::{Error, Result};
use crate::meta_items::{self, MetaItemVisibility, MetaValue};
use crate::object_id::ObjectId;
use crate::object_store::{EntryKind, ObjectStore, Tree};
use crate::paths::{PathEncoder, PATH_STRUCTURE_ITEM};
use crate::schema::{Feature, Legend, RawFeature, Schema};
use crate::serialise::{msg_pack, msg_unpack_array, Value};
use crate::spatial_filter::{MatchResult, SpatialFilter};

/// Name of the hidden subtree inside a dataset where all structured storage lives.
pub const DATASET_DIRNAME: &str = ".table-dataset";
/// The inner-tree name used by older (v2) repositories; still readable.
pub const LEGACY_DATASET_DIRNAME: &str = ".sno-dataset";

pub const META_PATH: &str = "meta/";
pub const FEATURE_PATH: &str = "feature/";
pub const SCHEMA_PATH: &str = "meta/schema.json";
pub const LEGEND_PATH: &str = "meta/legend/";

// -------------------------------------------------------------------------------------------------
// tree walking helpers
// -------------------------------------------------------------------------------------------------
/// Resolve the subtree at a `/`-separated path below `tree`, or `None` if any
/// component is absent or is a blob.
pub fn tree_at_path(store: &dyn ObjectStore, tree: &Tree, path: &str) -> Result<Option<Tree>> {
    let mut current = tree.clone();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        match current.get(component) {
            Some(entry) if entry.kind == EntryKind::Tree => {
                current = store.read_tree(&entry.id)?;
            }
            _ => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn blob_id_at_path(store: &dyn ObjectStore, tree: &Tree, path: &str) -> Result<Option<ObjectId>> {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    };
    let parent = match tree_at_path(store, tree, dir)? {
        Some(parent) => parent,
        None => return Ok(None),
    };
    Ok(parent.get(name).filter(|e| e.kind == EntryKind::Blob).map(|e| e.id))
}

/// All dataset paths in the given root tree, in sorted order. A dataset is any
/// subtree containing an inner `.table-dataset` (or legacy `.sno-dataset`)
/// tree.
pub fn list_dataset_paths(store: &dyn ObjectStore, root_tree: &Tree) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    let mut pending: Vec<(String, Tree)> = vec![(String::new(), root_tree.clone())];
    while let Some((prefix, tree)) = pending.pop() {
        if tree.get(DATASET_DIRNAME).is_some() || tree.get(LEGACY_DATASET_DIRNAME).is_some() {
            paths.push(prefix.trim_end_matches('/').to_string());
            continue;
        }
        for entry in &tree.entries {
            if entry.kind == EntryKind::Tree && !entry.name.starts_with('.') {
                pending.push((
                    format!("{prefix}{}/", entry.name),
                    store.read_tree(&entry.id)?,
                ));
            }
        }
    }
    paths.sort();
    Ok(paths)
}

// -------------------------------------------------------------------------------------------------
// Dataset
// -------------------------------------------------------------------------------------------------
/// A read-only view of one dataset at one tree.
///
/// The view never writes to the tree - batching writes into a commit is not
/// straightforward in a content-addressed store - so the `encode_*` methods
/// return the paths and bytes that *should be written*, and the caller stages
/// them into a commit.
///
/// Schema, legend and meta-item caches are scoped to the view and become
/// read-only garbage when the view is dropped.
pub struct Dataset<'a> {
    store: &'a dyn ObjectStore,
    path: String,
    outer_tree: Option<Tree>,
    inner_tree: Option<Tree>,
    meta_tree: Option<Tree>,
    feature_tree: Option<Tree>,
    schema: RefCell<Option<Schema>>,
    path_encoder: RefCell<Option<PathEncoder>>,
    legends: RefCell<HashMap<String, Legend>>,
    meta_cache: RefCell<HashMap<String, Option<MetaValue>>>,
}

impl<'a> Dataset<'a> {
    /// Build a view of the dataset stored at `path` under the given outer
    /// tree (the dataset's own subtree, not the repository root).
    pub fn new(store: &'a dyn ObjectStore, path: &str, outer_tree: Option<Tree>) -> Result<Dataset<'a>> {
        let inner_tree = match &outer_tree {
            Some(outer) => {
                let entry = outer
                    .get(DATASET_DIRNAME)
                    .or_else(|| outer.get(LEGACY_DATASET_DIRNAME))
                    .filter(|e| e.kind == EntryKind::Tree);
                match entry {
                    Some(entry) => Some(store.read_tree(&entry.id)?),
                    None => None,
                }
            }
            None => None,
        };
        let meta_tree = match &inner_tree {
            Some(inner) => tree_at_path(store, inner, "meta")?,
            None => None,
        };
        let feature_tree = match &inner_tree {
            Some(inner) => tree_at_path(store, inner, "feature")?,
            None => None,
        };
        Ok(Dataset {
            store,
            path: path.to_string(),
            outer_tree,
            inner_tree,
            meta_tree,
            feature_tree,
            schema: RefCell::new(None),
            path_encoder: RefCell::new(None),
            legends: RefCell::new(HashMap::new()),
            meta_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Build a view of the dataset at `path` within the given repository root
    /// tree. Fails with `NoTable` when nothing exists at that path.
    pub fn at(store: &'a dyn ObjectStore, root_tree: &Tree, path: &str) -> Result<Dataset<'a>> {
        let outer = tree_at_path(store, root_tree, path)?;
        if outer.is_none() {
            return Err(Error::NoTable(path.to_string()));
        }
        Dataset::new(store, path, outer)
    }

    pub fn store(&self) -> &'a dyn ObjectStore {
        self.store
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// A dataset's life begins when the first commit writes its inner tree.
    pub fn exists(&self) -> bool {
        self.inner_tree.is_some()
    }

    pub fn feature_tree(&self) -> Option<&Tree> {
        self.feature_tree.as_ref()
    }

    /// Full repository path of an item in the inner tree.
    pub fn full_path(&self, rel_path: &str) -> String {
        format!("{}/{DATASET_DIRNAME}/{rel_path}", self.path)
    }

    /// Full repository path of an attachment item, stored alongside the
    /// dataset rather than inside it.
    pub fn full_attachment_path(&self, rel_path: &str) -> String {
        format!("{}/{rel_path}", self.path)
    }

    // ---------------------------------------------------------------------------------------------
    // meta items
    // ---------------------------------------------------------------------------------------------
    fn read_meta_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if let Some(meta_tree) = &self.meta_tree {
            if let Some(id) = blob_id_at_path(self.store, meta_tree, name)? {
                return Ok(Some(self.store.read_blob(&id)?));
            }
        }
        // Some meta items historically live in the attachment area.
        if meta_items::ATTACHMENT_META_ITEMS.contains(&name) {
            if let Some(outer) = &self.outer_tree {
                if let Some(id) = blob_id_at_path(self.store, outer, name)? {
                    return Ok(Some(self.store.read_blob(&id)?));
                }
            }
        }
        Ok(None)
    }

    /// The decoded meta item with the given name, or `None` if absent.
    /// Results are cached for the life of the view.
    pub fn get_meta_item(&self, name: &str) -> Result<Option<MetaValue>> {
        if let Some(cached) = self.meta_cache.borrow().get(name) {
            return Ok(cached.clone());
        }
        let value = match self.read_meta_blob(name)? {
            Some(data) => Some(meta_items::decode_meta_item(name, &data)?),
            None => None,
        };
        self.meta_cache
            .borrow_mut()
            .insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// All meta items with at least the given visibility, keyed by name.
    pub fn meta_items(&self, min_visibility: MetaItemVisibility) -> Result<BTreeMap<String, MetaValue>> {
        let mut result = BTreeMap::new();
        if let Some(meta_tree) = &self.meta_tree {
            let mut pending: Vec<(String, Tree)> = vec![(String::new(), meta_tree.clone())];
            while let Some((prefix, tree)) = pending.pop() {
                for entry in &tree.entries {
                    let name = format!("{prefix}{}", entry.name);
                    match entry.kind {
                        EntryKind::Tree => {
                            pending.push((format!("{name}/"), self.store.read_tree(&entry.id)?));
                        }
                        EntryKind::Blob => {
                            if meta_items::visibility_for(&name) < min_visibility {
                                continue;
                            }
                            let data = self.store.read_blob(&entry.id)?;
                            result.insert(name.clone(), meta_items::decode_meta_item(&name, &data)?);
                        }
                    }
                }
            }
        }
        for name in meta_items::ATTACHMENT_META_ITEMS {
            if result.contains_key(*name) || meta_items::visibility_for(name) < min_visibility {
                continue;
            }
            if let Some(value) = self.get_meta_item(name)? {
                result.insert(name.to_string(), value);
            }
        }
        Ok(result)
    }

    /// The dataset's current schema. Required: a dataset with no schema.json
    /// is not a dataset.
    pub fn schema(&self) -> Result<Schema> {
        if let Some(schema) = self.schema.borrow().as_ref() {
            return Ok(schema.clone());
        }
        let data = self.read_meta_blob("schema.json")?.ok_or_else(|| {
            Error::NotFound(format!("{}:meta/schema.json", self.path))
        })?;
        let schema = Schema::loads(&data)?;
        *self.schema.borrow_mut() = Some(schema.clone());
        Ok(schema)
    }

    /// Load the legend with the given hash. A feature's legend is not
    /// necessarily the current schema's legend - old legends are kept forever
    /// because old feature blobs still reference them.
    pub fn get_legend(&self, legend_hash: &str) -> Result<Legend> {
        if let Some(legend) = self.legends.borrow().get(legend_hash) {
            return Ok(legend.clone());
        }
        let data = self
            .read_meta_blob(&format!("legend/{legend_hash}"))?
            .ok_or_else(|| Error::NotFound(format!("{}:meta/legend/{legend_hash}", self.path)))?;
        let legend = Legend::loads(&data)?;
        self.legends
            .borrow_mut()
            .insert(legend_hash.to_string(), legend.clone());
        Ok(legend)
    }

    /// All CRS definitions in this dataset: {identifier: wkt}.
    pub fn crs_definitions(&self) -> Result<BTreeMap<String, String>> {
        let mut result = BTreeMap::new();
        if let Some(meta_tree) = &self.meta_tree {
            if let Some(crs_tree) = tree_at_path(self.store, meta_tree, "crs")? {
                for entry in &crs_tree.entries {
                    let name = format!("crs/{}", entry.name);
                    if let Some(identifier) = meta_items::CRS_DEFINITIONS.match_group1(&name) {
                        let data = self.store.read_blob(&entry.id)?;
                        match meta_items::decode_meta_item(&name, &data)? {
                            MetaValue::Text(wkt) => {
                                result.insert(identifier, wkt);
                            }
                            _ => unreachable!("CRS meta items decode as text"),
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    pub fn get_crs_definition(&self, identifier: &str) -> Result<Option<String>> {
        Ok(self
            .get_meta_item(&crate::crs::meta_path(identifier))?
            .and_then(|v| v.as_text().map(String::from)))
    }

    /// Every legend ever written for this dataset, as (inner-tree-relative
    /// path, blob data) pairs. Used when a dataset is rewritten somewhere
    /// new: old legends must come along, since old feature blobs still
    /// reference them.
    pub fn iter_legend_blobs(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut result = Vec::new();
        if let Some(meta_tree) = &self.meta_tree {
            if let Some(legend_tree) = tree_at_path(self.store, meta_tree, "legend")? {
                for entry in &legend_tree.entries {
                    if entry.kind != EntryKind::Blob {
                        continue;
                    }
                    result.push((
                        format!("{LEGEND_PATH}{}", entry.name),
                        self.store.read_blob(&entry.id)?,
                    ));
                }
            }
        }
        Ok(result)
    }

    // ---------------------------------------------------------------------------------------------
    // path encoding
    // ---------------------------------------------------------------------------------------------
    /// The path encoder in effect for this dataset. Recorded in
    /// `meta/path-structure.json`; absence means the legacy encoder.
    pub fn path_encoder(&self) -> Result<PathEncoder> {
        if let Some(encoder) = *self.path_encoder.borrow() {
            return Ok(encoder);
        }
        let encoder = if self.inner_tree.is_none() {
            // No inner tree: the dataset is being created right now.
            PathEncoder::for_schema(&self.schema()?)
        } else {
            match self.get_meta_item(PATH_STRUCTURE_ITEM)? {
                Some(MetaValue::Json(json)) => PathEncoder::from_meta_json(&json)?,
                _ => PathEncoder::legacy(),
            }
        };
        *self.path_encoder.borrow_mut() = Some(encoder);
        Ok(encoder)
    }

    /// Like [`Dataset::path_encoder`], but usable while the dataset is being
    /// created with a schema that is not yet stored.
    pub fn path_encoder_for(&self, schema: &Schema) -> Result<PathEncoder> {
        if self.inner_tree.is_none() {
            Ok(PathEncoder::for_schema(schema))
        } else {
            self.path_encoder()
        }
    }

    /// The inner-tree-relative path a feature with the given pk values is
    /// stored at.
    pub fn encode_pks_to_path(&self, pk_values: &[Value], schema: Option<&Schema>) -> Result<String> {
        let encoder = match schema {
            Some(schema) => self.path_encoder_for(schema)?,
            None => self.path_encoder()?,
        };
        Ok(format!("{FEATURE_PATH}{}", encoder.encode_pks_to_path(pk_values)?))
    }

    // ---------------------------------------------------------------------------------------------
    // feature codec
    // ---------------------------------------------------------------------------------------------
    fn read_feature_blob(&self, rel_path: &str) -> Result<Vec<u8>> {
        let inner = self
            .inner_tree
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("{}:{rel_path}", self.path)))?;
        let id = blob_id_at_path(self.store, inner, rel_path)?
            .ok_or_else(|| Error::NotFound(format!("{}:{rel_path}", self.path)))?;
        self.store.read_blob(&id)
    }

    /// Decode a feature blob's body using the legend it names.
    /// `pk_values` are the values recovered from the feature's path.
    pub fn decode_feature_blob(&self, pk_values: &[Value], data: &[u8]) -> Result<RawFeature> {
        let mut parts = msg_unpack_array(data)?;
        if parts.len() != 2 {
            return Err(Error::InvalidFileFormat(format!(
                "feature blob should have 2 parts, found {}",
                parts.len()
            )));
        }
        let non_pk_values = match parts.remove(1) {
            Value::Array(values) => values,
            _ => return Err(Error::InvalidFileFormat("malformed feature blob".into())),
        };
        let legend_hash = match parts.remove(0) {
            Value::Text(hash) => hash,
            _ => return Err(Error::InvalidFileFormat("malformed feature blob".into())),
        };
        let legend = self.get_legend(&legend_hash)?;
        legend.value_tuples_to_raw_dict(pk_values, &non_pk_values)
    }

    /// The stored `{column_id: value}` dict for the feature with the given pk
    /// values. May contain ids no longer present in the current schema.
    pub fn get_raw_feature(&self, pk_values: &[Value]) -> Result<RawFeature> {
        let pk_values = self.schema()?.sanitise_pks(pk_values.to_vec())?;
        let rel_path = self.encode_pks_to_path(&pk_values, None)?;
        let data = self.read_feature_blob(&rel_path)?;
        self.decode_feature_blob(&pk_values, &data)
    }

    /// The feature with the given pk values, presented through the current
    /// schema: `{column_name: value}`, with nulls for columns the stored
    /// legend doesn't cover.
    pub fn get_feature(&self, pk_values: &[Value]) -> Result<Feature> {
        let raw = self.get_raw_feature(pk_values)?;
        Ok(self.schema()?.feature_from_raw_dict(&raw))
    }

    /// Decode a feature given its path (relative to `feature/`) and its blob
    /// content.
    pub fn feature_from_path_data(&self, rel_path: &str, data: &[u8]) -> Result<(Vec<Value>, Feature)> {
        let pk_values = PathEncoder::decode_path_to_pks(rel_path)?;
        let raw = self.decode_feature_blob(&pk_values, data)?;
        let feature = self.schema()?.feature_from_raw_dict(&raw);
        Ok((pk_values, feature))
    }

    /// The (inner-tree-relative path, blob body) this feature should be
    /// written at, under the given schema (default: the current schema).
    pub fn encode_feature(&self, feature: &Feature, schema: Option<&Schema>) -> Result<(String, Vec<u8>)> {
        let current;
        let schema = match schema {
            Some(schema) => schema,
            None => {
                current = self.schema()?;
                &current
            }
        };
        let raw = schema.feature_to_raw_dict(feature);
        self.encode_raw_feature_dict(&raw, schema.legend(), Some(schema))
    }

    /// Like [`Dataset::encode_feature`] for a raw dict and explicit legend.
    pub fn encode_raw_feature_dict(
        &self,
        raw: &RawFeature,
        legend: &Legend,
        schema: Option<&Schema>,
    ) -> Result<(String, Vec<u8>)> {
        let (pk_values, non_pk_values) = legend.raw_dict_to_value_tuples(raw);
        let path = self.encode_pks_to_path(&pk_values, schema)?;
        let body = msg_pack(&Value::Array(vec![
            Value::Text(legend.hex_hash()),
            Value::Array(non_pk_values),
        ]));
        Ok((path, body))
    }

    /// The (inner-tree-relative path, bytes) that should be written to store
    /// the given legend.
    pub fn encode_legend(&self, legend: &Legend) -> (String, Vec<u8>) {
        (format!("{LEGEND_PATH}{}", legend.hex_hash()), legend.dumps())
    }

    /// The (inner-tree-relative path, bytes) that should be written to store
    /// the given schema. The schema's legend must also be stored if features
    /// are written with it.
    pub fn encode_schema(&self, schema: &Schema) -> (String, Vec<u8>) {
        (SCHEMA_PATH.to_string(), schema.dumps())
    }

    // ---------------------------------------------------------------------------------------------
    // iteration
    // ---------------------------------------------------------------------------------------------
    /// Exact feature count, by counting feature blobs.
    pub fn feature_count(&self) -> Result<u64> {
        let mut count = 0;
        for blob in self.feature_blobs() {
            blob?;
            count += 1;
        }
        Ok(count)
    }

    /// A lazy cursor over every feature blob, in tree-name order (not pk
    /// order - path encoders disperse pks). Safe to drop at any point.
    pub fn feature_blobs(&self) -> FeatureBlobIter<'_> {
        FeatureBlobIter {
            store: self.store,
            stack: match &self.feature_tree {
                Some(tree) => vec![(String::new(), tree.clone(), 0)],
                None => Vec::new(),
            },
        }
    }

    /// Stream features, decoding each blob, optionally restricted by a
    /// spatial filter. Features whose blobs are locally absent because the
    /// spatial filter pre-filtered them at clone time are skipped; a promised
    /// blob under a match-all filter is an error the caller must see.
    pub fn iter_features<'s>(&'s self, filter: &'s SpatialFilter) -> FeatureIter<'a, 's> {
        let geom_column = self
            .schema()
            .ok()
            .and_then(|s| s.geometry_columns().first().map(|c| c.name.clone()));
        FeatureIter {
            dataset: self,
            blobs: self.feature_blobs(),
            filter,
            geom_column,
        }
    }

    // ---------------------------------------------------------------------------------------------
    // import
    // ---------------------------------------------------------------------------------------------
    /// Encode a feature for an import that replaces `replacing`. When the
    /// feature already exists there and decodes identically under the new
    /// schema, the existing blob id is re-emitted instead of new bytes: a
    /// compatible schema change (eg adding a nullable column) then rewrites
    /// nothing.
    pub fn encode_feature_for_import(
        &self,
        feature: &Feature,
        schema: &Schema,
        replacing: Option<&Dataset>,
    ) -> Result<(String, ImportBlob)> {
        let (rel_path, body) = self.encode_feature(feature, Some(schema))?;
        if let Some(replacing) = replacing {
            if let Some(inner) = &replacing.inner_tree {
                if let Some(existing_id) = blob_id_at_path(replacing.store, inner, &rel_path)? {
                    let existing_data = replacing.store.read_blob(&existing_id)?;
                    let pk_values = PathEncoder::decode_path_to_pks(&rel_path)?;
                    let existing_raw = replacing.decode_feature_blob(&pk_values, &existing_data)?;
                    let existing_feature = schema.feature_from_raw_dict(&existing_raw);
                    if existing_feature == *feature {
                        debug!("unchanged feature at {rel_path}, reusing {existing_id}");
                        return Ok((rel_path, ImportBlob::Existing(existing_id)));
                    }
                }
            }
        }
        Ok((rel_path, ImportBlob::Data(body)))
    }
}

/// A feature blob to be staged during an import: fresh content, or an
/// existing blob re-used unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportBlob {
    Data(Vec<u8>),
    Existing(ObjectId),
}

// -------------------------------------------------------------------------------------------------
// iterators
// -------------------------------------------------------------------------------------------------
/// Depth-first, name-ordered walk of the feature tree.
pub struct FeatureBlobIter<'a> {
    store: &'a dyn ObjectStore,
    stack: Vec<(String, Tree, usize)>,
}

impl Iterator for FeatureBlobIter<'_> {
    /// (path relative to `feature/`, blob id)
    type Item = Result<(String, ObjectId)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (prefix, tree, index) = self.stack.last_mut()?;
            let entry = match tree.entries.get(*index) {
                Some(entry) => entry.clone(),
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            *index += 1;
            match entry.kind {
                EntryKind::Blob => {
                    let path = format!("{prefix}{}", entry.name);
                    return Some(Ok((path, entry.id)));
                }
                EntryKind::Tree => {
                    let child_prefix = format!("{prefix}{}/", entry.name);
                    match self.store.read_tree(&entry.id) {
                        Ok(child) => self.stack.push((child_prefix, child, 0)),
                        Err(e) => return Some(Err(e)),
                    }
                }
            }
        }
    }
}

pub struct FeatureIter<'a, 's> {
    dataset: &'s Dataset<'a>,
    blobs: FeatureBlobIter<'s>,
    filter: &'s SpatialFilter,
    geom_column: Option<String>,
}

impl Iterator for FeatureIter<'_, '_> {
    type Item = Result<(Vec<Value>, Feature)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (path, id) = match self.blobs.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };
            let data = match self.dataset.store.read_blob(&id) {
                Ok(data) => data,
                Err(e @ Error::Promised(_)) => {
                    if self.filter.is_match_all() {
                        return Some(Err(e));
                    }
                    // Pre-filtered at clone time; it cannot match the filter.
                    continue;
                }
                Err(e) => return Some(Err(e)),
            };
            let (pk_values, feature) = match self.dataset.feature_from_path_data(&path, &data) {
                Ok(decoded) => decoded,
                Err(e) => return Some(Err(e)),
            };
            let matches = match &self.geom_column {
                Some(column) => self.filter.matches_feature(&feature, column),
                None => MatchResult::Matching,
            };
            match matches {
                MatchResult::NonMatching => continue,
                _ => return Some(Ok((pk_values, feature))),
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
// test
// -------------------------------------------------------------------------------------------------
#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::geometry::Geometry;
    use crate::object_store::{MemoryObjectStore, ObjectKind, ObjectWrite, TreeBuilder};
    use crate::schema::{ColumnSchema, DataType};

    pub(crate) fn sample_schema() -> Schema {
        let mut id = ColumnSchema::new("id", DataType::Integer);
        id.id = "a1".to_string();
        let id = id.with_pk_index(0);
        let mut name = ColumnSchema::new("name", DataType::Text);
        name.id = "b2".to_string();
        let mut geom = ColumnSchema::new("geom", DataType::Geometry);
        geom.id = "g1".to_string();
        geom.geometry_type = Some("POINT".to_string());
        geom.geometry_crs = Some("EPSG:4326".to_string());
        Schema::new(vec![id, name, geom]).unwrap()
    }

    pub(crate) fn feature(id: i64, name: &str, wkt: Option<&str>) -> Feature {
        let mut f = Feature::new();
        f.insert("id".to_string(), Value::Int(id));
        f.insert("name".to_string(), Value::Text(name.to_string()));
        f.insert(
            "geom".to_string(),
            match wkt {
                Some(wkt) => Value::Geometry(Geometry::from_wkt(wkt).unwrap()),
                None => Value::Null,
            },
        );
        f
    }

    /// Builds a dataset tree in the store: schema, legend, path-structure and
    /// the given features. Returns the dataset's outer tree.
    pub(crate) fn build_dataset(
        store: &MemoryObjectStore,
        schema: &Schema,
        features: &[Feature],
    ) -> Tree {
        let scratch = Dataset::new(store, "scratch", None).unwrap();
        let encoder = PathEncoder::for_schema(schema);

        let mut builder = TreeBuilder::new();
        builder.insert(&format!("{DATASET_DIRNAME}/{SCHEMA_PATH}"), schema.dumps());
        let (legend_path, legend_data) = scratch.encode_legend(schema.legend());
        builder.insert(&format!("{DATASET_DIRNAME}/{legend_path}"), legend_data);
        builder.insert(
            &format!("{DATASET_DIRNAME}/meta/{PATH_STRUCTURE_ITEM}"),
            serde_json::to_vec(&encoder.to_meta_json()).unwrap(),
        );
        builder.insert(
            &format!("{DATASET_DIRNAME}/meta/crs/EPSG:4326.wkt"),
            crate::crs::EPSG_4326_WKT.as_bytes().to_vec(),
        );
        for f in features {
            let raw = schema.feature_to_raw_dict(f);
            let (pk_values, non_pk_values) = schema.legend().raw_dict_to_value_tuples(&raw);
            let rel = encoder.encode_pks_to_path(&pk_values).unwrap();
            let body = msg_pack(&Value::Array(vec![
                Value::Text(schema.legend().hex_hash()),
                Value::Array(non_pk_values),
            ]));
            builder.insert(&format!("{DATASET_DIRNAME}/{FEATURE_PATH}{rel}"), body);
        }
        let outer_id = builder.write(store, store, None).unwrap();
        store.read_tree(&outer_id).unwrap()
    }

    #[test]
    fn roundtrip_feature_through_dataset() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let f = feature(42, "hello", Some("POINT(1 2)"));
        let outer = build_dataset(&store, &schema, &[f.clone()]);

        let ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();
        assert!(ds.exists());
        assert_eq!(ds.schema().unwrap(), schema);
        assert_eq!(ds.feature_count().unwrap(), 1);

        let read = ds.get_feature(&[Value::Int(42)]).unwrap();
        assert_eq!(read, f);

        // The geometry blob is normalised: GP magic, v0, LE flags, zero srs.
        let geom = read["geom"].as_geometry().unwrap();
        assert_eq!(&geom.as_bytes()[..8], &[0x47, 0x50, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn expected_feature_path_for_integer_pk() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let outer = build_dataset(&store, &schema, &[]);
        let ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();
        assert_eq!(
            ds.encode_pks_to_path(&[Value::Int(42)], None).unwrap(),
            "feature/A/A/A/A/kSo="
        );
    }

    #[test]
    fn get_raw_feature_keyed_by_column_id() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let outer = build_dataset(&store, &schema, &[feature(7, "seven", None)]);
        let ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();

        let raw = ds.get_raw_feature(&[Value::Int(7)]).unwrap();
        assert_eq!(raw.get("a1"), Some(&Value::Int(7)));
        assert_eq!(raw.get("b2"), Some(&Value::Text("seven".to_string())));
        assert_eq!(raw.get("g1"), Some(&Value::Null));
    }

    #[test]
    fn missing_feature_is_not_found() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let outer = build_dataset(&store, &schema, &[]);
        let ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();
        assert!(matches!(ds.get_feature(&[Value::Int(1)]), Err(Error::NotFound(_))));
    }

    #[test]
    fn pk_values_accepted_as_text() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let outer = build_dataset(&store, &schema, &[feature(42, "hello", None)]);
        let ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();
        let read = ds.get_feature(&[Value::Text("42".to_string())]).unwrap();
        assert_eq!(read["id"], Value::Int(42));
    }

    #[test]
    fn iteration_in_tree_name_order() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let features: Vec<Feature> = (0..200).map(|i| feature(i, &format!("f{i}"), None)).collect();
        let outer = build_dataset(&store, &schema, &features);
        let ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();

        let filter = SpatialFilter::match_all();
        let read: Vec<_> = ds.iter_features(&filter).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(read.len(), 200);
        assert_eq!(ds.feature_count().unwrap(), 200);

        // Every feature decodes to its original value.
        for (pks, f) in &read {
            let expected = match pks.as_slice() {
                [Value::Int(i)] => feature(*i, &format!("f{i}"), None),
                _ => panic!("unexpected pk values"),
            };
            assert_eq!(f, &expected);
        }
    }

    #[test]
    fn meta_items_respect_visibility() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let outer = build_dataset(&store, &schema, &[]);
        let ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();

        let visible = ds.meta_items(MetaItemVisibility::Visible).unwrap();
        assert!(visible.contains_key("schema.json"));
        assert!(visible.contains_key("crs/EPSG:4326.wkt"));
        assert!(!visible.contains_key(PATH_STRUCTURE_ITEM));
        assert!(!visible.keys().any(|k| k.starts_with("legend/")));

        let all = ds.meta_items(MetaItemVisibility::InternalOnly).unwrap();
        assert!(all.contains_key(PATH_STRUCTURE_ITEM));
        assert!(all.keys().any(|k| k.starts_with("legend/")));
    }

    #[test]
    fn iter_legend_blobs_yields_every_stored_legend() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let outer = build_dataset(&store, &schema, &[feature(1, "one", None)]);
        let ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();

        let legends = ds.iter_legend_blobs().unwrap();
        assert_eq!(legends.len(), 1);
        let (path, data) = &legends[0];
        assert_eq!((path.clone(), data.clone()), ds.encode_legend(schema.legend()));
        assert_eq!(Legend::loads(data).unwrap(), *schema.legend());

        // A dataset still being created has no stored legends.
        let empty = Dataset::new(&store, "new", None).unwrap();
        assert!(empty.iter_legend_blobs().unwrap().is_empty());
    }

    #[test]
    fn attachment_meta_item_read_from_outer_path() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let outer = build_dataset(&store, &schema, &[]);

        // Write metadata.xml alongside the dataset rather than inside it.
        let xml_id = store.put(ObjectKind::Blob, b"<meta/>").unwrap();
        let mut entries = outer.entries.clone();
        entries.push(crate::object_store::TreeEntry {
            name: "metadata.xml".to_string(),
            kind: EntryKind::Blob,
            id: xml_id,
        });
        let outer = Tree { entries };

        let ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();
        assert_eq!(
            ds.get_meta_item("metadata.xml").unwrap(),
            Some(MetaValue::Text("<meta/>".to_string()))
        );
        assert!(ds.meta_items(MetaItemVisibility::Visible).unwrap().contains_key("metadata.xml"));
    }

    #[test]
    fn compatible_schema_change_reuses_blobs_on_import() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let outer = build_dataset(&store, &schema, &[feature(1, "one", None)]);
        let old_ds = Dataset::new(&store, "mylayer", Some(outer)).unwrap();

        // New schema adds a nullable column; unchanged rows decode equal.
        let mut extra = ColumnSchema::new("extra", DataType::Text);
        extra.id = "e9".to_string();
        let mut columns = schema.columns().to_vec();
        columns.push(extra);
        let new_schema = Schema::new(columns).unwrap();

        let mut new_feature = feature(1, "one", None);
        new_feature.insert("extra".to_string(), Value::Null);

        let new_ds = Dataset::new(&store, "mylayer", None).unwrap();
        let (_, blob) = new_ds
            .encode_feature_for_import(&new_feature, &new_schema, Some(&old_ds))
            .unwrap();
        assert!(matches!(blob, ImportBlob::Existing(_)));

        // A changed value does get new bytes.
        let mut changed = new_feature.clone();
        changed.insert("name".to_string(), Value::Text("changed".to_string()));
        let (_, blob) = new_ds
            .encode_feature_for_import(&changed, &new_schema, Some(&old_ds))
            .unwrap();
        assert!(matches!(blob, ImportBlob::Data(_)));
    }

    #[test]
    fn list_datasets_in_root_tree() {
        let store = MemoryObjectStore::new();
        let placeholder = store.put(ObjectKind::Blob, b"x").unwrap();
        let mut builder = TreeBuilder::new();
        builder.insert("README.md", b"hi".to_vec());
        builder.insert_id(&format!("a/b/mylayer/{DATASET_DIRNAME}/placeholder"), placeholder);
        builder.insert_id(&format!("other/{DATASET_DIRNAME}/placeholder"), placeholder);
        let root_id = builder.write(&store, &store, None).unwrap();
        let root = store.read_tree(&root_id).unwrap();

        assert_eq!(
            list_dataset_paths(&store, &root).unwrap(),
            vec!["a/b/mylayer".to_string(), "other".to_string()]
        );
    }
}
