use std::collections::BTreeMap;

use crate::dataset::{list_dataset_paths, tree_at_path, Dataset};
use crate::error::{Error, Result};
use crate::meta_items::{MetaItemVisibility, MetaValue};
use crate::object_store::{EntryKind, ObjectStore, Tree, TreeEntry};
use crate::paths::PathEncoder;
use crate::schema::Feature;
use crate::serialise::Value;

// -------------------------------------------------------------------------------------------------
// deltas
// -------------------------------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeltaType {
    Insert,
    Update,
    Delete,
}

impl DeltaType {
    pub fn plural(&self) -> &'static str {
        match self {
            DeltaType::Insert => "inserts",
            DeltaType::Update => "updates",
            DeltaType::Delete => "deletes",
        }
    }
}

/// One change: an insert (new only), an update (both), or a delete (old
/// only). The key may change across an update when a primary key value is
/// edited; for meta items the keys are always equal.
///
/// The sides are private so a delta with no sides cannot be constructed;
/// every delta has at least one of them.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta<K, V> {
    old: Option<(K, V)>,
    new: Option<(K, V)>,
}

impl<K, V> Delta<K, V> {
    pub fn insert(key: K, value: V) -> Delta<K, V> {
        Delta { old: None, new: Some((key, value)) }
    }

    pub fn update(old: (K, V), new: (K, V)) -> Delta<K, V> {
        Delta { old: Some(old), new: Some(new) }
    }

    pub fn delete(key: K, value: V) -> Delta<K, V> {
        Delta { old: Some((key, value)), new: None }
    }

    /// Build a delta from its two optional sides, or `None` when both are
    /// absent.
    pub fn from_parts(old: Option<(K, V)>, new: Option<(K, V)>) -> Option<Delta<K, V>> {
        match (old, new) {
            (None, None) => None,
            (old, new) => Some(Delta { old, new }),
        }
    }

    pub fn delta_type(&self) -> DeltaType {
        match (&self.old, &self.new) {
            (None, Some(_)) => DeltaType::Insert,
            (Some(_), Some(_)) => DeltaType::Update,
            (Some(_), None) => DeltaType::Delete,
            (None, None) => unreachable!("delta with no sides cannot be constructed"),
        }
    }

    /// The delta's sort key: the new key where present, the old otherwise.
    pub fn key(&self) -> &K {
        match (&self.new, &self.old) {
            (Some((key, _)), _) => key,
            (None, Some((key, _))) => key,
            (None, None) => unreachable!("delta with no sides cannot be constructed"),
        }
    }

    pub fn old_key(&self) -> Option<&K> {
        self.old.as_ref().map(|(key, _)| key)
    }

    pub fn old_value(&self) -> Option<&V> {
        self.old.as_ref().map(|(_, value)| value)
    }

    pub fn new_key(&self) -> Option<&K> {
        self.new.as_ref().map(|(key, _)| key)
    }

    pub fn new_value(&self) -> Option<&V> {
        self.new.as_ref().map(|(_, value)| value)
    }
}

/// A set of deltas for one section, ordered by key for stable output.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaDiff<K: Ord + Clone, V> {
    deltas: BTreeMap<K, Delta<K, V>>,
}

impl<K: Ord + Clone, V> Default for DeltaDiff<K, V> {
    fn default() -> Self {
        DeltaDiff { deltas: BTreeMap::new() }
    }
}

impl<K: Ord + Clone, V> DeltaDiff<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, delta: Delta<K, V>) {
        self.deltas.insert(delta.key().clone(), delta);
    }

    pub fn get(&self, key: &K) -> Option<&Delta<K, V>> {
        self.deltas.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Delta<K, V>> {
        self.deltas.values()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn type_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for delta in self.deltas.values() {
            *counts.entry(delta.delta_type().plural()).or_insert(0) += 1;
        }
        counts
    }
}

impl<K: Ord + Clone, V> FromIterator<Delta<K, V>> for DeltaDiff<K, V> {
    fn from_iter<T: IntoIterator<Item = Delta<K, V>>>(iter: T) -> Self {
        let mut diff = Self::new();
        for delta in iter {
            diff.insert(delta);
        }
        diff
    }
}

pub type MetaDelta = Delta<String, MetaValue>;
pub type MetaDiff = DeltaDiff<String, MetaValue>;
pub type FeatureDelta = Delta<Vec<Value>, Feature>;
pub type FeatureDiff = DeltaDiff<Vec<Value>, Feature>;

/// The structured diff of one dataset: a meta section keyed by item name and
/// a feature section keyed by pk values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetDiff {
    pub meta: MetaDiff,
    pub feature: FeatureDiff,
}

impl DatasetDiff {
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.feature.is_empty()
    }

    pub fn type_counts(&self) -> BTreeMap<&'static str, BTreeMap<&'static str, usize>> {
        let mut counts = BTreeMap::new();
        if !self.meta.is_empty() {
            counts.insert("meta", self.meta.type_counts());
        }
        if !self.feature.is_empty() {
            counts.insert("feature", self.feature.type_counts());
        }
        counts
    }
}

/// A diff across the whole repository: dataset path -> dataset diff.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoDiff {
    pub datasets: BTreeMap<String, DatasetDiff>,
}

impl RepoDiff {
    pub fn is_empty(&self) -> bool {
        self.datasets.values().all(|d| d.is_empty())
    }

    pub fn type_counts(
        &self,
    ) -> BTreeMap<String, BTreeMap<&'static str, BTreeMap<&'static str, usize>>> {
        self.datasets
            .iter()
            .filter(|(_, diff)| !diff.is_empty())
            .map(|(path, diff)| (path.clone(), diff.type_counts()))
            .collect()
    }
}

// -------------------------------------------------------------------------------------------------
// diff computation
// -------------------------------------------------------------------------------------------------
/// Compute the diff between two dataset views (either may be absent, for
/// dataset creates and deletes).
pub fn dataset_diff(old: Option<&Dataset>, new: Option<&Dataset>) -> Result<DatasetDiff> {
    let mut diff = DatasetDiff::default();
    diff_meta(old, new, &mut diff.meta)?;
    diff_features(old, new, &mut diff.feature)?;
    Ok(diff)
}

/// Compute the diff between two root trees across every dataset present in
/// either.
pub fn repo_diff(
    store: &dyn ObjectStore,
    old_root: Option<&Tree>,
    new_root: Option<&Tree>,
) -> Result<RepoDiff> {
    let mut paths = Vec::new();
    if let Some(root) = old_root {
        paths.extend(list_dataset_paths(store, root)?);
    }
    if let Some(root) = new_root {
        paths.extend(list_dataset_paths(store, root)?);
    }
    paths.sort();
    paths.dedup();

    let mut result = RepoDiff::default();
    for path in paths {
        let old_ds = match old_root {
            Some(root) => tree_at_path(store, root, &path)?
                .map(|outer| Dataset::new(store, &path, Some(outer)))
                .transpose()?,
            None => None,
        };
        let new_ds = match new_root {
            Some(root) => tree_at_path(store, root, &path)?
                .map(|outer| Dataset::new(store, &path, Some(outer)))
                .transpose()?,
            None => None,
        };
        let old_ds = old_ds.filter(|d| d.exists());
        let new_ds = new_ds.filter(|d| d.exists());
        let diff = dataset_diff(old_ds.as_ref(), new_ds.as_ref())?;
        if !diff.is_empty() {
            result.datasets.insert(path, diff);
        }
    }
    Ok(result)
}

fn diff_meta(old: Option<&Dataset>, new: Option<&Dataset>, out: &mut MetaDiff) -> Result<()> {
    // Internal-only and hidden items (legends, path structure, generated pks)
    // don't appear in user-facing diffs.
    let old_items = match old {
        Some(ds) => ds.meta_items(MetaItemVisibility::Visible)?,
        None => BTreeMap::new(),
    };
    let new_items = match new {
        Some(ds) => ds.meta_items(MetaItemVisibility::Visible)?,
        None => BTreeMap::new(),
    };

    let mut names: Vec<&String> = old_items.keys().chain(new_items.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        match (old_items.get(name), new_items.get(name)) {
            (Some(old_value), Some(new_value)) => {
                if old_value != new_value {
                    out.insert(Delta::update(
                        (name.clone(), old_value.clone()),
                        (name.clone(), new_value.clone()),
                    ));
                }
            }
            (Some(old_value), None) => {
                out.insert(Delta::delete(name.clone(), old_value.clone()));
            }
            (None, Some(new_value)) => {
                out.insert(Delta::insert(name.clone(), new_value.clone()));
            }
            (None, None) => unreachable!(),
        }
    }
    Ok(())
}

fn diff_features(old: Option<&Dataset>, new: Option<&Dataset>, out: &mut FeatureDiff) -> Result<()> {
    diff_feature_trees(
        old,
        new,
        old.and_then(|d| d.feature_tree()),
        new.and_then(|d| d.feature_tree()),
        out,
    )
}

/// Walk both feature trees in parallel by name. Identical blob and subtree
/// ids guarantee identical content, so equal ids short-circuit to "no delta
/// here" without reading anything.
fn diff_feature_trees(
    old_ds: Option<&Dataset>,
    new_ds: Option<&Dataset>,
    old_tree: Option<&Tree>,
    new_tree: Option<&Tree>,
    out: &mut FeatureDiff,
) -> Result<()> {
    let by_name = |tree: Option<&Tree>| -> BTreeMap<String, TreeEntry> {
        tree.map(|t| {
            t.entries
                .iter()
                .map(|e| (e.name.clone(), e.clone()))
                .collect()
        })
        .unwrap_or_default()
    };
    let old_entries = by_name(old_tree);
    let new_entries = by_name(new_tree);

    let mut names: Vec<&String> = old_entries.keys().chain(new_entries.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        let old_entry = old_entries.get(name);
        let new_entry = new_entries.get(name);
        if let (Some(a), Some(b)) = (old_entry, new_entry) {
            if a.id == b.id && a.kind == b.kind {
                continue;
            }
        }
        let old_subtree = match old_entry {
            Some(entry) if entry.kind == EntryKind::Tree => {
                Some(expect_ds(old_ds)?.store().read_tree(&entry.id)?)
            }
            _ => None,
        };
        let new_subtree = match new_entry {
            Some(entry) if entry.kind == EntryKind::Tree => {
                Some(expect_ds(new_ds)?.store().read_tree(&entry.id)?)
            }
            _ => None,
        };
        if old_subtree.is_some() || new_subtree.is_some() {
            diff_feature_trees(old_ds, new_ds, old_subtree.as_ref(), new_subtree.as_ref(), out)?;
        }

        let old_feature = match old_entry {
            Some(entry) if entry.kind == EntryKind::Blob => {
                Some(read_feature(expect_ds(old_ds)?, &entry.name, &entry.id)?)
            }
            _ => None,
        };
        let new_feature = match new_entry {
            Some(entry) if entry.kind == EntryKind::Blob => {
                Some(read_feature(expect_ds(new_ds)?, &entry.name, &entry.id)?)
            }
            _ => None,
        };
        match (old_feature, new_feature) {
            (Some(old), Some(new)) => {
                if old != new {
                    out.insert(Delta::update(old, new));
                }
            }
            (Some((key, value)), None) => out.insert(Delta::delete(key, value)),
            (None, Some((key, value))) => out.insert(Delta::insert(key, value)),
            (None, None) => {}
        }
    }
    Ok(())
}

fn expect_ds<'x, 'a>(ds: Option<&'x Dataset<'a>>) -> Result<&'x Dataset<'a>> {
    ds.ok_or_else(|| Error::Store("tree entries present without a dataset view".into()))
}

fn read_feature(
    ds: &Dataset,
    name: &str,
    id: &crate::object_id::ObjectId,
) -> Result<(Vec<Value>, Feature)> {
    let data = ds.store().read_blob(id)?;
    let pk_values = PathEncoder::decode_path_to_pks(name)?;
    let raw = ds.decode_feature_blob(&pk_values, &data)?;
    let feature = ds.schema()?.feature_from_raw_dict(&raw);
    Ok((pk_values, feature))
}

// -------------------------------------------------------------------------------------------------
// test
// -------------------------------------------------------------------------------------------------
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::dataset::test::{build_dataset, feature, sample_schema};
    use crate::object_store::MemoryObjectStore;

    #[test]
    fn feature_insert_update_delete() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let old_outer = build_dataset(
            &store,
            &schema,
            &[feature(1, "one", None), feature(2, "two", None), feature(3, "three", None)],
        );
        let new_outer = build_dataset(
            &store,
            &schema,
            &[feature(1, "one", None), feature(2, "TWO", None), feature(4, "four", None)],
        );
        let old_ds = Dataset::new(&store, "layer", Some(old_outer)).unwrap();
        let new_ds = Dataset::new(&store, "layer", Some(new_outer)).unwrap();

        let diff = dataset_diff(Some(&old_ds), Some(&new_ds)).unwrap();
        assert!(diff.meta.is_empty());
        assert_eq!(diff.feature.len(), 3);

        let at = |pk: i64| diff.feature.get(&vec![Value::Int(pk)]).unwrap();
        assert_eq!(at(2).delta_type(), DeltaType::Update);
        assert_eq!(at(3).delta_type(), DeltaType::Delete);
        assert_eq!(at(4).delta_type(), DeltaType::Insert);
        assert_eq!(
            at(2).new_value().unwrap()["name"],
            Value::Text("TWO".to_string())
        );

        let counts = diff.type_counts();
        assert_eq!(counts["feature"]["inserts"], 1);
        assert_eq!(counts["feature"]["updates"], 1);
        assert_eq!(counts["feature"]["deletes"], 1);
    }

    #[test]
    fn identical_datasets_have_empty_diff() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let features: Vec<_> = (0..50).map(|i| feature(i, &format!("f{i}"), None)).collect();
        let outer1 = build_dataset(&store, &schema, &features);
        let outer2 = build_dataset(&store, &schema, &features);
        let ds1 = Dataset::new(&store, "layer", Some(outer1)).unwrap();
        let ds2 = Dataset::new(&store, "layer", Some(outer2)).unwrap();
        assert!(dataset_diff(Some(&ds1), Some(&ds2)).unwrap().is_empty());
    }

    #[test]
    fn meta_diff_detects_schema_change() {
        use crate::schema::{ColumnSchema, DataType, Schema};

        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let mut columns = schema.columns().to_vec();
        columns.push({
            let mut c = ColumnSchema::new("extra", DataType::Text);
            c.id = "e9".to_string();
            c
        });
        let new_schema = Schema::new(columns).unwrap();

        let old_outer = build_dataset(&store, &schema, &[]);
        let new_outer = build_dataset(&store, &new_schema, &[]);
        let old_ds = Dataset::new(&store, "layer", Some(old_outer)).unwrap();
        let new_ds = Dataset::new(&store, "layer", Some(new_outer)).unwrap();

        let diff = dataset_diff(Some(&old_ds), Some(&new_ds)).unwrap();
        let schema_delta = diff.meta.get(&"schema.json".to_string()).unwrap();
        assert_eq!(schema_delta.delta_type(), DeltaType::Update);
        // Internal items never show up.
        assert!(diff.meta.get(&"path-structure.json".to_string()).is_none());
        assert!(!diff.meta.iter().any(|d| d.key().starts_with("legend/")));
    }

    #[test]
    fn dataset_create_is_all_inserts() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let outer = build_dataset(&store, &schema, &[feature(1, "one", None)]);
        let ds = Dataset::new(&store, "layer", Some(outer)).unwrap();

        let diff = dataset_diff(None, Some(&ds)).unwrap();
        assert_eq!(diff.meta.get(&"schema.json".to_string()).unwrap().delta_type(), DeltaType::Insert);
        assert_eq!(diff.feature.len(), 1);
        assert_eq!(diff.feature.iter().next().unwrap().delta_type(), DeltaType::Insert);
    }

    #[test]
    fn deltas_are_ordered_by_key() {
        let store = MemoryObjectStore::new();
        let schema = sample_schema();
        let old_outer = build_dataset(&store, &schema, &[]);
        let new_outer = build_dataset(
            &store,
            &schema,
            &[feature(30, "c", None), feature(10, "a", None), feature(20, "b", None)],
        );
        let old_ds = Dataset::new(&store, "layer", Some(old_outer)).unwrap();
        let new_ds = Dataset::new(&store, "layer", Some(new_outer)).unwrap();

        let diff = dataset_diff(Some(&old_ds), Some(&new_ds)).unwrap();
        let keys: Vec<_> = diff.feature.iter().map(|d| d.key().clone()).collect();
        assert_eq!(
            keys,
            vec![vec![Value::Int(10)], vec![Value::Int(20)], vec![Value::Int(30)]]
        );
    }
}
