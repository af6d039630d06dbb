use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indoc::indoc;
use rusqlite::Connection;
use tracing::{debug, debug_span, warn};

use crate::crs::{CrsTransform, TransformSource, EPSG_4326};
use crate::dataset::{DATASET_DIRNAME, LEGACY_DATASET_DIRNAME};
use crate::envelope::{
    is_valid_envelope, transform_minmax_envelope, transpose_gpkg_envelope, union_of_envelopes,
    Envelope, EnvelopeEncoder,
};
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::object_id::ObjectId;
use crate::object_store::{EntryKind, ObjectStore, Tree};
use crate::serialise::{msg_unpack_array, Value};

/// Filename of the envelope index inside the repository's private area.
pub const FEATURE_ENVELOPES_DB: &str = "feature_envelopes.db";

/// Envelope rows per write transaction. An interrupted run loses at most one
/// batch and leaves a consistent database that re-running will extend.
const BATCH_SIZE: usize = 1000;

// -------------------------------------------------------------------------------------------------
// EnvelopeIndex
// -------------------------------------------------------------------------------------------------
/// The SQLite sidecar mapping feature blob ids to encoded WGS 84 envelopes.
///
/// `commits` records commits that are fully indexed - a commit is only listed
/// if all its ancestors are also indexed, so the table stays tiny.
/// `feature_envelopes` maps each feature blob to its encoded envelope;
/// features without geometry (or whose envelope cannot be computed) have no
/// row.
///
/// Decoded envelopes are supersets of the originals (see
/// [`EnvelopeEncoder`]), so queries never produce false negatives.
pub struct EnvelopeIndex {
    conn: Connection,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IndexUpdateStats {
    pub features_indexed: u64,
    pub features_skipped: u64,
    pub cancelled: bool,
}

impl EnvelopeIndex {
    pub fn create_or_open(path: &Path) -> Result<EnvelopeIndex> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?; // https://www.sqlite.org/wal.html
        conn.pragma_update(None, "synchronous", "normal")?; // https://sqlite.org/pragma.html#pragma_synchronous
        let index = EnvelopeIndex { conn };
        index.ensure_tables()?;
        Ok(index)
    }

    fn ensure_tables(&self) -> Result<()> {
        self.conn.execute_batch(indoc! {r#"
            create table if not exists commits
            -- Commits that are fully indexed, ancestors included.
            (
                commit_id blob not null primary key
            ) without rowid;

            create table if not exists feature_envelopes
            -- Maps every feature to its encoded envelope. A feature with no
            -- envelope (eg no geometry) is not found in this table.
            (
                blob_id blob not null primary key,
                envelope blob not null
            ) without rowid;
        "#})?;
        Ok(())
    }

    /// The bits-per-value envelopes are stored with. Discovered from an
    /// existing row so that extending a database keeps its precision; the
    /// default applies to a fresh database.
    pub fn bits_per_value(&self) -> Result<u32> {
        let length: Option<i64> = self
            .conn
            .query_row("select length(envelope) from feature_envelopes limit 1", [], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(match length {
            Some(length) => (length as u32) * 8 / 4,
            None => EnvelopeEncoder::DEFAULT_BITS_PER_VALUE,
        })
    }

    pub fn indexed_commits(&self) -> Result<HashSet<ObjectId>> {
        let mut statement = self.conn.prepare("select commit_id from commits")?;
        let rows = statement.query_map([], |row| row.get::<_, ObjectId>(0))?;
        let mut commits = HashSet::new();
        for row in rows {
            commits.insert(row?);
        }
        Ok(commits)
    }

    /// The stored envelope for one feature blob, if indexed.
    pub fn envelope(&self, blob_id: &ObjectId) -> Result<Option<Envelope>> {
        let encoder = EnvelopeEncoder::new(Some(self.bits_per_value()?))?;
        let encoded: Option<Vec<u8>> = self
            .conn
            .query_row(
                "select envelope from feature_envelopes where blob_id = ?",
                [blob_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        encoded.map(|data| encoder.decode(&data)).transpose()
    }

    /// All feature blob ids whose stored envelope overlaps the given one.
    pub fn query(&self, envelope: &Envelope) -> Result<Vec<ObjectId>> {
        let encoder = EnvelopeEncoder::new(Some(self.bits_per_value()?))?;
        let mut statement = self
            .conn
            .prepare("select blob_id, envelope from feature_envelopes")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, ObjectId>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut matches = Vec::new();
        for row in rows {
            let (blob_id, encoded) = row?;
            if encoder.decode(&encoded)?.intersects(envelope) {
                matches.push(blob_id);
            }
        }
        Ok(matches)
    }

    /// Index every feature blob reachable from `start_commits` but not from
    /// the already-indexed commits, then record the commits as indexed.
    ///
    /// Unindexable features are skipped, never fatal. A cancellation request
    /// is honored between features: completed batches are preserved, but the
    /// `commits` table is not updated for an aborted run, so re-running
    /// extends what was done.
    pub fn update(
        &mut self,
        store: &dyn ObjectStore,
        start_commits: &[ObjectId],
        transform_source: &dyn TransformSource,
        cancel: Option<&AtomicBool>,
    ) -> Result<IndexUpdateStats> {
        let _span = debug_span!("EnvelopeIndex::update").entered();

        let stop_commits = self.indexed_commits()?;
        let mut all_heads: HashSet<ObjectId> = stop_commits.clone();
        all_heads.extend(start_commits.iter().copied());
        let all_independent = minimal_commit_set(store, &all_heads)?;
        let start: Vec<ObjectId> = all_independent
            .iter()
            .filter(|id| !stop_commits.contains(id))
            .copied()
            .collect();

        let mut stats = IndexUpdateStats::default();
        if start.is_empty() {
            debug!("nothing to do: index already up to date");
            return Ok(stats);
        }

        let encoder = EnvelopeEncoder::new(Some(self.bits_per_value()?))?;
        let commits_in_range = commits_between(store, &start, &stop_commits)?;
        let mut crs_helper = CrsHelper::new(store, transform_source, commits_in_range.clone());

        // Objects reachable from the stop commits are already indexed;
        // marking them visited up front excludes them from the walk. Blobs
        // must be marked individually - a subtree that gained one feature
        // still contains all its old ones.
        let mut visited_trees: HashSet<ObjectId> = HashSet::new();
        let mut seen_blobs: HashSet<ObjectId> = HashSet::new();
        for commit_id in &stop_commits {
            if let Ok(commit) = store.read_commit(commit_id) {
                mark_reachable(store, &commit.tree, &mut visited_trees, &mut seen_blobs)?;
            }
        }
        let mut geometry_finder = GeometryFinder::default();
        let mut batch: Vec<(ObjectId, Vec<u8>)> = Vec::with_capacity(BATCH_SIZE);

        for commit_id in &commits_in_range {
            let commit = store.read_commit(commit_id)?;
            let mut feature_blobs = Vec::new();
            collect_feature_blobs(
                store,
                &commit.tree,
                "",
                None,
                &mut visited_trees,
                &mut feature_blobs,
            )?;

            for (ds_path, blob_id) in feature_blobs {
                if let Some(cancel) = cancel {
                    if cancel.load(Ordering::Relaxed) {
                        self.write_batch(&batch)?;
                        stats.cancelled = true;
                        return Ok(stats);
                    }
                }
                if !seen_blobs.insert(blob_id) {
                    continue;
                }

                let data = match store.read_blob(&blob_id) {
                    Ok(data) => data,
                    Err(e) if e.is_missing_object() => {
                        // Partial clone: pre-filtered features aren't local.
                        debug!("feature blob {blob_id} not present locally, skipping");
                        stats.features_skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let geometry = match geometry_finder.find(&data) {
                    Ok(Some(geometry)) => geometry,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("couldn't decode feature {blob_id}: {e}");
                        stats.features_skipped += 1;
                        continue;
                    }
                };
                if geometry.is_empty().unwrap_or(true) {
                    continue;
                }

                let transforms = crs_helper.transforms_for_dataset_at_commit(&ds_path, commit_id)?;
                if transforms.is_empty() {
                    continue;
                }

                let feature_desc = format!("{commit_id}:{ds_path}:{blob_id}");
                match envelope_for_indexing(&geometry, &transforms, &feature_desc) {
                    Some(envelope) => {
                        batch.push((blob_id, encoder.encode(&envelope)));
                        stats.features_indexed += 1;
                        if batch.len() >= BATCH_SIZE {
                            self.write_batch(&batch)?;
                            batch.clear();
                        }
                    }
                    None => {
                        stats.features_skipped += 1;
                    }
                }
            }
        }

        self.write_batch(&batch)?;

        // Update indexed commits in one final transaction.
        let tx = self.conn.transaction()?;
        tx.execute("delete from commits", [])?;
        {
            let mut insert = tx.prepare("insert into commits (commit_id) values (?)")?;
            for commit_id in &all_independent {
                insert.execute([commit_id])?;
            }
        }
        tx.commit()?;

        debug!(
            "indexed {} features ({} skipped)",
            stats.features_indexed, stats.features_skipped
        );
        Ok(stats)
    }

    fn write_batch(&mut self, batch: &[(ObjectId, Vec<u8>)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(indoc! {r#"
                insert or replace into feature_envelopes (blob_id, envelope)
                values (?, ?)
            "#})?;
            for (blob_id, envelope) in batch {
                insert.execute(rusqlite::params![blob_id, envelope])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------
// commit graph helpers
// -------------------------------------------------------------------------------------------------
/// The minimal set of commits with the same combined ancestry as the given
/// set: members reachable from other members are dropped.
fn minimal_commit_set(store: &dyn ObjectStore, commits: &HashSet<ObjectId>) -> Result<Vec<ObjectId>> {
    let mut ancestors: HashSet<ObjectId> = HashSet::new();
    let mut queue: Vec<ObjectId> = Vec::new();
    for commit_id in commits {
        if let Ok(commit) = store.read_commit(commit_id) {
            queue.extend(commit.parents);
        }
    }
    while let Some(commit_id) = queue.pop() {
        if !ancestors.insert(commit_id) {
            continue;
        }
        if let Ok(commit) = store.read_commit(&commit_id) {
            queue.extend(commit.parents);
        }
    }
    let mut result: Vec<ObjectId> = commits
        .iter()
        .filter(|id| !ancestors.contains(id))
        .copied()
        .collect();
    result.sort();
    Ok(result)
}

/// All commits reachable from `start` but not from `stop`, newest-first-ish.
fn commits_between(
    store: &dyn ObjectStore,
    start: &[ObjectId],
    stop: &HashSet<ObjectId>,
) -> Result<Vec<ObjectId>> {
    let mut result = Vec::new();
    let mut visited: HashSet<ObjectId> = stop.clone();
    let mut queue: Vec<ObjectId> = start.to_vec();
    while let Some(commit_id) = queue.pop() {
        if !visited.insert(commit_id) {
            continue;
        }
        result.push(commit_id);
        if let Ok(commit) = store.read_commit(&commit_id) {
            queue.extend(commit.parents);
        }
    }
    Ok(result)
}

fn mark_reachable(
    store: &dyn ObjectStore,
    tree_id: &ObjectId,
    visited_trees: &mut HashSet<ObjectId>,
    seen_blobs: &mut HashSet<ObjectId>,
) -> Result<()> {
    if !visited_trees.insert(*tree_id) {
        return Ok(());
    }
    let tree = match store.read_tree(tree_id) {
        Ok(tree) => tree,
        Err(e) if e.is_missing_object() => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in &tree.entries {
        match entry.kind {
            EntryKind::Tree => mark_reachable(store, &entry.id, visited_trees, seen_blobs)?,
            EntryKind::Blob => {
                seen_blobs.insert(entry.id);
            }
        }
    }
    Ok(())
}

/// Walks a commit's root tree collecting (dataset path, feature blob id)
/// pairs, skipping trees already visited - identical subtrees contain
/// identical features.
fn collect_feature_blobs(
    store: &dyn ObjectStore,
    tree_id: &ObjectId,
    path: &str,
    in_feature_tree_of: Option<&str>,
    visited: &mut HashSet<ObjectId>,
    out: &mut Vec<(String, ObjectId)>,
) -> Result<()> {
    if !visited.insert(*tree_id) {
        return Ok(());
    }
    let tree = match store.read_tree(tree_id) {
        Ok(tree) => tree,
        Err(e) if e.is_missing_object() => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in &tree.entries {
        match (entry.kind, in_feature_tree_of) {
            (EntryKind::Blob, Some(ds_path)) => {
                out.push((ds_path.to_string(), entry.id));
            }
            (EntryKind::Blob, None) => {}
            (EntryKind::Tree, Some(ds_path)) => {
                collect_feature_blobs(store, &entry.id, path, Some(ds_path), visited, out)?;
            }
            (EntryKind::Tree, None) => {
                if entry.name == DATASET_DIRNAME || entry.name == LEGACY_DATASET_DIRNAME {
                    // Only the feature subtree of the inner tree matters here.
                    let inner = match store.read_tree(&entry.id) {
                        Ok(inner) => inner,
                        Err(e) if e.is_missing_object() => continue,
                        Err(e) => return Err(e),
                    };
                    if let Some(feature_entry) = inner.get("feature") {
                        if feature_entry.kind == EntryKind::Tree {
                            let ds_path = path.trim_end_matches('/').to_string();
                            collect_feature_blobs(
                                store,
                                &feature_entry.id,
                                path,
                                Some(&ds_path),
                                visited,
                                out,
                            )?;
                        }
                    }
                } else {
                    let child_path = format!("{path}{}/", entry.name);
                    collect_feature_blobs(store, &entry.id, &child_path, None, visited, out)?;
                }
            }
        }
    }
    Ok(())
}

// -------------------------------------------------------------------------------------------------
// CRS transforms per dataset per commit
// -------------------------------------------------------------------------------------------------
/// Loads CRS definitions for each dataset and builds the set of transforms
/// that could apply to a feature at a given commit.
///
/// A feature added at some commit has the then-current CRS applied to it, but
/// may later be re-read under any CRS that becomes current while the feature
/// still exists - we do not check when individual features are deleted. So
/// the transforms for a commit include the transform for its own CRS plus
/// those of every later commit. It cannot have an earlier CRS applied: that
/// CRS was gone before the feature was added.
struct CrsHelper<'a> {
    store: &'a dyn ObjectStore,
    transform_source: &'a dyn TransformSource,
    /// Newest first, as produced by [`commits_between`].
    commits: Vec<ObjectId>,
    ds_to_transforms: HashMap<String, HashMap<ObjectId, Vec<Arc<dyn CrsTransform>>>>,
}

impl<'a> CrsHelper<'a> {
    fn new(
        store: &'a dyn ObjectStore,
        transform_source: &'a dyn TransformSource,
        commits: Vec<ObjectId>,
    ) -> CrsHelper<'a> {
        CrsHelper {
            store,
            transform_source,
            commits,
            ds_to_transforms: HashMap::new(),
        }
    }

    fn transforms_for_dataset_at_commit(
        &mut self,
        ds_path: &str,
        commit_id: &ObjectId,
    ) -> Result<Vec<Arc<dyn CrsTransform>>> {
        if !self.ds_to_transforms.contains_key(ds_path) {
            let loaded = self.load_transforms_for_dataset(ds_path)?;
            self.ds_to_transforms.insert(ds_path.to_string(), loaded);
        }
        Ok(self.ds_to_transforms[ds_path]
            .get(commit_id)
            .cloned()
            .unwrap_or_default())
    }

    fn load_transforms_for_dataset(
        &self,
        ds_path: &str,
    ) -> Result<HashMap<ObjectId, Vec<Arc<dyn CrsTransform>>>> {
        let mut seen_crs_oids: HashSet<ObjectId> = HashSet::new();
        let mut transform_list: Vec<Arc<dyn CrsTransform>> = Vec::new();
        let mut transform_descs: HashSet<String> = HashSet::new();
        let mut by_commit = HashMap::new();

        for commit_id in &self.commits {
            if let Some(crs_tree) = self.crs_tree_at_commit(ds_path, commit_id)? {
                for entry in &crs_tree.entries {
                    if entry.kind != EntryKind::Blob || !seen_crs_oids.insert(entry.id) {
                        continue;
                    }
                    match self.transform_from_crs_blob(&entry.id) {
                        Ok(Some(transform)) => {
                            if transform_descs.insert(transform.desc()) {
                                transform_list.push(transform);
                            }
                        }
                        Ok(None) => {
                            warn!(
                                "no transform available for CRS {} ({} at {ds_path})",
                                entry.id, entry.name
                            );
                        }
                        Err(e) => {
                            warn!(
                                "couldn't load transform for CRS {} ({} at {ds_path}): {e}",
                                entry.id, entry.name
                            );
                        }
                    }
                }
            }
            by_commit.insert(*commit_id, transform_list.clone());
        }
        Ok(by_commit)
    }

    fn crs_tree_at_commit(&self, ds_path: &str, commit_id: &ObjectId) -> Result<Option<Tree>> {
        let commit = match self.store.read_commit(commit_id) {
            Ok(commit) => commit,
            Err(e) if e.is_missing_object() => return Ok(None),
            Err(e) => return Err(e),
        };
        let root = self.store.read_tree(&commit.tree)?;
        for dirname in [DATASET_DIRNAME, LEGACY_DATASET_DIRNAME] {
            let crs_path = format!("{ds_path}/{dirname}/meta/crs");
            if let Some(tree) = crate::dataset::tree_at_path(self.store, &root, &crs_path)? {
                return Ok(Some(tree));
            }
        }
        Ok(None)
    }

    fn transform_from_crs_blob(&self, blob_id: &ObjectId) -> Result<Option<Arc<dyn CrsTransform>>> {
        let data = self.store.read_blob(blob_id)?;
        let wkt = String::from_utf8(data)
            .map_err(|_| Error::Crs("CRS definition is not UTF-8".into()))?;
        self.transform_source.transform(&wkt, EPSG_4326)
    }
}

// -------------------------------------------------------------------------------------------------
// geometry extraction
// -------------------------------------------------------------------------------------------------
/// Finds the geometry field of a feature blob without loading any schema:
/// the column index is discovered from the values and cached per legend.
#[derive(Default)]
struct GeometryFinder {
    /// legend hash -> geometry column index, or None for datasets known to
    /// have no geometry column.
    legend_to_col: HashMap<String, Option<usize>>,
}

impl GeometryFinder {
    fn find(&mut self, feature_data: &[u8]) -> Result<Option<Geometry>> {
        let mut parts = msg_unpack_array(feature_data)?;
        if parts.len() != 2 {
            return Err(Error::InvalidFileFormat("malformed feature blob".into()));
        }
        let fields = match parts.remove(1) {
            Value::Array(fields) => fields,
            _ => return Err(Error::InvalidFileFormat("malformed feature blob".into())),
        };
        let legend_hash = match parts.remove(0) {
            Value::Text(hash) => hash,
            _ => return Err(Error::InvalidFileFormat("malformed feature blob".into())),
        };

        if let Some(cached) = self.legend_to_col.get(&legend_hash) {
            return Ok(match cached {
                Some(index) => fields.get(*index).and_then(|v| v.as_geometry()).cloned(),
                None => None,
            });
        }

        // Search the values. A null field is inconclusive - it could be a
        // null geometry - so only a fully-determined answer is cached.
        let mut saw_null = false;
        for (index, field) in fields.iter().enumerate() {
            if let Value::Geometry(geometry) = field {
                self.legend_to_col.insert(legend_hash, Some(index));
                return Ok(Some(geometry.clone()));
            }
            if field.is_null() {
                saw_null = true;
            }
        }
        if !saw_null {
            self.legend_to_col.insert(legend_hash, None);
        }
        Ok(None)
    }
}

// -------------------------------------------------------------------------------------------------
// envelope computation
// -------------------------------------------------------------------------------------------------
/// An EPSG:4326 envelope containing the geometry under every candidate
/// transform, or `None` when it cannot be computed - a `None` can be treated
/// as equivalent to the whole planet.
///
/// All candidate transforms are applied and the results unioned, so a feature
/// whose CRS changed at some point is findable wherever it may be. A
/// transform producing an obviously-wrong result is skipped when other
/// candidates exist.
fn envelope_for_indexing(
    geometry: &Geometry,
    transforms: &[Arc<dyn CrsTransform>],
    feature_desc: &str,
) -> Option<Envelope> {
    let gpkg_envelope = match geometry.envelope_2d_or_compute() {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return None,
        Err(e) => {
            warn!("couldn't read geometry envelope for feature {feature_desc}: {e}");
            return None;
        }
    };
    let minmax = transpose_gpkg_envelope(gpkg_envelope);

    let mut result = None;
    for transform in transforms {
        match transform_minmax_envelope(minmax, transform.as_ref(), true) {
            Ok(envelope) => {
                result = union_of_envelopes(result, Some(envelope));
            }
            Err(Error::CannotIndexDueToWrongCrs(..)) if transforms.len() > 1 => {
                debug!(
                    "skipped obviously bad transform {} for feature {feature_desc}",
                    transform.desc()
                );
                continue;
            }
            Err(Error::CannotIndex(..)) | Err(Error::CannotIndexDueToWrongCrs(..)) => {
                debug!("skipped indexing feature {feature_desc}");
                return None;
            }
            Err(e) => {
                warn!("couldn't index feature {feature_desc}: {e}");
                return None;
            }
        }
    }

    let result = match result {
        Some(result) => result,
        None => {
            debug!("skipped indexing feature {feature_desc}");
            return None;
        }
    };
    if !is_valid_envelope(&result) {
        debug!("couldn't index feature {feature_desc} - resulting envelope not valid");
        return None;
    }
    Some(result)
}
