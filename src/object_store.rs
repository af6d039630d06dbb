use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::object_id::ObjectId;

// -------------------------------------------------------------------------------------------------
// object model
// -------------------------------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Blob,
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub id: ObjectId,
}

/// A mapping from short names to child objects. Names are unique within a
/// tree. Entries are kept in Git's canonical sort order (trees compare as if
/// their name had a trailing `/`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub when_seconds: i64,
    pub offset_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

// -------------------------------------------------------------------------------------------------
// store traits
// -------------------------------------------------------------------------------------------------
/// Read access to a Git-like content-addressed store.
///
/// Reads fail with `Error::NotFound` when the object is absent, or
/// `Error::Promised` when the store is a partial clone and the object is known
/// to exist remotely but has not been downloaded.
pub trait ObjectStore {
    fn contains(&self, id: &ObjectId) -> bool;
    fn read_blob(&self, id: &ObjectId) -> Result<Vec<u8>>;
    fn read_tree(&self, id: &ObjectId) -> Result<Tree>;
    fn read_commit(&self, id: &ObjectId) -> Result<CommitRecord>;
}

/// Write access to the store's staging area. `put` is idempotent: the same
/// bytes always produce the same identifier, regardless of history.
pub trait ObjectWrite {
    fn put(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId>;
}

// -------------------------------------------------------------------------------------------------
// Git-exact serialization
// -------------------------------------------------------------------------------------------------
fn entry_mode(kind: EntryKind) -> &'static [u8] {
    match kind {
        EntryKind::Blob => b"100644",
        EntryKind::Tree => b"40000",
    }
}

// Git's tree ordering compares names as if tree names had a trailing slash.
fn git_sort_key(entry: &TreeEntry) -> Vec<u8> {
    let mut key = entry.name.as_bytes().to_vec();
    if entry.kind == EntryKind::Tree {
        key.push(b'/');
    }
    key
}

pub fn serialize_tree(tree: &Tree) -> Vec<u8> {
    let mut entries: Vec<&TreeEntry> = tree.entries.iter().collect();
    entries.sort_by_key(|e| git_sort_key(e));
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(entry_mode(entry.kind));
        out.push(b' ');
        out.extend_from_slice(entry.name.as_bytes());
        out.push(b'\0');
        out.extend_from_slice(entry.id.as_bytes());
    }
    out
}

pub fn parse_tree(data: &[u8]) -> Result<Tree> {
    let mut entries = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| Error::InvalidFileFormat("malformed tree entry mode".into()))?;
        let mode = &rest[..space];
        rest = &rest[space + 1..];
        let nul = rest
            .iter()
            .position(|b| *b == b'\0')
            .ok_or_else(|| Error::InvalidFileFormat("malformed tree entry name".into()))?;
        let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
        rest = &rest[nul + 1..];
        if rest.len() < 20 {
            return Err(Error::InvalidFileFormat("truncated tree entry id".into()));
        }
        let id = ObjectId::from_bytes(&rest[..20])?;
        rest = &rest[20..];
        let kind = if mode == b"40000" || mode == b"040000" {
            EntryKind::Tree
        } else {
            EntryKind::Blob
        };
        entries.push(TreeEntry { name, kind, id });
    }
    Ok(Tree { entries })
}

fn format_offset(offset_minutes: i32) -> String {
    let sign = if offset_minutes < 0 { '-' } else { '+' };
    let mag = offset_minutes.unsigned_abs();
    format!("{sign}{:02}{:02}", mag / 60, mag % 60)
}

fn format_signature(sig: &Signature) -> String {
    format!(
        "{} <{}> {} {}",
        sig.name,
        sig.email,
        sig.when_seconds,
        format_offset(sig.offset_minutes)
    )
}

fn parse_signature(line: &str) -> Result<Signature> {
    let err = || Error::InvalidFileFormat(format!("malformed commit signature: {line:?}"));
    let (rest, offset) = line.rsplit_once(' ').ok_or_else(err)?;
    let (rest, seconds) = rest.rsplit_once(' ').ok_or_else(err)?;
    let (name, email) = rest.rsplit_once(" <").ok_or_else(err)?;
    let email = email.strip_suffix('>').ok_or_else(err)?;
    let when_seconds: i64 = seconds.parse().map_err(|_| err())?;
    let (sign, digits) = match offset.split_at(1) {
        ("-", d) => (-1i32, d),
        ("+", d) => (1i32, d),
        _ => return Err(err()),
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| err())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| err())?;
    Ok(Signature {
        name: name.to_string(),
        email: email.to_string(),
        when_seconds,
        offset_minutes: sign * (hours * 60 + minutes),
    })
}

pub fn serialize_commit(commit: &CommitRecord) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("tree {}\n", commit.tree.hex()));
    for parent in &commit.parents {
        out.push_str(&format!("parent {}\n", parent.hex()));
    }
    out.push_str(&format!("author {}\n", format_signature(&commit.author)));
    out.push_str(&format!("committer {}\n", format_signature(&commit.committer)));
    out.push('\n');
    out.push_str(&commit.message);
    out.into_bytes()
}

pub fn parse_commit(data: &[u8]) -> Result<CommitRecord> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::InvalidFileFormat("commit is not UTF-8".into()))?;
    let (headers, message) = text
        .split_once("\n\n")
        .ok_or_else(|| Error::InvalidFileFormat("commit has no message separator".into()))?;

    let mut tree = None;
    let mut parents = Vec::new();
    let mut author = None;
    let mut committer = None;
    for line in headers.lines() {
        if let Some(v) = line.strip_prefix("tree ") {
            tree = Some(ObjectId::from_hex(v)?);
        } else if let Some(v) = line.strip_prefix("parent ") {
            parents.push(ObjectId::from_hex(v)?);
        } else if let Some(v) = line.strip_prefix("author ") {
            author = Some(parse_signature(v)?);
        } else if let Some(v) = line.strip_prefix("committer ") {
            committer = Some(parse_signature(v)?);
        }
        // gpgsig and other extension headers are irrelevant here.
    }
    Ok(CommitRecord {
        tree: tree.ok_or_else(|| Error::InvalidFileFormat("commit has no tree header".into()))?,
        parents,
        author: author
            .ok_or_else(|| Error::InvalidFileFormat("commit has no author header".into()))?,
        committer: committer
            .ok_or_else(|| Error::InvalidFileFormat("commit has no committer header".into()))?,
        message: message.to_string(),
    })
}

pub fn write_tree(out: &dyn ObjectWrite, tree: &Tree) -> Result<ObjectId> {
    out.put(ObjectKind::Tree, &serialize_tree(tree))
}

pub fn write_commit(out: &dyn ObjectWrite, commit: &CommitRecord) -> Result<ObjectId> {
    out.put(ObjectKind::Commit, &serialize_commit(commit))
}

// -------------------------------------------------------------------------------------------------
// MemoryObjectStore
// -------------------------------------------------------------------------------------------------
/// An in-memory store, bit-exact with Git's hashing and serialization rules.
/// Serves as the staging arena for patch application and as the store for
/// tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RefCell<HashMap<ObjectId, (ObjectKind, Vec<u8>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> MemoryObjectStore {
        MemoryObjectStore::default()
    }

    pub fn len(&self) -> usize {
        self.objects.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.borrow().is_empty()
    }

    fn read(&self, id: &ObjectId, want: ObjectKind) -> Result<Vec<u8>> {
        let objects = self.objects.borrow();
        let (kind, data) = objects
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("object {id}")))?;
        if *kind != want {
            return Err(Error::Store(format!(
                "object {id} is a {}, expected a {}",
                kind.name(),
                want.name()
            )));
        }
        Ok(data.clone())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn contains(&self, id: &ObjectId) -> bool {
        self.objects.borrow().contains_key(id)
    }

    fn read_blob(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.read(id, ObjectKind::Blob)
    }

    fn read_tree(&self, id: &ObjectId) -> Result<Tree> {
        parse_tree(&self.read(id, ObjectKind::Tree)?)
    }

    fn read_commit(&self, id: &ObjectId) -> Result<CommitRecord> {
        parse_commit(&self.read(id, ObjectKind::Commit)?)
    }
}

impl ObjectWrite for MemoryObjectStore {
    fn put(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::hash_object(kind.name(), data);
        self.objects
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| (kind, data.to_vec()));
        Ok(id)
    }
}

// -------------------------------------------------------------------------------------------------
// TreeBuilder
// -------------------------------------------------------------------------------------------------
#[derive(Debug, Clone)]
enum TreeEdit {
    Put(Vec<u8>),
    PutId(ObjectId),
    Remove,
}

/// Staged path-keyed edits over an optional base tree.
///
/// Edits accumulate in memory; `write` emits only the trees that actually
/// changed, bottom-up, and returns the new root id. Nothing is persisted
/// anywhere else, so abandoning a builder abandons the whole change.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    edits: BTreeMap<String, TreeEdit>,
}

impl TreeBuilder {
    pub fn new() -> TreeBuilder {
        TreeBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Stage blob content at the given `/`-separated path.
    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.edits.insert(path.to_string(), TreeEdit::Put(data));
    }

    /// Stage an existing blob id at the given path without rewriting the blob.
    pub fn insert_id(&mut self, path: &str, id: ObjectId) {
        self.edits.insert(path.to_string(), TreeEdit::PutId(id));
    }

    /// Stage a removal of the entry at the given path.
    pub fn remove(&mut self, path: &str) {
        self.edits.insert(path.to_string(), TreeEdit::Remove);
    }

    /// Apply the staged edits to `base` and write the resulting trees,
    /// returning the new root tree id.
    pub fn write(
        &self,
        store: &dyn ObjectStore,
        out: &dyn ObjectWrite,
        base: Option<&ObjectId>,
    ) -> Result<ObjectId> {
        let edits: Vec<(&str, &TreeEdit)> =
            self.edits.iter().map(|(k, v)| (k.as_str(), v)).collect();
        match write_level(store, out, base, &edits)? {
            Some(id) => Ok(id),
            None => out.put(ObjectKind::Tree, &[]),
        }
    }
}

fn write_level(
    store: &dyn ObjectStore,
    out: &dyn ObjectWrite,
    base: Option<&ObjectId>,
    edits: &[(&str, &TreeEdit)],
) -> Result<Option<ObjectId>> {
    let mut entries: BTreeMap<String, TreeEntry> = match base {
        Some(id) => store
            .read_tree(id)?
            .entries
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect(),
        None => BTreeMap::new(),
    };

    // Group the edits by their first path component.
    let mut children: BTreeMap<&str, Vec<(&str, &TreeEdit)>> = BTreeMap::new();
    for (path, edit) in edits {
        match path.split_once('/') {
            None => {
                // A leaf edit at this level.
                match edit {
                    TreeEdit::Put(data) => {
                        let id = out.put(ObjectKind::Blob, data)?;
                        entries.insert(
                            path.to_string(),
                            TreeEntry { name: path.to_string(), kind: EntryKind::Blob, id },
                        );
                    }
                    TreeEdit::PutId(id) => {
                        entries.insert(
                            path.to_string(),
                            TreeEntry { name: path.to_string(), kind: EntryKind::Blob, id: *id },
                        );
                    }
                    TreeEdit::Remove => {
                        entries.remove(*path);
                    }
                }
            }
            Some((first, rest)) => {
                children.entry(first).or_default().push((rest, edit));
            }
        }
    }

    for (name, child_edits) in children {
        let base_child = entries
            .get(name)
            .filter(|e| e.kind == EntryKind::Tree)
            .map(|e| e.id);
        match write_level(store, out, base_child.as_ref(), &child_edits)? {
            Some(id) => {
                entries.insert(
                    name.to_string(),
                    TreeEntry { name: name.to_string(), kind: EntryKind::Tree, id },
                );
            }
            None => {
                entries.remove(name);
            }
        }
    }

    if entries.is_empty() {
        return Ok(None);
    }
    let tree = Tree { entries: entries.into_values().collect() };
    Ok(Some(write_tree(out, &tree)?))
}
