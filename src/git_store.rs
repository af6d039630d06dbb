use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::object_id::ObjectId;
use crate::object_store::{
    parse_commit, parse_tree, CommitRecord, ObjectKind, ObjectStore, ObjectWrite, Tree,
};
use crate::repo_version::ConfigSource;

// -------------------------------------------------------------------------------------------------
// GitObjectStore
// -------------------------------------------------------------------------------------------------
/// The object store of a real Git repository, via gix.
///
/// This adapter is the only component that knows about Git; everything else
/// reads and writes through the [`ObjectStore`] / [`ObjectWrite`] traits.
///
/// When the repository is a partial clone, an object that is missing locally
/// but promised by a remote is reported as `Error::Promised` rather than
/// `Error::NotFound`, so callers can distinguish "not in repo" from "not
/// downloaded yet".
pub struct GitObjectStore {
    repo: gix::Repository,
    has_promisor: bool,
}

impl GitObjectStore {
    pub fn open(path: &Path) -> Result<GitObjectStore> {
        let repo = gix::open(path)
            .map_err(|e| Error::Store(format!("failed to open repository at {}: {e}", path.display())))?;
        Ok(Self::from_repo(repo))
    }

    pub fn init(path: &Path) -> Result<GitObjectStore> {
        let repo = gix::init_bare(path)
            .map_err(|e| Error::Store(format!("failed to init repository at {}: {e}", path.display())))?;
        Ok(Self::from_repo(repo))
    }

    pub fn from_repo(repo: gix::Repository) -> GitObjectStore {
        let has_promisor = has_promisor_packs(&repo);
        if has_promisor {
            debug!("repository at {} is a partial clone", repo.git_dir().display());
        }
        GitObjectStore { repo, has_promisor }
    }

    pub fn repo(&self) -> &gix::Repository {
        &self.repo
    }

    pub fn git_dir(&self) -> &Path {
        self.repo.git_dir()
    }

    /// The commit id at HEAD, or `None` on an empty repository / unborn branch.
    pub fn head_commit_id(&self) -> Option<ObjectId> {
        self.repo.head_id().ok().map(|id| id.detach().into())
    }

    /// Resolve a reference name to the object id it (fully peeled) points to.
    pub fn resolve_reference(&self, name: &str) -> Option<ObjectId> {
        let mut reference = self.repo.find_reference(name).ok()?;
        let id = reference.peel_to_id_in_place().ok()?;
        Some(id.detach().into())
    }

    fn missing(&self, id: &ObjectId) -> Error {
        if self.has_promisor {
            Error::Promised(format!("object {id}"))
        } else {
            Error::NotFound(format!("object {id}"))
        }
    }

    fn read(&self, id: &ObjectId, want: gix::object::Kind) -> Result<Vec<u8>> {
        use gix::prelude::*;
        let oid: gix::ObjectId = id.into();
        let mut buf = Vec::new();
        let data = self
            .repo
            .objects
            .try_find(&oid, &mut buf)
            .map_err(|e| Error::Store(format!("failed to read object {id}: {e}")))?
            .ok_or_else(|| self.missing(id))?;
        if data.kind != want {
            return Err(Error::Store(format!(
                "object {id} is a {}, expected a {want}",
                data.kind
            )));
        }
        Ok(data.data.to_vec())
    }
}

fn has_promisor_packs(repo: &gix::Repository) -> bool {
    let pack_dir = repo.git_dir().join("objects").join("pack");
    match std::fs::read_dir(pack_dir) {
        Ok(entries) => entries.flatten().any(|entry| {
            entry.path().extension().map_or(false, |ext| ext == "promisor")
        }),
        Err(_) => false,
    }
}

impl ObjectStore for GitObjectStore {
    fn contains(&self, id: &ObjectId) -> bool {
        use gix::prelude::*;
        let oid: gix::ObjectId = id.into();
        self.repo.objects.header(oid).is_ok()
    }

    fn read_blob(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.read(id, gix::object::Kind::Blob)
    }

    fn read_tree(&self, id: &ObjectId) -> Result<Tree> {
        parse_tree(&self.read(id, gix::object::Kind::Tree)?)
    }

    fn read_commit(&self, id: &ObjectId) -> Result<CommitRecord> {
        parse_commit(&self.read(id, gix::object::Kind::Commit)?)
    }
}

impl ObjectWrite for GitObjectStore {
    fn put(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        use gix::prelude::*;
        let kind = match kind {
            ObjectKind::Blob => gix::object::Kind::Blob,
            ObjectKind::Tree => gix::object::Kind::Tree,
            ObjectKind::Commit => gix::object::Kind::Commit,
        };
        let id = self
            .repo
            .objects
            .write_buf(kind, data)
            .map_err(|e| Error::Store(format!("failed to write {kind} object: {e}")))?;
        Ok(id.into())
    }
}

impl ConfigSource for GitObjectStore {
    fn get_config(&self, key: &str) -> Option<String> {
        self.repo
            .config_snapshot()
            .string(key)
            .map(|value| value.to_string())
    }
}

// -------------------------------------------------------------------------------------------------
// test
// -------------------------------------------------------------------------------------------------
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::object_store::{write_tree, EntryKind, MemoryObjectStore, TreeEntry};

    #[test]
    fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = GitObjectStore::init(&dir.path().join("repo.git")).unwrap();

        let blob_id = store.put(ObjectKind::Blob, b"hello").unwrap();
        assert_eq!(blob_id.hex(), "b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0");
        assert!(store.contains(&blob_id));
        assert_eq!(store.read_blob(&blob_id).unwrap(), b"hello");

        let tree = Tree {
            entries: vec![TreeEntry { name: "a".into(), kind: EntryKind::Blob, id: blob_id }],
        };
        let tree_id = write_tree(&store, &tree).unwrap();
        assert_eq!(store.read_tree(&tree_id).unwrap(), tree);

        // The same bytes land at the same id as in the in-memory store.
        let memory = MemoryObjectStore::new();
        memory.put(ObjectKind::Blob, b"hello").unwrap();
        assert_eq!(write_tree(&memory, &tree).unwrap(), tree_id);
    }

    #[test]
    fn missing_object_reports_not_found_without_promisors() {
        let dir = tempfile::tempdir().unwrap();
        let store = GitObjectStore::init(&dir.path().join("repo.git")).unwrap();
        let id = ObjectId::hash_blob(b"never written");
        assert!(matches!(store.read_blob(&id), Err(Error::NotFound(_))));
    }
}
