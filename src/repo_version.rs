use crate::error::{Error, Result};
use crate::object_store::{ObjectStore, Tree};

// We look for the repostructure version blob in either of these two places:
pub const VERSION_BLOB_PATH_V3: &str = ".kart.repostructure.version";
pub const VERSION_BLOB_PATH_V2: &str = ".sno.repository.version";

// Datasets v2 and v3 are supported by all operations.
pub const MIN_SUPPORTED_REPO_VERSION: u32 = 2;
pub const MAX_SUPPORTED_REPO_VERSION: u32 = 3;

pub const DEFAULT_NEW_REPO_VERSION: u32 = 3;

/// Config keys the core consumes. String-valued, case-sensitive.
pub mod config_keys {
    pub const REPOSTRUCTURE_VERSION: &str = "kart.repostructure.version";
    pub const LEGACY_REPOSTRUCTURE_VERSION: &str = "sno.repository.version";

    pub const SPATIALFILTER_GEOMETRY: &str = "kart.spatialfilter.geometry";
    pub const SPATIALFILTER_CRS: &str = "kart.spatialfilter.crs";
    pub const SPATIALFILTER_REFERENCE: &str = "kart.spatialfilter.reference";
    pub const SPATIALFILTER_OBJECTID: &str = "kart.spatialfilter.objectid";
}

/// Read access to repository configuration.
pub trait ConfigSource {
    fn get_config(&self, key: &str) -> Option<String>;
}

impl ConfigSource for std::collections::BTreeMap<String, String> {
    fn get_config(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// The (path, content) of the version marker blob for a new repository.
pub fn encode_repo_version(version: u32) -> (&'static str, Vec<u8>) {
    let path = match version {
        2 => VERSION_BLOB_PATH_V2,
        _ => VERSION_BLOB_PATH_V3,
    };
    (path, format!("{version}\n").into_bytes())
}

/// The repo structure version recorded in the given root tree, if any.
pub fn repo_version_from_tree(store: &dyn ObjectStore, root_tree: &Tree) -> Result<Option<u32>> {
    for path in [VERSION_BLOB_PATH_V3, VERSION_BLOB_PATH_V2] {
        if let Some(entry) = root_tree.get(path) {
            let data = store.read_blob(&entry.id)?;
            let text = String::from_utf8_lossy(&data);
            let version: u32 = text.trim().parse().map_err(|_| {
                Error::UnsupportedVersion(format!("malformed version marker: {text:?}"))
            })?;
            return Ok(Some(version));
        }
    }
    Ok(None)
}

/// The repo structure version from config, for empty repositories that have
/// no commit to carry the marker blob yet.
pub fn repo_version_from_config(config: &dyn ConfigSource) -> Option<u32> {
    for key in [
        config_keys::REPOSTRUCTURE_VERSION,
        config_keys::LEGACY_REPOSTRUCTURE_VERSION,
    ] {
        if let Some(value) = config.get_config(key) {
            if let Ok(version) = value.trim().parse() {
                return Some(version);
            }
        }
    }
    None
}

/// Fails with `UnsupportedVersion` unless the version is one this
/// implementation can read and write.
pub fn check_repo_version(version: u32) -> Result<()> {
    if !(MIN_SUPPORTED_REPO_VERSION..=MAX_SUPPORTED_REPO_VERSION).contains(&version) {
        return Err(Error::UnsupportedVersion(format!(
            "found version {version}, supported versions are v{MIN_SUPPORTED_REPO_VERSION} to v{MAX_SUPPORTED_REPO_VERSION}"
        )));
    }
    Ok(())
}

// -------------------------------------------------------------------------------------------------
// test
// -------------------------------------------------------------------------------------------------
#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::object_store::{write_tree, EntryKind, MemoryObjectStore, ObjectKind, ObjectWrite, TreeEntry};

    #[test]
    fn version_marker_roundtrip() {
        let (path, content) = encode_repo_version(3);
        assert_eq!(path, VERSION_BLOB_PATH_V3);
        assert_eq!(content, b"3\n");

        let store = MemoryObjectStore::new();
        let id = store.put(ObjectKind::Blob, &content).unwrap();
        let tree = Tree {
            entries: vec![TreeEntry { name: path.to_string(), kind: EntryKind::Blob, id }],
        };
        write_tree(&store, &tree).unwrap();
        assert_eq!(repo_version_from_tree(&store, &tree).unwrap(), Some(3));
    }

    #[test]
    fn legacy_marker_path() {
        let store = MemoryObjectStore::new();
        let id = store.put(ObjectKind::Blob, b"2\n").unwrap();
        let tree = Tree {
            entries: vec![TreeEntry {
                name: VERSION_BLOB_PATH_V2.to_string(),
                kind: EntryKind::Blob,
                id,
            }],
        };
        assert_eq!(repo_version_from_tree(&store, &tree).unwrap(), Some(2));
    }

    #[test]
    fn version_bounds() {
        assert!(check_repo_version(2).is_ok());
        assert!(check_repo_version(3).is_ok());
        assert!(matches!(check_repo_version(1), Err(Error::UnsupportedVersion(_))));
        assert!(matches!(check_repo_version(4), Err(Error::UnsupportedVersion(_))));
    }

    #[test]
    fn version_from_config() {
        let mut config = std::collections::BTreeMap::new();
        assert_eq!(repo_version_from_config(&config), None);
        config.insert(config_keys::REPOSTRUCTURE_VERSION.to_string(), "3".to_string());
        assert_eq!(repo_version_from_config(&config), Some(3));
    }
}
