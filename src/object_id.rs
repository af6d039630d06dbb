use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

// -------------------------------------------------------------------------------------------------
// ObjectId
// -------------------------------------------------------------------------------------------------
/// A 20-byte SHA-1 identifier, computed over Git's object-header-prefixed content.
/// Content-defined: the same bytes always produce the same identifier.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Deserialize, Serialize)]
#[serde(into = "String", try_from = "&str")]
pub struct ObjectId([u8; 20]);

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self.hex())
    }
}

impl ObjectId {
    /// Compute the identifier of an object with the given Git object kind and content.
    #[inline]
    pub fn hash_object(kind: &str, content: &[u8]) -> Self {
        let mut h = Sha1::new();
        h.update(kind.as_bytes());
        h.update(b" ");
        h.update(content.len().to_string().as_bytes());
        h.update(b"\0");
        h.update(content);
        ObjectId(h.finalize().into())
    }

    /// Compute the identifier a blob with the given content would have.
    #[inline]
    pub fn hash_blob(content: &[u8]) -> Self {
        Self::hash_object("blob", content)
    }

    #[inline]
    pub fn from_hex(v: &str) -> Result<Self> {
        let bytes = hex::decode(v).map_err(|e| Error::Store(format!("bad object id {v:?}: {e}")))?;
        Self::from_bytes(&bytes)
    }

    #[inline]
    pub fn from_bytes(v: &[u8]) -> Result<Self> {
        Ok(ObjectId(v.try_into().map_err(|_| {
            Error::Store(format!("object id should be a 20-byte value, got {}", v.len()))
        })?))
    }

    #[inline]
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<ObjectId> for String {
    #[inline]
    fn from(id: ObjectId) -> String {
        id.hex()
    }
}

impl TryFrom<&str> for ObjectId {
    type Error = Error;

    #[inline]
    fn try_from(s: &str) -> Result<Self> {
        ObjectId::from_hex(s)
    }
}

impl std::fmt::Display for ObjectId {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl<'a> From<&'a gix::ObjectId> for ObjectId {
    #[inline]
    fn from(id: &'a gix::ObjectId) -> Self {
        ObjectId(
            id.as_bytes()
                .try_into()
                .expect("oid should be a 20-byte value"),
        )
    }
}

impl From<gix::ObjectId> for ObjectId {
    #[inline]
    fn from(id: gix::ObjectId) -> Self {
        ObjectId::from(&id)
    }
}

impl<'a> From<&'a ObjectId> for gix::ObjectId {
    #[inline]
    fn from(id: &'a ObjectId) -> Self {
        gix::hash::ObjectId::try_from(id.as_bytes()).unwrap()
    }
}

impl From<ObjectId> for gix::ObjectId {
    #[inline]
    fn from(id: ObjectId) -> Self {
        gix::ObjectId::from(&id)
    }
}

// -------------------------------------------------------------------------------------------------
// sql
// -------------------------------------------------------------------------------------------------
// The envelope index stores object ids as raw 20-byte BLOBs, not hex.
mod sql {
    use super::*;

    use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

    impl ToSql for ObjectId {
        fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
            Ok(ToSqlOutput::Borrowed(ValueRef::Blob(self.as_bytes())))
        }
    }

    impl FromSql for ObjectId {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            Self::from_bytes(value.as_blob()?).map_err(|e| FromSqlError::Other(e.into()))
        }
    }
}
