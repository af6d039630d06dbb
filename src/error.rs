use std::fmt::Write as _;

// -------------------------------------------------------------------------------------------------
// exit codes
// -------------------------------------------------------------------------------------------------
// Process exit codes surfaced to CLI callers. These are part of the external
// contract and must not be renumbered.
pub const INVALID_OPERATION: i32 = 41;
pub const NOT_YET_IMPLEMENTED: i32 = 42;
pub const NOT_FOUND: i32 = 43;
pub const PATCH_DOES_NOT_APPLY: i32 = 44;
pub const UNSUPPORTED_VERSION: i32 = 45;
pub const NO_TABLE: i32 = 46;
pub const NO_WORKING_COPY: i32 = 47;
pub const NO_SPATIAL_FILTER: i32 = 48;
pub const SCHEMA_VIOLATION: i32 = 49;

// -------------------------------------------------------------------------------------------------
// Error
// -------------------------------------------------------------------------------------------------
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An addressed object (dataset, feature, meta item, commit) is absent locally.
    #[error("{0} not found")]
    NotFound(String),

    /// The addressed object is absent locally but known to exist remotely (partial clone).
    #[error("{0} is promised but not present locally")]
    Promised(String),

    /// The named dataset does not exist at the addressed revision.
    #[error("no such dataset: {0}")]
    NoTable(String),

    #[error("no working copy: {0}")]
    NoWorkingCopy(String),

    #[error("no spatial filter: {0}")]
    NoSpatialFilter(String),

    /// Valid input that violates a precondition.
    #[error("{0}")]
    InvalidOperation(String),

    /// Recognized but unsupported input.
    #[error("{0}")]
    NotYetImplemented(String),

    #[error("unsupported repository structure version: {0}")]
    UnsupportedVersion(String),

    /// One or more precondition checks failed during patch apply. All conflicts
    /// are collected before this is raised so the user sees the full set at once.
    #[error("{}", format_conflicts(.0))]
    PatchDoesNotApply(Vec<String>),

    /// Feature values that violate column constraints, reported per column.
    #[error("{}", .0.join("\n"))]
    SchemaViolation(Vec<String>),

    /// The envelope for a feature is unrepresentable.
    #[error("cannot index envelope ({0}, {1}, {2}, {3})")]
    CannotIndex(f64, f64, f64, f64),

    /// The transformed envelope is so malformed that the wrong CRS must have been used.
    #[error("cannot index envelope ({0}, {1}, {2}, {3}): apparently the wrong CRS")]
    CannotIndexDueToWrongCrs(f64, f64, f64, f64),

    #[error("geometry error: {0}")]
    Geometry(String),

    #[error("CRS error: {0}")]
    Crs(String),

    /// Unrecognized magic bytes or version in a binary blob.
    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    #[error("object store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn format_conflicts(conflicts: &[String]) -> String {
    let mut msg = String::from("Patch does not apply");
    for c in conflicts {
        write!(msg, "\n{c}").unwrap();
    }
    msg
}

impl Error {
    /// The process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound(_) | Error::Promised(_) => NOT_FOUND,
            Error::NoTable(_) => NO_TABLE,
            Error::NoWorkingCopy(_) => NO_WORKING_COPY,
            Error::NoSpatialFilter(_) => NO_SPATIAL_FILTER,
            Error::NotYetImplemented(_) => NOT_YET_IMPLEMENTED,
            Error::UnsupportedVersion(_) => UNSUPPORTED_VERSION,
            Error::PatchDoesNotApply(_) => PATCH_DOES_NOT_APPLY,
            Error::SchemaViolation(_) => SCHEMA_VIOLATION,
            _ => INVALID_OPERATION,
        }
    }

    /// True for both flavors of missing object, false otherwise.
    pub fn is_missing_object(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Promised(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
