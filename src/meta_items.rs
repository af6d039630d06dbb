use lazy_static::lazy_static;
use regex::Regex;

use crate::crs::normalise_wkt;
use crate::error::{Error, Result};
use crate::schema::Schema;

// -------------------------------------------------------------------------------------------------
// meta item values
// -------------------------------------------------------------------------------------------------
/// A decoded meta-item value. Which variant a given item decodes to is
/// determined by its [`MetaItemFileType`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl MetaValue {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            MetaValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetaValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaItemFileType {
    Bytes,
    Json,
    Text,
    Wkt,
    Xml,
    Unknown,
}

impl MetaItemFileType {
    pub fn from_suffix(meta_item_path: &str) -> Option<MetaItemFileType> {
        match meta_item_path.rsplit_once('.')?.1 {
            "json" => Some(MetaItemFileType::Json),
            "txt" => Some(MetaItemFileType::Text),
            "wkt" => Some(MetaItemFileType::Wkt),
            "xml" => Some(MetaItemFileType::Xml),
            _ => None,
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<MetaValue> {
        match self {
            MetaItemFileType::Bytes => Ok(MetaValue::Bytes(data.to_vec())),
            MetaItemFileType::Json => Ok(MetaValue::Json(serde_json::from_slice(data)?)),
            MetaItemFileType::Wkt => {
                let text = String::from_utf8(data.to_vec())
                    .map_err(|_| Error::InvalidFileFormat("WKT meta item is not UTF-8".into()))?;
                Ok(MetaValue::Text(normalise_wkt(&text)))
            }
            MetaItemFileType::Text | MetaItemFileType::Xml => {
                let text = String::from_utf8(data.to_vec())
                    .map_err(|_| Error::InvalidFileFormat("meta item is not UTF-8".into()))?;
                Ok(MetaValue::Text(text))
            }
            MetaItemFileType::Unknown => match String::from_utf8(data.to_vec()) {
                Ok(text) => Ok(MetaValue::Text(text)),
                Err(_) => Ok(MetaValue::Bytes(data.to_vec())),
            },
        }
    }

    pub fn encode(&self, value: &MetaValue) -> Result<Vec<u8>> {
        match (self, value) {
            (MetaItemFileType::Json, MetaValue::Json(v)) => Ok(serde_json::to_vec(v)?),
            (MetaItemFileType::Wkt, MetaValue::Text(v)) => Ok(normalise_wkt(v).into_bytes()),
            (_, MetaValue::Text(v)) => Ok(v.clone().into_bytes()),
            (_, MetaValue::Bytes(v)) => Ok(v.clone()),
            (file_type, value) => Err(Error::InvalidOperation(format!(
                "can't encode {value:?} as a {file_type:?} meta item"
            ))),
        }
    }
}

/// Different meta-items have different levels of user-visibility.
/// This is not a security model; the user can view or edit any meta-item they
/// want if they try hard enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetaItemVisibility {
    /// Specific to how the dataset is encoded here; not part of the dataset's
    /// own data, and not shown or preserved on rewrite.
    InternalOnly = 1,
    /// Not shown (eg in diffs), but preserved if the dataset is rewritten.
    Hidden = 2,
    /// Shown but not (easily) editable.
    Visible = 3,
    /// Shown and editable.
    Editable = 4,
}

// -------------------------------------------------------------------------------------------------
// meta item registry
// -------------------------------------------------------------------------------------------------
pub struct MetaItemDefinition {
    pub path: Option<&'static str>,
    pub pattern: Option<&'static Regex>,
    pub file_type: MetaItemFileType,
    pub visibility: MetaItemVisibility,
}

impl MetaItemDefinition {
    pub fn matches(&self, meta_item_path: &str) -> bool {
        match (self.path, self.pattern) {
            (Some(path), _) => path == meta_item_path,
            (None, Some(pattern)) => pattern.is_match(meta_item_path),
            _ => false,
        }
    }

    /// The first capture group of the pattern, eg the CRS identifier in
    /// `crs/EPSG:4326.wkt`.
    pub fn match_group1(&self, meta_item_path: &str) -> Option<String> {
        self.pattern?
            .captures(meta_item_path)
            .map(|c| c[1].to_string())
    }
}

lazy_static! {
    static ref CRS_PATTERN: Regex = Regex::new(r"^crs/(.*)\.wkt$").unwrap();
    static ref LEGEND_PATTERN: Regex = Regex::new(r"^legend/(.*)$").unwrap();
}

/// The dataset's name / title:
pub const TITLE: MetaItemDefinition = MetaItemDefinition {
    path: Some("title"),
    pattern: None,
    file_type: MetaItemFileType::Text,
    visibility: MetaItemVisibility::Editable,
};

/// A longer description about the dataset's contents:
pub const DESCRIPTION: MetaItemDefinition = MetaItemDefinition {
    path: Some("description"),
    pattern: None,
    file_type: MetaItemFileType::Text,
    visibility: MetaItemVisibility::Editable,
};

/// A list of tags - each tag is free form text.
pub const TAGS_JSON: MetaItemDefinition = MetaItemDefinition {
    path: Some("tags.json"),
    pattern: None,
    file_type: MetaItemFileType::Json,
    visibility: MetaItemVisibility::Editable,
};

/// JSON representation of the dataset's schema.
pub const SCHEMA_JSON: MetaItemDefinition = MetaItemDefinition {
    path: Some("schema.json"),
    pattern: None,
    file_type: MetaItemFileType::Json,
    visibility: MetaItemVisibility::Editable,
};

/// XML metadata about the dataset.
pub const METADATA_XML: MetaItemDefinition = MetaItemDefinition {
    path: Some("metadata.xml"),
    pattern: None,
    file_type: MetaItemFileType::Xml,
    visibility: MetaItemVisibility::Editable,
};

/// How automatically generated PKs have been assigned so far:
pub const GENERATED_PKS: MetaItemDefinition = MetaItemDefinition {
    path: Some("generated-pks.json"),
    pattern: None,
    file_type: MetaItemFileType::Json,
    visibility: MetaItemVisibility::Hidden,
};

/// How primary keys are converted to feature paths:
pub const PATH_STRUCTURE: MetaItemDefinition = MetaItemDefinition {
    path: Some("path-structure.json"),
    pattern: None,
    file_type: MetaItemFileType::Json,
    visibility: MetaItemVisibility::InternalOnly,
};

lazy_static! {
    /// Any number of named CRS definitions in well-known-text:
    pub static ref CRS_DEFINITIONS: MetaItemDefinition = MetaItemDefinition {
        path: None,
        pattern: Some(&*CRS_PATTERN),
        file_type: MetaItemFileType::Wkt,
        visibility: MetaItemVisibility::Editable,
    };

    /// Legends are used to help decode each feature:
    pub static ref LEGEND: MetaItemDefinition = MetaItemDefinition {
        path: None,
        pattern: Some(&*LEGEND_PATTERN),
        file_type: MetaItemFileType::Bytes,
        visibility: MetaItemVisibility::InternalOnly,
    };

    static ref ALL_DEFINITIONS: Vec<&'static MetaItemDefinition> = vec![
        &TITLE,
        &DESCRIPTION,
        &TAGS_JSON,
        &SCHEMA_JSON,
        &METADATA_XML,
        &GENERATED_PKS,
        &PATH_STRUCTURE,
        &CRS_DEFINITIONS,
        &LEGEND,
    ];
}

/// This meta-item is stored in the "attachment" area, alongside the dataset,
/// rather than inside it. Storing it in this unusual location adds complexity
/// without solving any problems, so datasets designed after table.v3 don't do
/// this - but this one must stay readable where it is.
pub const ATTACHMENT_META_ITEMS: &[&str] = &["metadata.xml"];

pub fn definition_for(meta_item_path: &str) -> Option<&'static MetaItemDefinition> {
    ALL_DEFINITIONS.iter().copied().find(|d| d.matches(meta_item_path))
}

pub fn file_type_for(meta_item_path: &str) -> MetaItemFileType {
    definition_for(meta_item_path)
        .map(|d| d.file_type)
        .or_else(|| MetaItemFileType::from_suffix(meta_item_path))
        .unwrap_or(MetaItemFileType::Unknown)
}

pub fn visibility_for(meta_item_path: &str) -> MetaItemVisibility {
    definition_for(meta_item_path)
        .map(|d| d.visibility)
        .unwrap_or(MetaItemVisibility::Editable)
}

/// Decode a meta item's stored bytes to its canonical value. `schema.json` is
/// normalised through [`Schema`] so that equal schemas compare equal however
/// they were spelled; `tags.json` is checked to be a list of strings.
pub fn decode_meta_item(name: &str, data: &[u8]) -> Result<MetaValue> {
    if SCHEMA_JSON.matches(name) {
        let schema = Schema::loads(data)?;
        return Ok(MetaValue::Json(schema.to_json()));
    }
    let value = file_type_for(name).decode(data)?;
    if TAGS_JSON.matches(name) {
        check_tags(value.as_json().expect("tags.json decodes as JSON"))?;
    }
    Ok(value)
}

/// Encode a canonical meta value back to stored bytes.
pub fn encode_meta_item(name: &str, value: &MetaValue) -> Result<Vec<u8>> {
    if SCHEMA_JSON.matches(name) {
        let json = value.as_json().ok_or_else(|| {
            Error::InvalidOperation("schema.json must be a JSON meta item".into())
        })?;
        return Ok(Schema::from_json(json)?.dumps());
    }
    if TAGS_JSON.matches(name) {
        if let Some(json) = value.as_json() {
            check_tags(json)?;
        }
    }
    file_type_for(name).encode(value)
}

fn check_tags(value: &serde_json::Value) -> Result<()> {
    let ok = value
        .as_array()
        .map_or(false, |tags| tags.iter().all(|t| t.is_string()));
    if !ok {
        return Err(Error::InvalidOperation(
            "tags.json should be a list of strings".into(),
        ));
    }
    Ok(())
}
