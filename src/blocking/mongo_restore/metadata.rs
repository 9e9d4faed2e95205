//! `<coll>.metadata.json` files, which carry collection options, index specs and the
//! collection uuid in extended json.

use super::intent::Namespace;
use crate::blocking::DataSource;
use crate::error::{RestoreError, Result};
use crate::NAMESPACE_KEY;
use bson::{Bson, Document};
use std::convert::TryFrom;
use std::io::Read;
use uuid::Uuid;

/// Longest full index name (`<db>.<coll>.$<name>`) the server accepts.
pub const MAX_INDEX_NAME_LEN: usize = 127;

const ID_INDEX_NAME: &str = "_id_";

/// Parsed content of a metadata file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionMetadata {
    /// options passed to `create`.
    pub options: Document,
    /// index specs, the `_id` index included.
    pub indexes: Vec<Document>,
    /// uuid of the dumped collection.
    pub uuid: Option<Uuid>,
}

impl CollectionMetadata {
    /// Read and parse metadata from `source`.
    pub fn read(source: &dyn DataSource) -> Result<CollectionMetadata> {
        let mut data = vec![];
        source.open()?.read_to_end(&mut data)?;
        CollectionMetadata::parse(&data, &source.location())
    }

    /// Parse metadata file content, `location` is only used in error messages.
    pub fn parse(data: &[u8], location: &str) -> Result<CollectionMetadata> {
        let json: serde_json::Value =
            serde_json::from_slice(data).map_err(|source| RestoreError::MetadataError {
                path: location.to_string(),
                source,
            })?;
        let doc = match Bson::try_from(json)? {
            Bson::Document(d) => d,
            _ => {
                return Err(RestoreError::ConfigError(format!(
                    "metadata file {} doesn't hold a json object",
                    location
                )))
            }
        };

        let options = match doc.get("options") {
            Some(Bson::Document(options)) => options.clone(),
            _ => Document::new(),
        };
        let mut indexes = vec![];
        if let Some(Bson::Array(specs)) = doc.get("indexes") {
            for spec in specs {
                if let Bson::Document(spec) = spec {
                    indexes.push(spec.clone());
                }
            }
        }
        let uuid = match doc.get("uuid") {
            Some(Bson::String(uuid)) => Some(Uuid::parse_str(uuid).map_err(|e| {
                RestoreError::ConfigError(format!("invalid uuid {:?} in {}: {}", uuid, location, e))
            })?),
            _ => None,
        };
        Ok(CollectionMetadata {
            options,
            indexes,
            uuid,
        })
    }

    /// the `_id` index spec, without the legacy `ns` field.
    pub fn id_index(&self) -> Option<Document> {
        self.indexes
            .iter()
            .find(|spec| is_id_index(spec))
            .map(strip_namespace)
    }

    /// every index except the `_id` index, without the legacy `ns` field.
    pub fn secondary_indexes(&self) -> Vec<Document> {
        self.indexes
            .iter()
            .filter(|spec| !is_id_index(spec))
            .map(strip_namespace)
            .collect()
    }
}

/// Index specs of `ns` found in a legacy `system.indexes` catalog.
pub fn indexes_from_catalog(catalog: &[Document], ns: &Namespace) -> Vec<Document> {
    let ns = ns.to_string();
    catalog
        .iter()
        .filter(|spec| spec.get_str(NAMESPACE_KEY).map(|v| v == ns).unwrap_or(false))
        .cloned()
        .collect()
}

/// true if `spec` describes the `_id` index.
pub fn is_id_index(spec: &Document) -> bool {
    if let Ok(name) = spec.get_str("name") {
        return name == ID_INDEX_NAME;
    }
    match spec.get_document("key") {
        Ok(key) => key.len() == 1 && key.contains_key("_id"),
        Err(_) => false,
    }
}

/// Give `spec` a name when it has none, the way the server names indexes: `<field>_<value>`
/// joined with `_`.
pub fn ensure_index_name(spec: &mut Document) {
    if spec.contains_key("name") {
        return;
    }
    let name = match spec.get_document("key") {
        Ok(key) => key
            .iter()
            .map(|(field, value)| match value {
                Bson::String(s) => format!("{}_{}", field, s),
                Bson::Int32(n) => format!("{}_{}", field, n),
                Bson::Int64(n) => format!("{}_{}", field, n),
                Bson::Double(n) => format!("{}_{}", field, n),
                other => format!("{}_{}", field, other),
            })
            .collect::<Vec<_>>()
            .join("_"),
        Err(_) => return,
    };
    spec.insert("name", name);
}

/// Check the full name of index `spec` on `ns` fits the server limit.
pub fn check_index_name(ns: &Namespace, spec: &Document) -> Result<()> {
    let name = spec.get_str("name").unwrap_or_default();
    let full_name = format!("{}.${}", ns, name);
    if full_name.len() > MAX_INDEX_NAME_LEN {
        return Err(RestoreError::IndexNameTooLong {
            len: full_name.len(),
            full_name,
        });
    }
    Ok(())
}

fn strip_namespace(spec: &Document) -> Document {
    let mut spec = spec.clone();
    spec.remove(NAMESPACE_KEY);
    spec
}
