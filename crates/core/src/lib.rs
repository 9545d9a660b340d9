//! Tabula core types: documents, field models, key policies, and errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Field names reserved by the platform on every stored document.
pub mod reserved {
    pub const KEY: &str = "Key";
    pub const HIDDEN: &str = "Hidden";
    pub const CREATION_DATE_TIME: &str = "CreationDateTime";
    pub const MODIFICATION_DATE_TIME: &str = "ModificationDateTime";

    pub const ALL: [&str; 4] = [KEY, HIDDEN, CREATION_DATE_TIME, MODIFICATION_DATE_TIME];
}

// ---- documents ----

/// A schemaless record: a JSON object whose shape is checked against a
/// [`CollectionSchema`] at save time, never at construction time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Accepts only JSON objects; scalars and arrays are not documents.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The canonical key, if present and non-empty.
    pub fn key(&self) -> Option<&str> {
        self.get_str(reserved::KEY).filter(|k| !k.is_empty())
    }

    /// Soft-delete marker. Only a literal JSON `true` counts.
    pub fn is_hidden(&self) -> bool {
        matches!(self.0.get(reserved::HIDDEN), Some(Value::Bool(true)))
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ---- field model ----

/// Field declarations keyed by field id, in stable order.
pub type FieldMap = BTreeMap<String, FieldDef>;

/// One declared field: a type plus the orthogonal knobs that apply to any type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(flatten)]
    pub kind: FieldType,
    #[serde(rename = "Mandatory", default, skip_serializing_if = "is_false")]
    pub mandatory: bool,
    /// Closed value list. Applies to `String` fields and to arrays of strings.
    #[serde(rename = "OptionalValues", default, skip_serializing_if = "Option::is_none")]
    pub optional_values: Option<Vec<String>>,
    /// Inherited from an abstract base collection; the base owns its validation.
    #[serde(rename = "Extended", default, skip_serializing_if = "is_false")]
    pub extended: bool,
}

impl FieldDef {
    pub fn of(kind: FieldType) -> Self {
        Self { kind, mandatory: false, optional_values: None, extended: false }
    }

    pub fn required(kind: FieldType) -> Self {
        Self { kind, mandatory: true, optional_values: None, extended: false }
    }

    pub fn with_values(mut self, values: &[&str]) -> Self {
        self.optional_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

/// The closed set of field types. Every consumer matches exhaustively, so a
/// new variant fails compilation everywhere it matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum FieldType {
    String,
    Integer,
    Double,
    Bool,
    DateTime,
    Array {
        #[serde(rename = "Items")]
        items: Box<FieldDef>,
    },
    Object {
        #[serde(rename = "Fields")]
        fields: FieldMap,
    },
    /// Cross-resource reference; holds canonical keys once resolved.
    Resource {
        #[serde(rename = "Resource")]
        resource: String,
    },
    /// Embedded sub-document described by another collection's schema.
    /// `fields` is empty until hydrated from that schema.
    ContainedResource {
        #[serde(rename = "Resource")]
        resource: String,
        #[serde(rename = "Fields", default)]
        fields: FieldMap,
    },
}

impl FieldType {
    /// Referenced resource name for the two reference-bearing variants.
    pub fn resource(&self) -> Option<&str> {
        match self {
            FieldType::Resource { resource } | FieldType::ContainedResource { resource, .. } => {
                Some(resource.as_str())
            }
            _ => None,
        }
    }
}

// ---- key policy ----

/// How a collection derives the canonical key for an incoming document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum DocumentKey {
    /// Caller must supply `Key` on every document.
    Key,
    #[default]
    AutoGenerate,
    /// Join the listed field values, in declared order, with the delimiter.
    Composite {
        #[serde(rename = "Fields")]
        fields: Vec<String>,
        #[serde(rename = "Delimiter", default)]
        delimiter: String,
    },
}

/// A collection's contract: name, key policy, and declared fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "DocumentKey", default)]
    pub document_key: DocumentKey,
    #[serde(rename = "Fields", default)]
    pub fields: FieldMap,
    /// Abstract collections hold no documents and cannot be reference targets.
    #[serde(rename = "Abstract", default, skip_serializing_if = "is_false")]
    pub is_abstract: bool,
}

impl CollectionSchema {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            document_key: DocumentKey::default(),
            fields: FieldMap::new(),
            is_abstract: false,
        }
    }

    pub fn with_key(mut self, key: DocumentKey) -> Self {
        self.document_key = key;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Resolve the canonical key for a document under the collection's policy.
///
/// An explicit non-empty `Key` always wins, regardless of policy. Composite
/// segments render scalars only; missing fields and non-scalars join as empty
/// segments. A key that still resolves empty is an error: documents are never
/// stored without one.
pub fn resolve_key(schema: &CollectionSchema, doc: &Document) -> TabulaResult<String> {
    if let Some(k) = doc.key() {
        return Ok(k.to_owned());
    }
    match &schema.document_key {
        DocumentKey::Key => Err(TabulaError::MissingKey(format!(
            "collection {} requires an explicit Key",
            schema.name
        ))),
        DocumentKey::AutoGenerate => Ok(Uuid::new_v4().to_string()),
        DocumentKey::Composite { fields, delimiter } => {
            let key = fields
                .iter()
                .map(|f| doc.get(f).map(key_segment).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(delimiter);
            if key.is_empty() {
                return Err(TabulaError::MissingKey(format!(
                    "composite key for collection {} resolved empty",
                    schema.name
                )));
            }
            Ok(key)
        }
    }
}

fn key_segment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

// ---- outcomes and errors ----

/// Per-document error list; most documents carry zero or one.
pub type ErrorList = SmallVec<[String; 4]>;

/// Verdict for one document. Errors are data, not control flow: a batch
/// never aborts because one record is malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: ErrorList,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self { valid: true, errors: ErrorList::new() }
    }

    pub fn from_errors(errors: ErrorList) -> Self {
        Self { valid: errors.is_empty(), errors }
    }
}

#[derive(Debug, Error)]
pub enum TabulaError {
    #[error("schema: {0}")]
    Schema(String),
    #[error("missing key: {0}")]
    MissingKey(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("store: {0}")]
    Store(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type TabulaResult<T> = Result<T, TabulaError>;

pub mod prelude {
    pub use super::{
        resolve_key, reserved, CollectionSchema, Document, DocumentKey, ErrorList, FieldDef,
        FieldMap, FieldType, TabulaError, TabulaResult, ValidationOutcome,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn composite(fields: &[&str], delimiter: &str) -> CollectionSchema {
        CollectionSchema::named("things").with_key(DocumentKey::Composite {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            delimiter: delimiter.into(),
        })
    }

    #[test]
    fn explicit_key_wins_over_policy() {
        let schema = CollectionSchema::named("things").with_key(DocumentKey::AutoGenerate);
        let d = doc(json!({"Key": "fixed", "Name": "x"}));
        assert_eq!(resolve_key(&schema, &d).unwrap(), "fixed");
    }

    #[test]
    fn empty_explicit_key_falls_through_to_policy() {
        let schema = CollectionSchema::named("things").with_key(DocumentKey::Key);
        let d = doc(json!({"Key": ""}));
        assert!(matches!(resolve_key(&schema, &d), Err(TabulaError::MissingKey(_))));
    }

    #[test]
    fn key_policy_rejects_missing_key() {
        let schema = CollectionSchema::named("things").with_key(DocumentKey::Key);
        let err = resolve_key(&schema, &doc(json!({"Name": "x"}))).unwrap_err();
        assert!(err.to_string().contains("things"));
    }

    #[test]
    fn autogenerate_produces_distinct_keys() {
        let schema = CollectionSchema::named("things").with_key(DocumentKey::AutoGenerate);
        let a = resolve_key(&schema, &doc(json!({}))).unwrap();
        let b = resolve_key(&schema, &doc(json!({}))).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn composite_joins_in_declared_order() {
        let schema = composite(&["A", "B"], "-");
        let d = doc(json!({"B": "y", "A": "x"}));
        assert_eq!(resolve_key(&schema, &d).unwrap(), "x-y");
    }

    #[test]
    fn composite_renders_scalars_and_blanks_the_rest() {
        let schema = composite(&["N", "Flag", "Obj"], "/");
        let d = doc(json!({"N": 7, "Flag": true, "Obj": {"nested": 1}}));
        assert_eq!(resolve_key(&schema, &d).unwrap(), "7/true/");
    }

    #[test]
    fn composite_missing_field_joins_empty() {
        let schema = composite(&["A", "B"], "-");
        assert_eq!(resolve_key(&schema, &doc(json!({"A": "x"}))).unwrap(), "x-");
    }

    #[test]
    fn composite_resolving_fully_empty_is_an_error() {
        let schema = composite(&["A"], "-");
        assert!(matches!(
            resolve_key(&schema, &doc(json!({}))),
            Err(TabulaError::MissingKey(_))
        ));
    }

    #[test]
    fn hidden_only_on_literal_true() {
        assert!(doc(json!({"Hidden": true})).is_hidden());
        assert!(!doc(json!({"Hidden": false})).is_hidden());
        assert!(!doc(json!({"Hidden": "true"})).is_hidden());
        assert!(!doc(json!({})).is_hidden());
    }

    #[test]
    fn field_defs_parse_wire_shape() {
        let def: FieldDef = serde_json::from_value(json!({
            "Type": "Array",
            "Items": {"Type": "String"},
            "Mandatory": true,
            "OptionalValues": ["Red", "Green"]
        }))
        .unwrap();
        assert!(def.mandatory);
        assert_eq!(def.optional_values.as_deref().unwrap().len(), 2);
        match def.kind {
            FieldType::Array { items } => assert_eq!(items.kind, FieldType::String),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn schemas_parse_wire_shape() {
        let schema: CollectionSchema = serde_json::from_value(json!({
            "Name": "tickets",
            "DocumentKey": {"Type": "Composite", "Fields": ["A", "B"], "Delimiter": "-"},
            "Fields": {
                "Owner": {"Type": "Resource", "Resource": "accounts"},
                "Detail": {"Type": "ContainedResource", "Resource": "details"}
            }
        }))
        .unwrap();
        assert_eq!(schema.name, "tickets");
        assert!(!schema.is_abstract);
        assert_eq!(schema.fields["Owner"].kind.resource(), Some("accounts"));
        match &schema.fields["Detail"].kind {
            FieldType::ContainedResource { fields, .. } => assert!(fields.is_empty()),
            other => panic!("expected contained resource, got {other:?}"),
        }
    }

    #[test]
    fn unit_field_types_round_trip() {
        let v = serde_json::to_value(FieldDef::of(FieldType::DateTime)).unwrap();
        assert_eq!(v, json!({"Type": "DateTime"}));
        let back: FieldDef = serde_json::from_value(v).unwrap();
        assert_eq!(back.kind, FieldType::DateTime);
    }
}
