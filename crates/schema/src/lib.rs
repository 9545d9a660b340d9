//! Tabula structural rules: compile a collection's field map into a JSON
//! Schema validator, plus the checks the draft cannot express.

#![forbid(unsafe_code)]

use chrono::DateTime;
use jsonschema::{Draft, JSONSchema};
use serde_json::{json, Map, Value};

use tabula_core::{
    reserved, CollectionSchema, Document, DocumentKey, ErrorList, FieldDef, FieldMap, FieldType,
    TabulaError, TabulaResult,
};

/// Build the draft-7 document schema for a collection's declared fields.
///
/// Base fields ride along on every collection: `Key` is required, the rest
/// are optional. Extended fields are omitted; the abstract base collection
/// that declared them owns their validation.
pub fn document_rules(fields: &FieldMap) -> Value {
    let (mut properties, mut required) = object_rule(fields);
    properties.insert(reserved::KEY.into(), json!({"type": "string"}));
    properties.insert(reserved::HIDDEN.into(), json!({"type": "boolean"}));
    properties.insert(reserved::CREATION_DATE_TIME.into(), json!({"type": "string"}));
    properties.insert(reserved::MODIFICATION_DATE_TIME.into(), json!({"type": "string"}));
    if !required.iter().any(|r| r == reserved::KEY) {
        required.push(reserved::KEY.into());
    }
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn object_rule(fields: &FieldMap) -> (Map<String, Value>, Vec<String>) {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for (name, def) in fields {
        if def.extended {
            continue;
        }
        properties.insert(name.clone(), field_rule(def));
        if def.mandatory {
            required.push(name.clone());
        }
    }
    (properties, required)
}

fn field_rule(def: &FieldDef) -> Value {
    match &def.kind {
        FieldType::String => match &def.optional_values {
            Some(values) => json!({"type": "string", "enum": values}),
            None => json!({"type": "string"}),
        },
        FieldType::Integer => json!({"type": "integer"}),
        FieldType::Double => json!({"type": "number"}),
        FieldType::Bool => json!({"type": "boolean"}),
        // RFC 3339 content is asserted by `check_datetime_value`; the draft's
        // `format` keyword is assertion-optional and cannot be relied on.
        FieldType::DateTime => json!({"type": "string"}),
        FieldType::Array { items } => {
            let element = match &def.optional_values {
                Some(values) => json!({"type": "string", "enum": values}),
                None => field_rule(items),
            };
            json!({"type": "array", "items": element})
        }
        FieldType::Object { fields } | FieldType::ContainedResource { fields, .. } => {
            nested_rule(fields)
        }
        // Reference content is owned by resolution; only presence is enforced
        // here, via `required` when the field is mandatory.
        FieldType::Resource { .. } => json!({}),
    }
}

fn nested_rule(fields: &FieldMap) -> Value {
    let (properties, required) = object_rule(fields);
    let mut rule = json!({"type": "object", "properties": properties});
    if !required.is_empty() {
        rule["required"] = json!(required);
    }
    rule
}

/// A collection's rules compiled once, checked per document.
pub struct StructuralValidator {
    schema_json: Value,
    fields: FieldMap,
    compiled: JSONSchema,
}

impl StructuralValidator {
    pub fn compile(schema: &CollectionSchema) -> TabulaResult<Self> {
        let schema_json = document_rules(&schema.fields);
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_json)
            .map_err(|e| {
                TabulaError::Schema(format!(
                    "collection {}: structural rules failed to compile: {e}",
                    schema.name
                ))
            })?;
        Ok(Self { schema_json, fields: schema.fields.clone(), compiled })
    }

    pub fn schema_json(&self) -> &Value {
        &self.schema_json
    }

    /// Grade one document. Violations accumulate; nothing is thrown.
    pub fn validate(&self, doc: &Document) -> ErrorList {
        let instance = doc.to_value();
        let mut errors = ErrorList::new();
        if let Err(violations) = self.compiled.validate(&instance) {
            for err in violations {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    errors.push(err.to_string());
                } else {
                    errors.push(format!("{path}: {err}"));
                }
            }
        }
        check_datetime_fields(&self.fields, &instance, "", &mut errors);
        for field in [reserved::CREATION_DATE_TIME, reserved::MODIFICATION_DATE_TIME] {
            if let Some(s) = instance.get(field).and_then(Value::as_str) {
                push_datetime_error(field, s, &mut errors);
            }
        }
        errors
    }
}

fn check_datetime_fields(fields: &FieldMap, value: &Value, path: &str, out: &mut ErrorList) {
    let Some(obj) = value.as_object() else { return };
    for (name, def) in fields {
        if def.extended {
            continue;
        }
        if let Some(v) = obj.get(name) {
            check_datetime_value(def, v, &join_path(path, name), out);
        }
    }
}

fn check_datetime_value(def: &FieldDef, value: &Value, path: &str, out: &mut ErrorList) {
    match &def.kind {
        FieldType::DateTime => {
            // Non-strings already fail the draft type rule; no second error.
            if let Some(s) = value.as_str() {
                push_datetime_error(path, s, out);
            }
        }
        FieldType::Array { items } => {
            if let Some(elements) = value.as_array() {
                for (i, el) in elements.iter().enumerate() {
                    check_datetime_value(items, el, &format!("{path}[{i}]"), out);
                }
            }
        }
        FieldType::Object { fields } | FieldType::ContainedResource { fields, .. } => {
            check_datetime_fields(fields, value, path, out);
        }
        _ => {}
    }
}

fn push_datetime_error(path: &str, raw: &str, out: &mut ErrorList) {
    if DateTime::parse_from_rfc3339(raw).is_err() {
        out.push(format!("{path}: \"{raw}\" is not an RFC 3339 date-time"));
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}.{name}")
    }
}

/// Reject contracts the engine cannot enforce, before any document is graded.
pub fn check_schema(schema: &CollectionSchema) -> TabulaResult<()> {
    if let DocumentKey::Composite { fields, .. } = &schema.document_key {
        if fields.is_empty() || fields.len() > 8 {
            return Err(schema_err(schema, "composite keys take between 1 and 8 fields"));
        }
        let mut seen = std::collections::HashSet::new();
        for f in fields {
            if !seen.insert(f.as_str()) {
                return Err(schema_err(schema, &format!("composite key repeats field {f}")));
            }
            if !schema.fields.contains_key(f) {
                return Err(schema_err(
                    schema,
                    &format!("composite key names undeclared field {f}"),
                ));
            }
        }
    }
    check_fields(&schema.name, "", &schema.fields)
}

fn check_fields(collection: &str, path: &str, fields: &FieldMap) -> TabulaResult<()> {
    for (name, def) in fields {
        check_def(collection, &join_path(path, name), def)?;
    }
    Ok(())
}

fn check_def(collection: &str, path: &str, def: &FieldDef) -> TabulaResult<()> {
    if let Some(values) = &def.optional_values {
        if values.is_empty() {
            return Err(field_err(collection, path, "enumerations list at least one value"));
        }
        let applies = match &def.kind {
            FieldType::String => true,
            FieldType::Array { items } => items.kind == FieldType::String,
            _ => false,
        };
        if !applies {
            return Err(field_err(
                collection,
                path,
                "enumerations apply to String fields or arrays of strings",
            ));
        }
    }
    match &def.kind {
        FieldType::Array { items } => {
            if matches!(items.kind, FieldType::Array { .. }) {
                return Err(field_err(collection, path, "array items must not be arrays"));
            }
            check_def(collection, path, items)
        }
        FieldType::Resource { resource } => {
            if resource.is_empty() {
                return Err(field_err(collection, path, "reference fields name a resource"));
            }
            Ok(())
        }
        FieldType::ContainedResource { resource, fields } => {
            if resource.is_empty() {
                return Err(field_err(collection, path, "contained fields name a resource"));
            }
            check_fields(collection, path, fields)
        }
        FieldType::Object { fields } => check_fields(collection, path, fields),
        _ => Ok(()),
    }
}

fn schema_err(schema: &CollectionSchema, msg: &str) -> TabulaError {
    TabulaError::Schema(format!("collection {}: {msg}", schema.name))
}

fn field_err(collection: &str, path: &str, msg: &str) -> TabulaError {
    TabulaError::Schema(format!("collection {collection}, field {path}: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabula_core::DocumentKey;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn one_field(name: &str, def: FieldDef) -> CollectionSchema {
        CollectionSchema::named("samples").with_field(name, def)
    }

    fn validator(schema: &CollectionSchema) -> StructuralValidator {
        StructuralValidator::compile(schema).unwrap()
    }

    #[test]
    fn missing_mandatory_field_is_one_error() {
        let schema = one_field("Name", FieldDef::required(FieldType::String));
        let v = validator(&schema);
        let errors = v.validate(&doc(json!({"Key": "k1"})));
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("Name"));
        assert!(v.validate(&doc(json!({"Key": "k1", "Name": "Acme"}))).is_empty());
    }

    #[test]
    fn key_is_always_required() {
        let schema = CollectionSchema::named("samples");
        let errors = validator(&schema).validate(&doc(json!({})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Key"));
    }

    #[test]
    fn scalar_type_mismatches_carry_the_field_path() {
        let schema = one_field("Count", FieldDef::of(FieldType::Integer));
        let errors = validator(&schema).validate(&doc(json!({"Key": "k", "Count": "three"})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("/Count:"), "{}", errors[0]);
    }

    #[test]
    fn double_accepts_integers_integer_rejects_fractions() {
        let schema = CollectionSchema::named("samples")
            .with_field("Rate", FieldDef::of(FieldType::Double))
            .with_field("Count", FieldDef::of(FieldType::Integer));
        let v = validator(&schema);
        assert!(v.validate(&doc(json!({"Key": "k", "Rate": 2}))).is_empty());
        let errors = v.validate(&doc(json!({"Key": "k", "Count": 2.5})));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn enum_violation_on_array_element_is_one_error() {
        let schema = one_field(
            "Colors",
            FieldDef::of(FieldType::Array { items: Box::new(FieldDef::of(FieldType::String)) })
                .with_values(&["Red", "Green"]),
        );
        let v = validator(&schema);
        assert!(v.validate(&doc(json!({"Key": "k", "Colors": ["Red", "Green"]}))).is_empty());
        let errors = v.validate(&doc(json!({"Key": "k", "Colors": ["Red", "Blue"]})));
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("/Colors/1"), "{}", errors[0]);
    }

    #[test]
    fn enum_applies_to_plain_strings() {
        let schema =
            one_field("State", FieldDef::of(FieldType::String).with_values(&["open", "closed"]));
        let errors = validator(&schema).validate(&doc(json!({"Key": "k", "State": "pending"})));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn extended_fields_are_not_graded_here() {
        let mut def = FieldDef::required(FieldType::String);
        def.extended = true;
        let schema = one_field("Inherited", def);
        let v = validator(&schema);
        assert!(v.validate(&doc(json!({"Key": "k"}))).is_empty());
        assert!(v.validate(&doc(json!({"Key": "k", "Inherited": 42}))).is_empty());
    }

    #[test]
    fn nested_object_rules_apply_in_place() {
        let mut address = FieldMap::new();
        address.insert("Street".into(), FieldDef::required(FieldType::String));
        address.insert("City".into(), FieldDef::of(FieldType::String));
        let schema = one_field("Address", FieldDef::of(FieldType::Object { fields: address }));
        let v = validator(&schema);
        // absent optional object: fine
        assert!(v.validate(&doc(json!({"Key": "k"}))).is_empty());
        let errors = v.validate(&doc(json!({"Key": "k", "Address": {"City": "Oslo"}})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("/Address:"), "{}", errors[0]);
    }

    #[test]
    fn datetime_values_must_be_rfc3339() {
        let schema = one_field("Due", FieldDef::of(FieldType::DateTime));
        let v = validator(&schema);
        assert!(v
            .validate(&doc(json!({"Key": "k", "Due": "2026-05-02T10:30:00Z"})))
            .is_empty());
        let errors = v.validate(&doc(json!({"Key": "k", "Due": "yesterday"})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Due"));
    }

    #[test]
    fn non_string_datetime_fails_once_not_twice() {
        let schema = one_field("Due", FieldDef::of(FieldType::DateTime));
        let errors = validator(&schema).validate(&doc(json!({"Key": "k", "Due": 5})));
        assert_eq!(errors.len(), 1, "{errors:?}");
    }

    #[test]
    fn datetime_inside_arrays_is_checked_per_element() {
        let schema = one_field(
            "Runs",
            FieldDef::of(FieldType::Array { items: Box::new(FieldDef::of(FieldType::DateTime)) }),
        );
        let errors = validator(&schema)
            .validate(&doc(json!({"Key": "k", "Runs": ["2026-01-01T00:00:00Z", "later"]})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Runs[1]"), "{}", errors[0]);
    }

    #[test]
    fn stamp_fields_are_checked_when_present() {
        let schema = CollectionSchema::named("samples");
        let errors = validator(&schema)
            .validate(&doc(json!({"Key": "k", "CreationDateTime": "not-a-time"})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("CreationDateTime"));
    }

    #[test]
    fn reference_fields_enforce_presence_only() {
        let schema = one_field(
            "Owner",
            FieldDef::required(FieldType::Resource { resource: "accounts".into() }),
        );
        let v = validator(&schema);
        let errors = v.validate(&doc(json!({"Key": "k"})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Owner"));
        // shape is resolution's concern; arrays of keys pass structurally
        assert!(v.validate(&doc(json!({"Key": "k", "Owner": ["a", "b"]}))).is_empty());
    }

    #[test]
    fn document_rules_include_base_fields() {
        let rules = document_rules(
            &one_field("Name", FieldDef::required(FieldType::String)).fields,
        );
        let required = rules["required"].as_array().unwrap();
        assert!(required.iter().any(|r| r == "Key"));
        assert!(required.iter().any(|r| r == "Name"));
        assert_eq!(rules["properties"]["Hidden"], json!({"type": "boolean"}));
    }

    #[test]
    fn composite_key_sanity_limits() {
        let mut schema = CollectionSchema::named("samples")
            .with_field("A", FieldDef::of(FieldType::String))
            .with_key(DocumentKey::Composite {
                fields: vec!["A".into(), "A".into()],
                delimiter: "-".into(),
            });
        assert!(check_schema(&schema).is_err());

        schema.document_key = DocumentKey::Composite {
            fields: (0..9).map(|i| format!("F{i}")).collect(),
            delimiter: "-".into(),
        };
        assert!(check_schema(&schema).is_err());

        schema.document_key =
            DocumentKey::Composite { fields: vec!["Missing".into()], delimiter: "-".into() };
        assert!(check_schema(&schema).is_err());

        schema.document_key =
            DocumentKey::Composite { fields: vec!["A".into()], delimiter: "-".into() };
        assert!(check_schema(&schema).is_ok());
    }

    #[test]
    fn nested_arrays_are_rejected() {
        let inner = FieldDef::of(FieldType::Array { items: Box::new(FieldDef::of(FieldType::String)) });
        let schema = one_field("Grid", FieldDef::of(FieldType::Array { items: Box::new(inner) }));
        assert!(check_schema(&schema).is_err());
    }

    #[test]
    fn enums_only_on_string_shapes() {
        let schema = one_field("N", FieldDef::of(FieldType::Integer).with_values(&["1"]));
        assert!(check_schema(&schema).is_err());
        let schema = one_field("S", FieldDef::of(FieldType::String).with_values(&[]));
        assert!(check_schema(&schema).is_err());
        let schema = one_field("S", FieldDef::of(FieldType::String).with_values(&["a"]));
        assert!(check_schema(&schema).is_ok());
    }

    #[test]
    fn references_name_a_resource() {
        let schema = one_field("Owner", FieldDef::of(FieldType::Resource { resource: "".into() }));
        assert!(check_schema(&schema).is_err());
    }
}
