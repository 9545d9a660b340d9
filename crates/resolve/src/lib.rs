//! Tabula reference engine: collect reference lookups across a whole batch,
//! fetch them with one search per (resource, unique field) pair, then
//! substitute per document.

#![forbid(unsafe_code)]

use std::time::Instant;

use futures::future::join_all;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, warn};

use tabula_core::{reserved, CollectionSchema, Document, ErrorList, FieldType};
use tabula_storehub::{ResourceQuery, ResourceStore, SchemaCache};

/// A resolvable top-level reference field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefField {
    pub field_id: String,
    pub resource: String,
}

/// Lookup state for one resource: distinct values per unique field going
/// out, fetched records coming back. Records land in one flat list, so a
/// record fetched via one unique field also serves lookups against another.
#[derive(Debug, Default)]
pub struct ResourceLookups {
    values: FxHashMap<String, Vec<Value>>,
    items: Vec<Document>,
}

/// Batch-scoped buffer for the two-pass algorithm: built by `collect`,
/// populated by `resolve`, read by `apply`, then discarded with the batch.
#[derive(Debug, Default)]
pub struct RefBuffer {
    by_resource: FxHashMap<String, ResourceLookups>,
}

impl RefBuffer {
    fn record(&mut self, resource: &str, unique_field: &str, value: &Value) {
        match value {
            Value::Null | Value::Object(_) => {}
            Value::Array(elements) => {
                for el in elements {
                    self.record_scalar(resource, unique_field, el);
                }
            }
            scalar => self.record_scalar(resource, unique_field, scalar),
        }
    }

    fn record_scalar(&mut self, resource: &str, unique_field: &str, value: &Value) {
        if value.is_null() || value.is_object() || value.is_array() {
            return;
        }
        let values = self
            .by_resource
            .entry(resource.to_string())
            .or_default()
            .values
            .entry(unique_field.to_string())
            .or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.clone());
        }
    }

    /// Seed fetched records directly; `resolve` is the production path.
    pub fn add_items(&mut self, resource: &str, items: Vec<Document>) {
        self.by_resource.entry(resource.to_string()).or_default().items.extend(items);
    }

    pub fn items(&self, resource: &str) -> &[Document] {
        self.by_resource.get(resource).map(|l| l.items.as_slice()).unwrap_or(&[])
    }

    /// Distinct values pending for one (resource, unique field) pair.
    pub fn values(&self, resource: &str, unique_field: &str) -> &[Value] {
        self.by_resource
            .get(resource)
            .and_then(|l| l.values.get(unique_field))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Number of pending (resource, unique field) lookups.
    pub fn lookups(&self) -> usize {
        self.by_resource.values().map(|l| l.values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }
}

/// Reference resolution for one collection's batch.
pub struct ReferenceResolver {
    fields: Vec<RefField>,
}

impl ReferenceResolver {
    pub fn new(fields: Vec<RefField>) -> Self {
        Self { fields }
    }

    /// Scan the schema's top-level fields for resolvable references.
    ///
    /// A reference is accepted only when the target schema loads and is not
    /// abstract. Contained sub-schemas stay opaque here: references inside
    /// them are structural content, not lookups.
    pub async fn discover(schema: &CollectionSchema, cache: &mut SchemaCache<'_>) -> Self {
        let mut fields = Vec::new();
        for (name, def) in &schema.fields {
            let FieldType::Resource { resource } = &def.kind else { continue };
            match cache.get(resource).await {
                Ok(target) if !target.is_abstract => {
                    fields.push(RefField { field_id: name.clone(), resource: resource.clone() });
                }
                Ok(_) => {
                    debug!(field = %name, resource = %resource, "reference to abstract resource; not resolvable");
                }
                Err(e) => {
                    warn!(field = %name, resource = %resource, error = %e, "reference target schema unavailable; field left unresolved");
                }
            }
        }
        Self { fields }
    }

    pub fn fields(&self) -> &[RefField] {
        &self.fields
    }

    fn field(&self, id: &str) -> Option<&RefField> {
        self.fields.iter().find(|f| f.field_id == id)
    }

    /// Pass 1: gather distinct lookup values across the batch. No I/O.
    ///
    /// `Base.Unique` keys collect under that unique field; exact reference
    /// fields collect under `Key`. Array values contribute every element;
    /// nulls and objects are not lookup values. Keys with deeper dot paths
    /// are not reference syntax and are ignored.
    pub fn collect(&self, docs: &[Document]) -> RefBuffer {
        let mut buffer = RefBuffer::default();
        if self.fields.is_empty() {
            return buffer;
        }
        for doc in docs {
            for (key, value) in doc.iter() {
                let parts: Vec<&str> = key.split('.').collect();
                match parts.as_slice() {
                    [field] => {
                        if let Some(rf) = self.field(field) {
                            buffer.record(&rf.resource, reserved::KEY, value);
                        }
                    }
                    [base, unique] => {
                        if let Some(rf) = self.field(base) {
                            buffer.record(&rf.resource, unique, value);
                        }
                    }
                    _ => {}
                }
            }
        }
        buffer
    }

    /// Pass 2: one concurrent search per (resource, unique field) pair,
    /// fan-in before substitution starts.
    ///
    /// A failed search is logged and dropped; its lookups resolve as not
    /// found and surface per document as broken references.
    pub async fn resolve(&self, buffer: &mut RefBuffer, store: &dyn ResourceStore) {
        let t0 = Instant::now();
        let mut jobs: Vec<(String, String, Vec<Value>, Vec<String>)> = Vec::new();
        for (resource, lookups) in buffer.by_resource.iter() {
            let mut identity: Vec<String> = vec![reserved::KEY.to_string()];
            for field in lookups.values.keys() {
                if field != reserved::KEY {
                    identity.push(field.clone());
                }
            }
            identity.sort();
            for (field, values) in lookups.values.iter() {
                jobs.push((resource.clone(), field.clone(), values.clone(), identity.clone()));
            }
        }
        if jobs.is_empty() {
            return;
        }
        let searches = jobs.len();
        let results = join_all(jobs.into_iter().map(|(resource, field, values, fields)| {
            async move {
                let query = ResourceQuery {
                    unique_field_id: field.clone(),
                    page_size: values.len(),
                    unique_field_list: values,
                    fields,
                };
                let outcome = store.search(&resource, query).await;
                (resource, field, outcome)
            }
        }))
        .await;
        for (resource, field, outcome) in results {
            match outcome {
                Ok(page) => {
                    if let Some(lookups) = buffer.by_resource.get_mut(&resource) {
                        lookups.items.extend(page.objects);
                    }
                }
                Err(e) => {
                    counter!("resolve_search_failures_total", 1u64);
                    warn!(resource = %resource, field = %field, error = %e, "resource search failed; lookups resolve as not found");
                }
            }
        }
        counter!("resolve_searches_total", searches as u64);
        histogram!("resolve_fanout_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(searches, took_ms = %t0.elapsed().as_millis(), "reference fan-out done");
    }

    /// Substitute and check one document against the populated buffer.
    ///
    /// Dot-annotation keys are always consumed: on a hit the base field
    /// becomes the record's canonical key, on a miss it becomes the empty
    /// string plus a broken-reference error. Exact reference fields are
    /// checked against fetched keys but never rewritten.
    pub fn apply(&self, buffer: &RefBuffer, doc: &mut Document) -> ErrorList {
        let mut errors = ErrorList::new();
        if self.fields.is_empty() {
            return errors;
        }
        let keys: Vec<String> = doc.iter().map(|(k, _)| k.clone()).collect();
        for key in keys {
            let parts: Vec<&str> = key.split('.').collect();
            match parts.as_slice() {
                [field] => {
                    let Some(rf) = self.field(field) else { continue };
                    let Some(value) = doc.get(field) else { continue };
                    match value {
                        Value::Null | Value::Object(_) => {}
                        Value::Array(elements) => {
                            let any_missing = elements.iter().any(|el| {
                                !el.is_null()
                                    && !el.is_object()
                                    && !el.is_array()
                                    && find_item(buffer.items(&rf.resource), reserved::KEY, el)
                                        .is_none()
                            });
                            if any_missing {
                                errors.push(broken_reference(field));
                            }
                        }
                        scalar => {
                            if find_item(buffer.items(&rf.resource), reserved::KEY, scalar)
                                .is_none()
                            {
                                errors.push(broken_reference(field));
                            }
                        }
                    }
                }
                [base, unique] => {
                    let Some(rf) = self.field(base) else { continue };
                    let looked_up = doc.get(&key).cloned().unwrap_or(Value::Null);
                    let resolved = find_item(buffer.items(&rf.resource), unique, &looked_up)
                        .and_then(|item| item.get_str(reserved::KEY))
                        .map(str::to_owned);
                    let base_field = base.to_string();
                    match resolved {
                        Some(canonical) => {
                            doc.insert(base_field, canonical);
                        }
                        None => {
                            errors.push(broken_reference(&base_field));
                            doc.insert(base_field, "");
                        }
                    }
                    doc.remove(&key);
                }
                _ => {}
            }
        }
        errors
    }
}

fn find_item<'a>(items: &'a [Document], field: &str, value: &Value) -> Option<&'a Document> {
    if value.is_null() {
        return None;
    }
    items.iter().find(|item| item.get(field) == Some(value))
}

fn broken_reference(field: &str) -> String {
    format!("Field {field} contains broken reference")
}
