//! Tabula store seams: async traits for the document store and the resources
//! service, in-memory implementations, and the per-batch schema cache.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use tabula_core::{
    reserved, CollectionSchema, Document, FieldDef, FieldMap, FieldType, TabulaError, TabulaResult,
};

/// Equality filters over stored documents, with optional paging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub filters: BTreeMap<String, Value>,
    pub page_size: Option<usize>,
}

/// One batched reference lookup: every collected value for one unique field
/// of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuery {
    pub unique_field_id: String,
    pub unique_field_list: Vec<Value>,
    /// Identity fields to project into the returned records.
    pub fields: Vec<String>,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPage {
    pub objects: Vec<Document>,
    pub count: usize,
}

/// The remote document store: schema lookup, search, writes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_collection_schema(
        &self,
        collection: &str,
    ) -> TabulaResult<Option<CollectionSchema>>;

    async fn search(&self, collection: &str, criteria: SearchCriteria) -> TabulaResult<SearchPage>;

    /// Insert or replace by `Key`. Implementations stamp `CreationDateTime`
    /// and `ModificationDateTime` and return the record as stored.
    async fn upsert(&self, collection: &str, doc: Document) -> TabulaResult<Document>;
}

/// The resources service where reference targets live.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_by_key(&self, resource: &str, key: &str) -> TabulaResult<Option<Document>>;

    async fn get_by_unique_field(
        &self,
        resource: &str,
        field_id: &str,
        value: &Value,
    ) -> TabulaResult<Option<Document>>;

    /// Batched lookup; one call covers every collected value for one field.
    async fn search(&self, resource: &str, query: ResourceQuery) -> TabulaResult<SearchPage>;
}

// ----------------- in-memory implementation -----------------

/// One store serving both seams. Backs tests and the CLI fixture mode; both
/// collections and resources are plain record maps here.
#[derive(Default)]
pub struct MemoryHub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    schemas: BTreeMap<String, CollectionSchema>,
    records: BTreeMap<String, BTreeMap<String, Document>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_schema(&self, schema: CollectionSchema) {
        self.inner.lock().await.schemas.insert(schema.name.clone(), schema);
    }

    /// Seed a record directly, bypassing validation. The record must carry a key.
    pub async fn seed(&self, collection: &str, doc: Document) -> TabulaResult<()> {
        let key = doc
            .key()
            .ok_or_else(|| {
                TabulaError::Store(format!("seeding {collection} requires a document Key"))
            })?
            .to_owned();
        self.inner
            .lock()
            .await
            .records
            .entry(collection.to_string())
            .or_default()
            .insert(key, doc);
        Ok(())
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.inner.lock().await.records.get(collection).map(|m| m.len()).unwrap_or(0)
    }

    /// Snapshot everything the hub holds, for export.
    pub async fn dump(&self) -> (Vec<CollectionSchema>, BTreeMap<String, Vec<Document>>) {
        let inner = self.inner.lock().await;
        let schemas = inner.schemas.values().cloned().collect();
        let documents = inner
            .records
            .iter()
            .map(|(name, docs)| (name.clone(), docs.values().cloned().collect()))
            .collect();
        (schemas, documents)
    }
}

#[async_trait]
impl DocumentStore for MemoryHub {
    async fn find_collection_schema(
        &self,
        collection: &str,
    ) -> TabulaResult<Option<CollectionSchema>> {
        Ok(self.inner.lock().await.schemas.get(collection).cloned())
    }

    async fn search(&self, collection: &str, criteria: SearchCriteria) -> TabulaResult<SearchPage> {
        let inner = self.inner.lock().await;
        let matched: Vec<Document> = inner
            .records
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|doc| criteria.filters.iter().all(|(f, v)| doc.get(f) == Some(v)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let count = matched.len();
        let objects = match criteria.page_size {
            Some(limit) => matched.into_iter().take(limit).collect(),
            None => matched,
        };
        Ok(SearchPage { objects, count })
    }

    async fn upsert(&self, collection: &str, mut doc: Document) -> TabulaResult<Document> {
        let key = doc
            .key()
            .ok_or_else(|| {
                TabulaError::Store(format!("upsert into {collection} requires a document Key"))
            })?
            .to_owned();
        let now = Utc::now().to_rfc3339();
        let mut inner = self.inner.lock().await;
        let records = inner.records.entry(collection.to_string()).or_default();
        // Stamps are server-owned: creation survives updates, modification moves.
        match records.get(&key).and_then(|prev| prev.get(reserved::CREATION_DATE_TIME).cloned()) {
            Some(created) => doc.insert(reserved::CREATION_DATE_TIME, created),
            None => doc.insert(reserved::CREATION_DATE_TIME, now.clone()),
        };
        doc.insert(reserved::MODIFICATION_DATE_TIME, now);
        records.insert(key, doc.clone());
        Ok(doc)
    }
}

#[async_trait]
impl ResourceStore for MemoryHub {
    async fn get_by_key(&self, resource: &str, key: &str) -> TabulaResult<Option<Document>> {
        Ok(self.inner.lock().await.records.get(resource).and_then(|m| m.get(key)).cloned())
    }

    async fn get_by_unique_field(
        &self,
        resource: &str,
        field_id: &str,
        value: &Value,
    ) -> TabulaResult<Option<Document>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(resource)
            .and_then(|m| m.values().find(|doc| doc.get(field_id) == Some(value)))
            .cloned())
    }

    async fn search(&self, resource: &str, query: ResourceQuery) -> TabulaResult<SearchPage> {
        let inner = self.inner.lock().await;
        let matched: Vec<&Document> = inner
            .records
            .get(resource)
            .map(|records| {
                records
                    .values()
                    .filter(|doc| {
                        doc.get(&query.unique_field_id)
                            .map(|v| query.unique_field_list.contains(v))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let count = matched.len();
        let objects = matched
            .into_iter()
            .take(query.page_size)
            .map(|doc| project(doc, &query.fields))
            .collect();
        Ok(SearchPage { objects, count })
    }
}

fn project(doc: &Document, fields: &[String]) -> Document {
    if fields.is_empty() {
        return doc.clone();
    }
    let mut slim = Document::new();
    for f in fields {
        if let Some(v) = doc.get(f) {
            slim.insert(f.clone(), v.clone());
        }
    }
    slim
}

// ----------------- schema cache -----------------

/// Per-batch memo of hydrated schemas. Build one per request and drop it
/// with the batch; schema edits made between batches are always picked up
/// because nothing here outlives the call.
pub struct SchemaCache<'a> {
    store: &'a dyn DocumentStore,
    cached: HashMap<String, Arc<CollectionSchema>>,
}

impl<'a> SchemaCache<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store, cached: HashMap::new() }
    }

    /// Fetch a schema, splice in contained sub-schemas, memoize the result.
    /// Each distinct name is fetched from the store at most once per batch.
    pub async fn get(&mut self, collection: &str) -> TabulaResult<Arc<CollectionSchema>> {
        if let Some(schema) = self.cached.get(collection) {
            return Ok(schema.clone());
        }
        // Fetch the transitive closure of contained schemas up front so that
        // hydration itself is a pure tree rewrite.
        let mut fetched: HashMap<String, CollectionSchema> = HashMap::new();
        let mut pending = vec![collection.to_string()];
        while let Some(name) = pending.pop() {
            if fetched.contains_key(&name) || self.cached.contains_key(&name) {
                continue;
            }
            let schema = self
                .store
                .find_collection_schema(&name)
                .await?
                .ok_or_else(|| TabulaError::NotFound(format!("collection schema {name}")))?;
            contained_names(&schema.fields, &mut pending);
            fetched.insert(name, schema);
        }
        debug!(collection, closure = fetched.len(), "schema cache: closure fetched");

        let root = fetched
            .get(collection)
            .cloned()
            .ok_or_else(|| TabulaError::Internal(format!("schema closure lost {collection}")))?;
        let mut active = vec![collection.to_string()];
        let fields = self.hydrate_fields(&root.fields, &fetched, &mut active)?;
        let schema = Arc::new(CollectionSchema { fields, ..root });
        self.cached.insert(collection.to_string(), schema.clone());
        Ok(schema)
    }

    fn hydrate_fields(
        &self,
        fields: &FieldMap,
        fetched: &HashMap<String, CollectionSchema>,
        active: &mut Vec<String>,
    ) -> TabulaResult<FieldMap> {
        let mut out = FieldMap::new();
        for (name, def) in fields {
            out.insert(name.clone(), self.hydrate_def(def, fetched, active)?);
        }
        Ok(out)
    }

    fn hydrate_def(
        &self,
        def: &FieldDef,
        fetched: &HashMap<String, CollectionSchema>,
        active: &mut Vec<String>,
    ) -> TabulaResult<FieldDef> {
        let kind = match &def.kind {
            FieldType::ContainedResource { resource, fields } => {
                let inner = if fields.is_empty() {
                    if active.iter().any(|a| a == resource) {
                        return Err(TabulaError::Schema(format!(
                            "containment cycle: {} -> {resource}",
                            active.join(" -> ")
                        )));
                    }
                    let source = self
                        .cached
                        .get(resource.as_str())
                        .map(|s| s.fields.clone())
                        .or_else(|| fetched.get(resource.as_str()).map(|s| s.fields.clone()))
                        .ok_or_else(|| {
                            TabulaError::NotFound(format!("contained schema {resource}"))
                        })?;
                    active.push(resource.clone());
                    let hydrated = self.hydrate_fields(&source, fetched, active)?;
                    active.pop();
                    hydrated
                } else {
                    // Authored inline; still walk it for deeper containment.
                    self.hydrate_fields(fields, fetched, active)?
                };
                FieldType::ContainedResource { resource: resource.clone(), fields: inner }
            }
            FieldType::Object { fields } => {
                FieldType::Object { fields: self.hydrate_fields(fields, fetched, active)? }
            }
            FieldType::Array { items } => {
                FieldType::Array { items: Box::new(self.hydrate_def(items, fetched, active)?) }
            }
            other => other.clone(),
        };
        Ok(FieldDef {
            kind,
            mandatory: def.mandatory,
            optional_values: def.optional_values.clone(),
            extended: def.extended,
        })
    }
}

fn contained_names(fields: &FieldMap, out: &mut Vec<String>) {
    for def in fields.values() {
        contained_names_def(def, out);
    }
}

fn contained_names_def(def: &FieldDef, out: &mut Vec<String>) {
    match &def.kind {
        FieldType::ContainedResource { resource, fields } => {
            if fields.is_empty() {
                out.push(resource.clone());
            } else {
                contained_names(fields, out);
            }
        }
        FieldType::Object { fields } => contained_names(fields, out),
        FieldType::Array { items } => contained_names_def(items, out),
        _ => {}
    }
}
