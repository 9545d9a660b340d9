//! Tabula public API façade (in-process).
//!
//! This crate defines the stable trait request layers depend on, plus the
//! in-process engine wiring the schema cache, the reference engine, and
//! structural validation into one save pipeline.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use tabula_core::{resolve_key, reserved, ErrorList};
use tabula_resolve::ReferenceResolver;
use tabula_schema::{check_schema, StructuralValidator};
use tabula_storehub::{DocumentStore, ResourceStore, SchemaCache};

pub use tabula_core::{
    CollectionSchema, Document, TabulaError, TabulaResult, ValidationOutcome,
};
pub use tabula_storehub::{SearchCriteria, SearchPage};

/// One document's fate after a batch run: the (possibly rewritten) document
/// plus its verdict. Invalid documents are returned, never written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub item: Document,
    pub result: ValidationOutcome,
}

/// Declarative Tabula API surface.
#[async_trait::async_trait]
pub trait CollectionsApi: Send + Sync {
    /// Hydrated schema for a collection, or `None` if it does not exist.
    async fn schema(&self, collection: &str) -> TabulaResult<Option<CollectionSchema>>;

    /// Grade a batch without writing anything.
    async fn check_items(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> TabulaResult<Vec<SaveOutcome>>;

    /// Grade a batch and upsert every valid document.
    async fn process_items_to_save(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> TabulaResult<Vec<SaveOutcome>>;

    /// Pass-through search over stored documents.
    async fn search(&self, collection: &str, criteria: SearchCriteria) -> TabulaResult<SearchPage>;

    /// One resource record by canonical key.
    async fn resource_by_key(&self, resource: &str, key: &str) -> TabulaResult<Option<Document>>;

    /// One resource record by an alternate unique field.
    async fn resource_by_unique_field(
        &self,
        resource: &str,
        field_id: &str,
        value: &Value,
    ) -> TabulaResult<Option<Document>>;

    /// The key a document would get under the collection's policy. Fails
    /// only when the policy demands a key the document does not carry.
    fn item_key(&self, schema: &CollectionSchema, document: &Document) -> TabulaResult<String>;
}

/// In-process implementation over the two store seams.
pub struct Engine {
    docs: Arc<dyn DocumentStore>,
    resources: Arc<dyn ResourceStore>,
}

impl Engine {
    pub fn new(docs: Arc<dyn DocumentStore>, resources: Arc<dyn ResourceStore>) -> Self {
        Self { docs, resources }
    }

    async fn run_batch(
        &self,
        collection: &str,
        documents: Vec<Document>,
        write: bool,
    ) -> TabulaResult<Vec<SaveOutcome>> {
        let t0 = Instant::now();
        let total = documents.len();

        // Everything batch-scoped hangs off this cache; nothing survives the call.
        let mut cache = SchemaCache::new(&*self.docs);
        let schema = cache.get(collection).await?;
        check_schema(&schema)?;

        let resolver = ReferenceResolver::discover(&schema, &mut cache).await;
        let mut buffer = resolver.collect(&documents);
        resolver.resolve(&mut buffer, &*self.resources).await;
        let lookups = buffer.lookups();

        let validator = StructuralValidator::compile(&schema)?;
        let mut outcomes = Vec::with_capacity(total);
        for mut doc in documents {
            let mut errors: ErrorList = resolver.apply(&buffer, &mut doc);
            match resolve_key(&schema, &doc) {
                Ok(key) => {
                    doc.insert(reserved::KEY, key);
                }
                Err(e) => {
                    // No key means nothing to grade or store; the document
                    // comes back invalid while the batch carries on.
                    errors.push(e.to_string());
                    outcomes.push(SaveOutcome {
                        item: doc,
                        result: ValidationOutcome::from_errors(errors),
                    });
                    continue;
                }
            }
            // Hiding must always succeed, even for records whose content no
            // longer passes; their collected errors are discarded.
            let result = if doc.is_hidden() {
                ValidationOutcome::ok()
            } else {
                errors.extend(validator.validate(&doc));
                ValidationOutcome::from_errors(errors)
            };
            outcomes.push(SaveOutcome { item: doc, result });
        }
        drop(validator);

        let mut written = 0usize;
        if write {
            for outcome in outcomes.iter_mut() {
                if outcome.result.valid {
                    let stored = self.docs.upsert(collection, outcome.item.clone()).await?;
                    outcome.item = stored;
                    written += 1;
                }
            }
        }

        let invalid = outcomes.iter().filter(|o| !o.result.valid).count();
        counter!("process_docs_total", total as u64);
        counter!("process_invalid_total", invalid as u64);
        histogram!("process_batch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            collection = %collection,
            docs = total,
            invalid,
            written,
            lookups,
            took_ms = %t0.elapsed().as_millis(),
            "api: batch done"
        );
        Ok(outcomes)
    }
}

#[async_trait::async_trait]
impl CollectionsApi for Engine {
    async fn schema(&self, collection: &str) -> TabulaResult<Option<CollectionSchema>> {
        let t0 = Instant::now();
        let mut cache = SchemaCache::new(&*self.docs);
        let schema = match cache.get(collection).await {
            Ok(s) => Some((*s).clone()),
            Err(TabulaError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        info!(collection = %collection, found = schema.is_some(), took_ms = %t0.elapsed().as_millis(), "api: schema");
        Ok(schema)
    }

    async fn check_items(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> TabulaResult<Vec<SaveOutcome>> {
        info!(collection = %collection, docs = documents.len(), "api: check start");
        self.run_batch(collection, documents, false).await
    }

    async fn process_items_to_save(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> TabulaResult<Vec<SaveOutcome>> {
        info!(collection = %collection, docs = documents.len(), "api: process start");
        self.run_batch(collection, documents, true).await
    }

    async fn search(&self, collection: &str, criteria: SearchCriteria) -> TabulaResult<SearchPage> {
        self.docs.search(collection, criteria).await
    }

    async fn resource_by_key(&self, resource: &str, key: &str) -> TabulaResult<Option<Document>> {
        self.resources.get_by_key(resource, key).await
    }

    async fn resource_by_unique_field(
        &self,
        resource: &str,
        field_id: &str,
        value: &Value,
    ) -> TabulaResult<Option<Document>> {
        self.resources.get_by_unique_field(resource, field_id, value).await
    }

    fn item_key(&self, schema: &CollectionSchema, document: &Document) -> TabulaResult<String> {
        resolve_key(schema, document)
    }
}
