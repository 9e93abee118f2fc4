//! In-memory document store for projection tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use crate::InjectedFailure;
use conveyor_core::projection::{
    DocumentFilter, DocumentStore, DocumentUpdate, ID_FIELD, ProjectionError, Result,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// In-memory document store for fast, deterministic testing.
///
/// Documents are JSON objects keyed by their `id` field, kept in id order so
/// "first matching document" is deterministic. Upserts apply to a copy and
/// swap it in, so a failed update leaves the stored document untouched.
///
/// # Example
///
/// ```
/// use conveyor_testing::InMemoryDocumentStore;
/// use conveyor_core::projection::{DocumentFilter, DocumentStore, DocumentUpdate};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryDocumentStore::new("orders");
///
/// store.upsert(DocumentFilter::id("order-1"), DocumentUpdate::new().set("status", "placed")).await?;
///
/// assert_eq!(store.get("order-1"), Some(json!({"id": "order-1", "status": "placed"})));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryDocumentStore {
    collection: String,
    documents: Arc<RwLock<BTreeMap<String, Value>>>,
    failing_writes: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl InMemoryDocumentStore {
    /// Create a new empty collection
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            documents: Arc::new(RwLock::new(BTreeMap::new())),
            failing_writes: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Clear all documents (for test isolation)
    pub fn clear(&self) {
        self.documents.write().unwrap().clear();
    }

    /// Get the number of stored documents
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.read().unwrap().is_empty()
    }

    /// The document with `id`, if any.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Value> {
        self.documents.read().unwrap().get(id).cloned()
    }

    /// Every document, in id order.
    #[must_use]
    pub fn documents(&self) -> Vec<Value> {
        self.documents.read().unwrap().values().cloned().collect()
    }

    /// Number of successful upserts and deletes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Fail the next `count` writes with [`ProjectionError::Storage`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<()> {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProjectionError::Storage(
                InjectedFailure::new("document write failed").to_string(),
            ));
        }
        Ok(())
    }

    fn upsert_now(&self, filter: &DocumentFilter, update: &DocumentUpdate) -> Result<()> {
        let mut documents = self.documents.write().unwrap();

        let existing = documents
            .iter()
            .find(|(_, document)| filter.matches(document))
            .map(|(id, document)| (id.clone(), document.clone()));

        let (id, mut document) = match existing {
            Some(found) => found,
            None => {
                let id = filter
                    .document_id()
                    .ok_or_else(|| ProjectionError::MissingDocumentId(filter.to_string()))?
                    .to_string();
                if documents.contains_key(&id) {
                    return Err(ProjectionError::Storage(format!(
                        "duplicate document id '{id}' for filter {filter}"
                    )));
                }
                (id, Value::Object(filter.seed()))
            }
        };

        update.apply(&mut document)?;
        if document.get(ID_FIELD).and_then(Value::as_str) != Some(id.as_str()) {
            return Err(ProjectionError::InvalidUpdate {
                field: ID_FIELD.to_string(),
                reason: "the document id cannot change".to_string(),
            });
        }
        documents.insert(id, document);
        Ok(())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn upsert(
        &self,
        filter: DocumentFilter,
        update: DocumentUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.injected_failure()?;
            self.upsert_now(&filter, &update)?;
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn find_one(
        &self,
        filter: DocumentFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .documents
                .read()
                .unwrap()
                .values()
                .find(|document| filter.matches(document))
                .cloned())
        })
    }

    fn delete_many(
        &self,
        filter: DocumentFilter,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move {
            self.injected_failure()?;
            let mut documents = self.documents.write().unwrap();
            let before = documents.len();
            documents.retain(|_, document| !filter.matches(document));
            let deleted = before - documents.len();
            drop(documents);

            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(deleted as u64)
        })
    }
}
