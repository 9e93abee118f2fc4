//! Projection operations and the document store they run against.
//!
//! # Overview
//!
//! A projection turns events into documents in a read model. Deciding what to
//! do with an event is a pure step that yields an [`Operation`]; executing the
//! operation against a [`DocumentStore`] is a separate effectful step. The
//! projection handler in `conveyor-projections` glues the two together.
//!
//! ```text
//! EventEnvelope ──get_update──▶ Operation ──execute──▶ DocumentStore
//!                               NoOp                    (nothing)
//!                               Update(filter, update)  upsert, stamped with position
//!                               RawTask(future)         awaited as is
//!                               Collection(closure)     closure(&store, cancellation)
//! ```
//!
//! ## Documents
//!
//! Documents are JSON objects with an `id` field and a `position` field. The
//! `position` field is written by every `Update` operation with the position
//! of the event that triggered it, which makes re-applying the same event a
//! no-op in effect.
//!
//! ## Example
//!
//! ```
//! use conveyor_core::projection::{DocumentFilter, DocumentUpdate, Operation};
//! use serde_json::json;
//!
//! struct Store;
//!
//! let op: Operation<Store> = Operation::update_by_id(
//!     "order-1",
//!     DocumentUpdate::new().set("status", json!("placed")).inc("revision", 1),
//! );
//! assert_eq!(op.kind(), "update");
//! ```

use crate::stream::Position;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Field every projected document carries its identifier in.
pub const ID_FIELD: &str = "id";

/// Field stamped with the position of the last event applied to a document.
pub const POSITION_FIELD: &str = "position";

/// Error type for projection operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An update could not be applied to a document.
    #[error("Cannot apply update to field '{field}': {reason}")]
    InvalidUpdate {
        /// The field the update targets.
        field: String,
        /// Why it does not apply.
        reason: String,
    },

    /// Upserts create documents and need to know their id.
    #[error("Upsert filter does not pin a document id: {0}")]
    MissingDocumentId(String),

    /// Generic error
    #[error("Projection error: {0}")]
    Other(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Selects documents in a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentFilter {
    /// Match the document with this id.
    Id(String),
    /// Match documents whose top-level `field` equals `value`.
    Eq {
        /// Top-level field name.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Match documents matching every inner filter.
    And(Vec<DocumentFilter>),
}

impl DocumentFilter {
    /// Filter by document id.
    #[must_use]
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    /// Filter by field equality.
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Combine with another filter.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::And(mut filters) => {
                filters.push(other);
                Self::And(filters)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Returns true if `document` matches the filter.
    ///
    /// ```
    /// use conveyor_core::projection::DocumentFilter;
    /// use serde_json::json;
    ///
    /// let doc = json!({ "id": "a", "status": "open" });
    /// assert!(DocumentFilter::id("a").and(DocumentFilter::eq("status", "open")).matches(&doc));
    /// assert!(!DocumentFilter::id("b").matches(&doc));
    /// ```
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Self::Id(id) => document
                .get(ID_FIELD)
                .and_then(Value::as_str)
                .is_some_and(|doc_id| doc_id == id),
            Self::Eq { field, value } => document.get(field) == Some(value),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(document)),
        }
    }

    /// The document id the filter pins, if any.
    #[must_use]
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::Id(id) => Some(id),
            Self::Eq { field, value } if field == ID_FIELD => value.as_str(),
            Self::Eq { .. } => None,
            Self::And(filters) => filters.iter().find_map(Self::document_id),
        }
    }

    /// Fields a document created by an upsert starts with.
    #[must_use]
    pub fn seed(&self) -> Map<String, Value> {
        let mut seed = Map::new();
        self.seed_into(&mut seed);
        seed
    }

    fn seed_into(&self, seed: &mut Map<String, Value>) {
        match self {
            Self::Id(id) => {
                seed.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            }
            Self::Eq { field, value } => {
                seed.insert(field.clone(), value.clone());
            }
            Self::And(filters) => filters.iter().for_each(|filter| filter.seed_into(seed)),
        }
    }
}

impl fmt::Display for DocumentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id == {id:?}"),
            Self::Eq { field, value } => write!(f, "{field} == {value}"),
            Self::And(filters) => {
                let parts: Vec<String> = filters.iter().map(ToString::to_string).collect();
                write!(f, "({})", parts.join(" && "))
            }
        }
    }
}

/// One step of a [`DocumentUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateStep {
    /// Set a field.
    Set {
        /// Field name.
        field: String,
        /// New value.
        value: Value,
    },
    /// Remove a field.
    Unset {
        /// Field name.
        field: String,
    },
    /// Add to a numeric field; a missing field counts as zero.
    Inc {
        /// Field name.
        field: String,
        /// Amount to add.
        by: i64,
    },
    /// Append to an array field; a missing field counts as empty.
    Push {
        /// Field name.
        field: String,
        /// Value to append.
        value: Value,
    },
}

impl UpdateStep {
    /// Field the step touches.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Set { field, .. }
            | Self::Unset { field }
            | Self::Inc { field, .. }
            | Self::Push { field, .. } => field,
        }
    }
}

/// Ordered list of modifications to a document's top-level fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    steps: Vec<UpdateStep>,
}

impl DocumentUpdate {
    /// An empty update.
    #[must_use]
    pub const fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Set `field` to `value`.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.steps.push(UpdateStep::Set {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Remove `field`.
    #[must_use]
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.steps.push(UpdateStep::Unset {
            field: field.into(),
        });
        self
    }

    /// Add `by` to `field`.
    #[must_use]
    pub fn inc(mut self, field: impl Into<String>, by: i64) -> Self {
        self.steps.push(UpdateStep::Inc {
            field: field.into(),
            by,
        });
        self
    }

    /// Append `value` to the array in `field`.
    #[must_use]
    pub fn push(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.steps.push(UpdateStep::Push {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Set every field of a serializable value.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Serialization`] if `value` does not
    /// serialize to a JSON object.
    pub fn set_all<T: Serialize>(mut self, value: &T) -> Result<Self> {
        match serde_json::to_value(value) {
            Ok(Value::Object(fields)) => {
                for (field, value) in fields {
                    self = self.set(field, value);
                }
                Ok(self)
            }
            Ok(other) => Err(ProjectionError::Serialization(format!(
                "expected an object, got {other}"
            ))),
            Err(e) => Err(ProjectionError::Serialization(e.to_string())),
        }
    }

    /// Steps in application order.
    #[must_use]
    pub fn steps(&self) -> &[UpdateStep] {
        &self.steps
    }

    /// Returns true if the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Apply the update to a JSON object in place.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidUpdate`] if the document is not an
    /// object, `inc` targets a non-integer or `push` targets a non-array.
    /// The document may be partially updated when an error is returned.
    pub fn apply(&self, document: &mut Value) -> Result<()> {
        let Value::Object(fields) = document else {
            return Err(ProjectionError::InvalidUpdate {
                field: String::new(),
                reason: "document is not an object".to_string(),
            });
        };

        for step in &self.steps {
            match step {
                UpdateStep::Set { field, value } => {
                    fields.insert(field.clone(), value.clone());
                }
                UpdateStep::Unset { field } => {
                    fields.remove(field);
                }
                UpdateStep::Inc { field, by } => {
                    let current = match fields.get(field) {
                        None | Some(Value::Null) => 0,
                        Some(value) => value.as_i64().ok_or_else(|| ProjectionError::InvalidUpdate {
                            field: field.clone(),
                            reason: format!("cannot increment {value}"),
                        })?,
                    };
                    let next = current.checked_add(*by).ok_or_else(|| {
                        ProjectionError::InvalidUpdate {
                            field: field.clone(),
                            reason: "integer overflow".to_string(),
                        }
                    })?;
                    fields.insert(field.clone(), Value::from(next));
                }
                UpdateStep::Push { field, value } => {
                    let entry = fields
                        .entry(field.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if entry.is_null() {
                        *entry = Value::Array(Vec::new());
                    }
                    let Value::Array(items) = entry else {
                        return Err(ProjectionError::InvalidUpdate {
                            field: field.clone(),
                            reason: format!("cannot push onto {entry}"),
                        });
                    };
                    items.push(value.clone());
                }
            }
        }
        Ok(())
    }
}

/// A filter plus the update to apply to what it selects.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOperation {
    /// Documents to update; also seeds a created document.
    pub filter: DocumentFilter,
    /// The update to apply.
    pub update: DocumentUpdate,
}

impl UpdateOperation {
    /// Create an update operation.
    #[must_use]
    pub const fn new(filter: DocumentFilter, update: DocumentUpdate) -> Self {
        Self { filter, update }
    }

    /// Add a final step recording the triggering event position.
    #[must_use]
    pub fn stamped(mut self, position: Position) -> Self {
        self.update = self.update.set(POSITION_FIELD, position.value());
        self
    }
}

/// Future executed by [`Operation::RawTask`].
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Closure executed by [`Operation::Collection`].
pub type CollectionFn<S> =
    Box<dyn for<'s> FnOnce(&'s S, CancellationToken) -> BoxFuture<'s, Result<()>> + Send>;

/// What a projection wants done for one event.
///
/// The handler matches on this exhaustively; there is no other kind of
/// operation.
pub enum Operation<S: ?Sized> {
    /// Nothing to do.
    NoOp,
    /// Upsert the selected document and stamp it with the event position.
    Update(UpdateOperation),
    /// Await an arbitrary task. Nothing is stamped.
    RawTask(TaskFuture),
    /// Run a closure against the whole store.
    Collection(CollectionFn<S>),
}

impl<S: ?Sized> Operation<S> {
    /// Upsert documents matching `filter`.
    #[must_use]
    pub const fn update(filter: DocumentFilter, update: DocumentUpdate) -> Self {
        Self::Update(UpdateOperation::new(filter, update))
    }

    /// Upsert the document with `id`.
    #[must_use]
    pub fn update_by_id(id: impl Into<String>, update: DocumentUpdate) -> Self {
        Self::update(DocumentFilter::id(id), update)
    }

    /// Await `task`.
    #[must_use]
    pub fn raw<F>(task: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self::RawTask(Box::pin(task))
    }

    /// Run `operation` against the store.
    #[must_use]
    pub fn collection<F>(operation: F) -> Self
    where
        F: for<'s> FnOnce(&'s S, CancellationToken) -> BoxFuture<'s, Result<()>> + Send + 'static,
    {
        Self::Collection(Box::new(operation))
    }

    /// Returns true for [`Operation::NoOp`].
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    /// Short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Update(_) => "update",
            Self::RawTask(_) => "raw_task",
            Self::Collection(_) => "collection",
        }
    }
}

impl<S: ?Sized> fmt::Debug for Operation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update(op) => f.debug_tuple("Update").field(op).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// Document collection a projection writes to.
///
/// Every method must be safe to call again with the same arguments after a
/// failure or a crash: subscriptions redeliver events, and an upsert stamped
/// with the same position must leave the same document behind.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so stores can be shared as
/// `Arc<dyn DocumentStore>`.
pub trait DocumentStore: Send + Sync {
    /// Name of the collection.
    fn collection(&self) -> &str;

    /// Update the first document matching `filter`, or create one.
    ///
    /// A created document starts from [`DocumentFilter::seed`]. Per-document
    /// atomicity is the store's responsibility.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::MissingDocumentId`] when a document would be
    /// created but the filter does not pin an id, and
    /// [`ProjectionError::Storage`] on backend failures.
    fn upsert(
        &self,
        filter: DocumentFilter,
        update: DocumentUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Load the first document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on backend failures.
    fn find_one(
        &self,
        filter: DocumentFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send + '_>>;

    /// Delete every document matching `filter`, returning how many went.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on backend failures.
    fn delete_many(
        &self,
        filter: DocumentFilter,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// A typed read model document.
pub trait ProjectedDocument: Serialize + DeserializeOwned + Send + Sync {
    /// Document id.
    fn id(&self) -> &str;

    /// Position of the last event applied, `None` if never projected.
    fn position(&self) -> Option<u64>;
}

/// Typed helpers over any [`DocumentStore`].
pub trait DocumentStoreExt: DocumentStore {
    /// Load and deserialize the document with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Serialization`] if the stored document does
    /// not deserialize as `T`.
    fn load<'a, T>(&'a self, id: &str) -> BoxFuture<'a, Result<Option<T>>>
    where
        T: ProjectedDocument + 'a,
    {
        let filter = DocumentFilter::id(id);
        Box::pin(async move {
            self.find_one(filter)
                .await?
                .map(|doc| {
                    serde_json::from_value(doc)
                        .map_err(|e| ProjectionError::Serialization(e.to_string()))
                })
                .transpose()
        })
    }
}

impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {}
