//! The remote collection source: the collaborator interface to the document
//! store.
//!
//! The store is hierarchical and multi-tenant, and exposes each collection in
//! exactly two ways: a push-based watch subscription (initial snapshot plus
//! incremental full-replacement emissions) and a one-shot document read. The
//! engine consumes both through [`RemoteCollectionSource`]; everything else in
//! this crate is built on top of that trait.

pub mod memory;

pub use memory::InMemorySource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorKind, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier of a remote document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document as delivered by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub data: Value,
}

impl Entity {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: EntityId::new(id),
            data,
        }
    }

    /// Read a top-level field of the document payload.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Paths
// ═══════════════════════════════════════════════════════════════════════════════

/// Fully resolved path to a remote collection, e.g. `productions/p1/boxes`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collection path template with `{root}` and `{child}` placeholders.
///
/// Resolving substitutes the placeholders, e.g.
/// `boards/{root}/lists/{child}/cards` becomes `boards/b1/lists/l1/cards`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTemplate(String);

impl PathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Resolve a template that carries no placeholders.
    pub fn resolve(&self) -> CollectionPath {
        CollectionPath::new(self.0.clone())
    }

    /// Resolve the `{root}` placeholder.
    pub fn with_root(&self, root: &str) -> CollectionPath {
        CollectionPath::new(self.0.replace("{root}", root))
    }

    /// Resolve both `{root}` and `{child}` placeholders.
    pub fn with_root_and_child(&self, root: &str, child: &str) -> CollectionPath {
        CollectionPath::new(self.0.replace("{root}", root).replace("{child}", child))
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════════════════════

/// Server-side equality filter on a top-level document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub field: String,
    pub equals: Value,
}

impl FilterPredicate {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            equals: value.into(),
        }
    }

    /// Whether a document satisfies the predicate.
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.field(&self.field) == Some(&self.equals)
    }
}

/// Stable result ordering for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOrdering {
    #[default]
    IdAscending,
    IdDescending,
}

/// Static descriptor of one live source feeding a merged view.
#[derive(Debug, Clone)]
pub struct SourceQuery {
    pub path: CollectionPath,
    pub filter: Option<FilterPredicate>,
    pub ordering: QueryOrdering,
}

impl SourceQuery {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: CollectionPath::new(path),
            filter: None,
            ordering: QueryOrdering::default(),
        }
    }

    pub fn with_filter(mut self, filter: FilterPredicate) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ordering(mut self, ordering: QueryOrdering) -> Self {
        self.ordering = ordering;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscription Channel
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure delivered on a watch channel.
#[derive(Debug, Clone)]
pub struct SourceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TransientNetwork,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PermissionDenied,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: message.into(),
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Callback pair handed to the source on subscribe.
///
/// Every emission is a full replacement of the collection's contents, never a
/// delta. Sources must not invoke either callback re-entrantly from inside
/// `subscribe`; the initial snapshot arrives on the delivery context like any
/// later one.
#[derive(Clone)]
pub struct SourceObserver {
    on_next: Arc<dyn Fn(Vec<Entity>) + Send + Sync>,
    on_error: Arc<dyn Fn(SourceError) + Send + Sync>,
}

impl SourceObserver {
    pub fn new(
        on_next: impl Fn(Vec<Entity>) + Send + Sync + 'static,
        on_error: impl Fn(SourceError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_next: Arc::new(on_next),
            on_error: Arc::new(on_error),
        }
    }

    /// Deliver a full-replacement snapshot.
    pub fn next(&self, items: Vec<Entity>) {
        (self.on_next)(items);
    }

    /// Deliver a channel failure.
    pub fn error(&self, err: SourceError) {
        (self.on_error)(err);
    }
}

impl fmt::Debug for SourceObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceObserver").finish_non_exhaustive()
    }
}

/// Teardown closure returned by subscribe. Running it detaches the listener;
/// events already in flight may still be delivered afterwards, which the
/// engine tolerates via generation checks.
pub type CancelFn = Box<dyn FnOnce() + Send>;

// ═══════════════════════════════════════════════════════════════════════════════
// Collaborator Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The remote document store, as seen by this engine.
#[async_trait]
pub trait RemoteCollectionSource: Send + Sync {
    /// Open a live subscription on a collection.
    fn subscribe(
        &self,
        path: &CollectionPath,
        filter: Option<&FilterPredicate>,
        observer: SourceObserver,
    ) -> CancelFn;

    /// One-shot read of a single document. A missing document is `Ok(None)`.
    async fn fetch_once(&self, path: &CollectionPath, id: &EntityId) -> Result<Option<Entity>>;
}
