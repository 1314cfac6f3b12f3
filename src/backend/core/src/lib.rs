//! # Callboard Core
//!
//! Client-side live-sync engine for collaborative production boards: keeps
//! local read models continuously consistent with a remote document store
//! over push-based watch subscriptions.
//!
//! ## Architecture
//!
//! - **Source**: The remote store collaborator trait, plus a deterministic
//!   in-memory implementation for tests and local development
//! - **Subscription**: Generation-tagged cancelable handles; stale buffered
//!   callbacks are detected and dropped
//! - **View**: Deterministic multi-source merge with first-seen ownership
//!   and a permission latch that freezes the view on access loss
//! - **Selection**: Current-selection derivation with durable preference
//!   restore across restarts
//! - **Tree**: Nested root → child → leaf subscriptions, reconciled by
//!   diffing so unchanged branches never churn
//! - **Aggregate**: Live per-root numeric summaries published over a
//!   broadcast channel
//! - **Telemetry**: Structured logging via `tracing`; counters via the
//!   `metrics` facade

pub mod aggregate;
pub mod config;
pub mod error;
pub mod selection;
pub mod source;
pub mod subscription;
pub mod telemetry;
pub mod tree;
pub mod view;

pub use error::{ErrorKind, ErrorSeverity, Result, SyncError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::aggregate::{AggregateUpdate, AggregationCache, ChildId, RootId};
    pub use crate::config::{Config, EngineConfig, ObservabilityConfig, PreferencesConfig};
    pub use crate::error::{ErrorKind, ErrorSeverity, Result, SyncError};
    pub use crate::selection::{
        JsonFilePreferenceStore, MemoryPreferenceStore, PreferenceStore, SelectionStore,
    };
    pub use crate::source::{
        CancelFn, CollectionPath, Entity, EntityId, FilterPredicate, InMemorySource,
        PathTemplate, QueryOrdering, RemoteCollectionSource, SourceError, SourceObserver,
        SourceQuery,
    };
    pub use crate::subscription::{
        Generation, GenerationCounter, SubscriptionHandle, SubscriptionStatus,
    };
    pub use crate::tree::{
        count_reducer, sum_field_reducer, LeafReducer, SubscriptionTree, TreeLayout, TreeStats,
    };
    pub use crate::view::{ChangeObserver, MergedQueryView, MergedSnapshot};
}
