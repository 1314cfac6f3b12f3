//! Deterministic in-process source for tests and local development.
//!
//! Emissions happen only when a caller mutates a collection through
//! [`InMemorySource::set_collection`] or injects a failure through
//! [`InMemorySource::fail`], never re-entrantly from inside `subscribe`. That
//! makes interleavings fully scriptable, which is what the engine's invariants
//! are tested against.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    CancelFn, CollectionPath, Entity, EntityId, FilterPredicate, RemoteCollectionSource,
    SourceError, SourceObserver,
};
use crate::error::Result;

struct Listener {
    path: CollectionPath,
    filter: Option<FilterPredicate>,
    observer: SourceObserver,
}

/// In-memory document store with scriptable watch channels.
#[derive(Default)]
pub struct InMemorySource {
    collections: Mutex<HashMap<CollectionPath, Vec<Entity>>>,
    listeners: Arc<DashMap<Uuid, Listener>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a collection's contents and notify every matching listener.
    pub fn set_collection(&self, path: &CollectionPath, items: Vec<Entity>) {
        self.collections.lock().insert(path.clone(), items.clone());

        // Collect targets before invoking callbacks: a handler may cancel or
        // open subscriptions, which touches the listener map.
        let targets: Vec<(SourceObserver, Vec<Entity>)> = self
            .listeners
            .iter()
            .filter(|entry| entry.path == *path)
            .map(|entry| {
                let filtered = match &entry.filter {
                    Some(filter) => items.iter().filter(|e| filter.matches(e)).cloned().collect(),
                    None => items.clone(),
                };
                (entry.observer.clone(), filtered)
            })
            .collect();

        for (observer, filtered) in targets {
            observer.next(filtered);
        }
    }

    /// Deliver a failure on every watch channel attached to a path.
    pub fn fail(&self, path: &CollectionPath, err: SourceError) {
        let targets: Vec<SourceObserver> = self
            .listeners
            .iter()
            .filter(|entry| entry.path == *path)
            .map(|entry| entry.observer.clone())
            .collect();

        for observer in targets {
            observer.error(err.clone());
        }
    }

    /// Number of currently attached listeners across all paths.
    pub fn active_listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of listeners attached to one path.
    pub fn listeners_on(&self, path: &CollectionPath) -> usize {
        self.listeners
            .iter()
            .filter(|entry| entry.path == *path)
            .count()
    }
}

#[async_trait]
impl RemoteCollectionSource for InMemorySource {
    fn subscribe(
        &self,
        path: &CollectionPath,
        filter: Option<&FilterPredicate>,
        observer: SourceObserver,
    ) -> CancelFn {
        let id = Uuid::new_v4();
        self.listeners.insert(
            id,
            Listener {
                path: path.clone(),
                filter: filter.cloned(),
                observer,
            },
        );

        let listeners = Arc::clone(&self.listeners);
        Box::new(move || {
            listeners.remove(&id);
        })
    }

    async fn fetch_once(&self, path: &CollectionPath, id: &EntityId) -> Result<Option<Entity>> {
        let collections = self.collections.lock();
        Ok(collections
            .get(path)
            .and_then(|items| items.iter().find(|e| e.id == *id))
            .cloned())
    }
}
