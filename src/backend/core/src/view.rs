//! Deduplicated merged view over several live sources of one logical
//! collection (e.g. "owned" plus "shared-with-me" show lists).
//!
//! Each source's emission is a full replacement of that source's latest
//! snapshot. The merged map is recomputed as the union across all latest
//! snapshots, keyed by id, with first-seen-source-wins as the conflict
//! tie-break: the source that first delivered an id keeps supplying it until
//! that source itself stops reporting the id, at which point ownership falls
//! to the earliest-subscribed source still reporting it. Recomputation is
//! idempotent regardless of emission arrival order across sources.
//!
//! An authorization-class failure on any source latches the view: entries are
//! cleared and every later emission, successful or not, is ignored until a
//! fresh [`MergedQueryView::subscribe`].

use metrics::counter;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

use crate::error::{ErrorKind, Result, SyncError};
use crate::source::{
    CollectionPath, Entity, EntityId, QueryOrdering, RemoteCollectionSource, SourceError,
    SourceObserver, SourceQuery,
};
use crate::subscription::{Generation, GenerationCounter, SubscriptionHandle};

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshots
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-only snapshot of the merged view. Data and error state are exposed
/// simultaneously; showing stale data with a banner or blocking is the
/// consumer's call.
#[derive(Debug, Clone, Default)]
pub struct MergedSnapshot {
    pub entries: BTreeMap<EntityId, Entity>,
    pub error: Option<String>,
    pub latched: bool,
    pub ordering: QueryOrdering,
}

impl MergedSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entries.get(id)
    }

    /// First id in the view's stable order.
    pub fn first_id(&self) -> Option<EntityId> {
        match self.ordering {
            QueryOrdering::IdAscending => self.entries.keys().next().cloned(),
            QueryOrdering::IdDescending => self.entries.keys().next_back().cloned(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// View State
// ═══════════════════════════════════════════════════════════════════════════════

/// Callback run with a cloned snapshot after every applied emission.
pub type ChangeObserver = Arc<dyn Fn(&MergedSnapshot) + Send + Sync>;

struct SourceSlot {
    query: SourceQuery,
    handle: SubscriptionHandle,
    /// This source's latest full-replacement snapshot; `None` before the
    /// first emission.
    latest: Option<HashMap<EntityId, Entity>>,
}

struct ViewState {
    slots: Vec<SourceSlot>,
    /// First-seen source index per id, pruned when the owner stops
    /// reporting the id.
    owners: HashMap<EntityId, usize>,
    snapshot: MergedSnapshot,
    observers: Vec<ChangeObserver>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Merged Query View
// ═══════════════════════════════════════════════════════════════════════════════

/// Merges N independent live sources into one deduplicated mapping with a
/// permission-error latch.
pub struct MergedQueryView {
    source: Arc<dyn RemoteCollectionSource>,
    generations: Arc<GenerationCounter>,
    state: Arc<Mutex<ViewState>>,
}

impl MergedQueryView {
    pub fn new(
        source: Arc<dyn RemoteCollectionSource>,
        generations: Arc<GenerationCounter>,
    ) -> Self {
        Self {
            source,
            generations,
            state: Arc::new(Mutex::new(ViewState {
                slots: Vec::new(),
                owners: HashMap::new(),
                snapshot: MergedSnapshot::default(),
                observers: Vec::new(),
            })),
        }
    }

    /// Open one live subscription per query and reset the view, clearing any
    /// previous latch. Queries must target distinct paths and share one
    /// ordering, since the merged snapshot has a single stable order.
    pub fn subscribe(&self, queries: &[SourceQuery]) -> Result<()> {
        let mut seen = HashSet::new();
        for query in queries {
            if !seen.insert(&query.path) {
                return Err(SyncError::duplicate_source(&query.path));
            }
            if query.ordering != queries[0].ordering {
                return Err(SyncError::configuration(
                    "queries in one merged view must share an ordering",
                ));
            }
        }

        let mut state = self.state.lock();
        // Dropping the old slots cancels their listeners.
        state.slots.clear();
        state.owners.clear();
        state.snapshot = MergedSnapshot {
            ordering: queries.first().map(|q| q.ordering).unwrap_or_default(),
            ..MergedSnapshot::default()
        };

        for (idx, query) in queries.iter().enumerate() {
            let generation = self.generations.issue();
            let observer = self.build_observer(idx, generation);
            let cancel = self
                .source
                .subscribe(&query.path, query.filter.as_ref(), observer);
            state.slots.push(SourceSlot {
                query: query.clone(),
                handle: SubscriptionHandle::new(generation, query.path.clone(), cancel),
                latest: None,
            });
        }
        Ok(())
    }

    /// Tear down every source subscription. The last merged entries remain
    /// visible as stale data.
    pub fn unsubscribe_all(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.owners.clear();
    }

    /// Current snapshot of the merged view.
    pub fn snapshot(&self) -> MergedSnapshot {
        self.state.lock().snapshot.clone()
    }

    /// Whether the permission latch is set.
    pub fn is_latched(&self) -> bool {
        self.state.lock().snapshot.latched
    }

    /// Register a change observer. Observers run outside the state lock with
    /// a cloned snapshot, after every applied emission.
    pub fn on_change(&self, observer: ChangeObserver) {
        self.state.lock().observers.push(observer);
    }

    /// Look a document up in the merged view, falling back to a one-shot read
    /// against each source path in subscription order.
    pub async fn lookup(&self, id: &EntityId) -> Result<Option<Entity>> {
        let paths: Vec<CollectionPath> = {
            let state = self.state.lock();
            if let Some(found) = state.snapshot.entries.get(id) {
                return Ok(Some(found.clone()));
            }
            state.slots.iter().map(|s| s.query.path.clone()).collect()
        };

        for path in paths {
            if let Some(found) = self.source.fetch_once(&path, id).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Emission Handling
    // ─────────────────────────────────────────────────────────────────────────

    fn build_observer(&self, idx: usize, generation: Generation) -> SourceObserver {
        let next_state = Arc::downgrade(&self.state);
        let error_state = Arc::downgrade(&self.state);
        SourceObserver::new(
            move |items| {
                Self::apply(&next_state, |view| {
                    Self::ingest_snapshot(view, idx, generation, items)
                });
            },
            move |err| {
                Self::apply(&error_state, |view| {
                    Self::ingest_error(view, idx, generation, err)
                });
            },
        )
    }

    /// Run a mutation inside the lock, then notify observers outside it.
    fn apply<F>(state: &Weak<Mutex<ViewState>>, mutate: F)
    where
        F: FnOnce(&mut ViewState) -> bool,
    {
        let Some(state) = state.upgrade() else {
            return;
        };
        let (snapshot, observers) = {
            let mut guard = state.lock();
            if !mutate(&mut guard) {
                return;
            }
            (guard.snapshot.clone(), guard.observers.clone())
        };
        for observer in &observers {
            observer(&snapshot);
        }
    }

    /// Validate a callback against the slot's live generation. A dead or
    /// stale generation means the emission belongs to a torn-down
    /// subscription and is silently dropped.
    fn live_slot<'a>(
        view: &'a mut ViewState,
        idx: usize,
        generation: Generation,
    ) -> Option<&'a mut SourceSlot> {
        match view.slots.get_mut(idx) {
            Some(slot) if slot.handle.generation() == generation => Some(slot),
            _ => {
                counter!("callboard_stale_callbacks_total").increment(1);
                trace!(%generation, slot = idx, "stale emission dropped");
                None
            }
        }
    }

    fn ingest_snapshot(
        view: &mut ViewState,
        idx: usize,
        generation: Generation,
        items: Vec<Entity>,
    ) -> bool {
        if view.snapshot.latched {
            return false;
        }
        let Some(slot) = Self::live_slot(view, idx, generation) else {
            return false;
        };

        slot.handle.mark_active();
        slot.latest = Some(items.into_iter().map(|e| (e.id.clone(), e)).collect());
        view.snapshot.error = None;
        Self::recompute(view);
        true
    }

    fn ingest_error(
        view: &mut ViewState,
        idx: usize,
        generation: Generation,
        err: SourceError,
    ) -> bool {
        if view.snapshot.latched {
            return false;
        }
        let Some(slot) = Self::live_slot(view, idx, generation) else {
            return false;
        };

        match err.kind {
            // A missing collection is an empty result set, not an error.
            ErrorKind::NotFound => {
                slot.handle.mark_active();
                slot.latest = Some(HashMap::new());
                view.snapshot.error = None;
                Self::recompute(view);
            }
            ErrorKind::PermissionDenied => {
                counter!("callboard_view_latched_total").increment(1);
                warn!(path = %slot.query.path, "permission denied; latching merged view");
                view.snapshot.latched = true;
                view.snapshot.entries.clear();
                view.snapshot.error = Some(err.message);
                view.owners.clear();
                for slot in &mut view.slots {
                    slot.handle.cancel();
                    slot.latest = None;
                }
            }
            // Transient failures surface a message but keep prior data; the
            // next successful emission clears the message.
            _ => {
                view.snapshot.error = Some(err.message);
            }
        }
        true
    }

    /// Rebuild the merged map from the per-source latest snapshots. Order
    /// independent: given the same snapshots and ownership history, any
    /// arrival order produces the same result.
    fn recompute(view: &mut ViewState) {
        let ViewState {
            slots,
            owners,
            snapshot,
            ..
        } = view;

        // An owner that stopped reporting an id forfeits it.
        owners.retain(|id, idx| {
            slots
                .get(*idx)
                .and_then(|s| s.latest.as_ref())
                .is_some_and(|latest| latest.contains_key(id))
        });

        // Unowned ids go to the earliest-subscribed source reporting them;
        // ids seen for the first time belong to the slot that just emitted.
        for (idx, slot) in slots.iter().enumerate() {
            if let Some(latest) = &slot.latest {
                for id in latest.keys() {
                    owners.entry(id.clone()).or_insert(idx);
                }
            }
        }

        let mut entries = BTreeMap::new();
        for (id, idx) in owners.iter() {
            if let Some(entity) = slots
                .get(*idx)
                .and_then(|s| s.latest.as_ref())
                .and_then(|latest| latest.get(id))
            {
                entries.insert(id.clone(), entity.clone());
            }
        }
        snapshot.entries = entries;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
