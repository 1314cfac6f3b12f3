//! Nested live subscriptions with diff-based reconciliation.
//!
//! A [`SubscriptionTree`] maintains a two-level hierarchy of watch
//! subscriptions (e.g. board → list → cards) under dynamic root membership.
//! When a root's child-collection emits a new id set, the tree diffs it
//! against the current children: departed children are canceled, new children
//! get a leaf subscription, and unchanged children are left strictly alone.
//! The blanket cancel-everything/recreate-everything pattern is deliberately
//! absent: it churns listeners and drops leaf counts to zero until every leaf
//! re-emits.
//!
//! Leaf emissions are reduced to a numeric contribution and fed into an
//! [`AggregationCache`], which keeps per-root sums live and publishes
//! [`AggregateUpdate`]s.

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::aggregate::{AggregateUpdate, AggregationCache, ChildId, RootId};
use crate::config::EngineConfig;
use crate::source::{Entity, PathTemplate, RemoteCollectionSource, SourceError, SourceObserver};
use crate::subscription::{Generation, GenerationCounter, SubscriptionHandle, SubscriptionStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Layout & Reducers
// ═══════════════════════════════════════════════════════════════════════════════

/// Path shape of the two-level hierarchy.
#[derive(Debug, Clone)]
pub struct TreeLayout {
    /// Child-collection path per root; carries `{root}`.
    pub child_collection: PathTemplate,
    /// Leaf-collection path per child; carries `{root}` and `{child}`.
    pub leaf_collection: PathTemplate,
}

impl TreeLayout {
    pub fn new(child_collection: impl Into<String>, leaf_collection: impl Into<String>) -> Self {
        Self {
            child_collection: PathTemplate::new(child_collection),
            leaf_collection: PathTemplate::new(leaf_collection),
        }
    }
}

/// Reduces a leaf emission to its numeric contribution.
pub type LeafReducer = Arc<dyn Fn(&[Entity]) -> f64 + Send + Sync>;

/// Contribution is the number of leaf documents (e.g. cards on a list).
pub fn count_reducer() -> LeafReducer {
    Arc::new(|items| items.len() as f64)
}

/// Contribution is the sum of a numeric field across leaf documents; missing
/// or non-numeric fields count as zero.
pub fn sum_field_reducer(field: impl Into<String>) -> LeafReducer {
    let field = field.into();
    Arc::new(move |items| {
        items
            .iter()
            .filter_map(|e| e.field(&field).and_then(Value::as_f64))
            .sum()
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Nodes
// ═══════════════════════════════════════════════════════════════════════════════

struct ChildNode {
    handle: SubscriptionHandle,
}

struct RootNode {
    handle: SubscriptionHandle,
    children: HashMap<ChildId, ChildNode>,
}

struct TreeState {
    roots: HashMap<RootId, RootNode>,
    aggregates: AggregationCache,
}

struct TreeCtx {
    source: Arc<dyn RemoteCollectionSource>,
    generations: Arc<GenerationCounter>,
    layout: TreeLayout,
    reducer: LeafReducer,
    state: Mutex<TreeState>,
}

/// Counts of live tree nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub root_count: usize,
    pub child_count: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscription Tree
// ═══════════════════════════════════════════════════════════════════════════════

/// Nested root → child → leaf live subscriptions with per-root aggregates.
///
/// Owned by its call site and torn down on drop; there are no ambient
/// singletons behind it.
pub struct SubscriptionTree {
    ctx: Arc<TreeCtx>,
}

impl SubscriptionTree {
    /// Tree with the default count reducer and default engine tuning.
    pub fn new(
        source: Arc<dyn RemoteCollectionSource>,
        generations: Arc<GenerationCounter>,
        layout: TreeLayout,
    ) -> Self {
        Self::with_reducer(source, generations, layout, count_reducer())
    }

    pub fn with_reducer(
        source: Arc<dyn RemoteCollectionSource>,
        generations: Arc<GenerationCounter>,
        layout: TreeLayout,
        reducer: LeafReducer,
    ) -> Self {
        Self::with_config(source, generations, layout, reducer, &EngineConfig::default())
    }

    pub fn with_config(
        source: Arc<dyn RemoteCollectionSource>,
        generations: Arc<GenerationCounter>,
        layout: TreeLayout,
        reducer: LeafReducer,
        config: &EngineConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(TreeCtx {
                source,
                generations,
                layout,
                reducer,
                state: Mutex::new(TreeState {
                    roots: HashMap::new(),
                    aggregates: AggregationCache::new(config.update_channel_capacity),
                }),
            }),
        }
    }

    /// Receive aggregate updates as they are published.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<AggregateUpdate> {
        self.ctx.state.lock().aggregates.subscribe()
    }

    /// Reconcile the set of watched roots.
    ///
    /// Departed roots have their entire subtree canceled synchronously —
    /// child-collection subscription, every leaf subscription, and the
    /// aggregate entry — before any new root is subscribed. Unchanged roots
    /// are left untouched.
    pub fn set_roots(&self, roots: &[RootId]) {
        let ctx = &self.ctx;
        let mut state = ctx.state.lock();

        let desired: HashSet<&RootId> = roots.iter().collect();
        let departed: Vec<RootId> = state
            .roots
            .keys()
            .filter(|r| !desired.contains(r))
            .cloned()
            .collect();
        for root in &departed {
            // Dropping the node cancels its handle and every child handle.
            state.roots.remove(root);
            state.aggregates.remove_root(root);
            debug!(root = %root, "root subtree torn down");
        }

        for root in roots {
            if state.roots.contains_key(root) {
                continue;
            }
            let generation = ctx.generations.issue();
            let path = ctx.layout.child_collection.with_root(root.as_str());
            let observer = Self::child_collection_observer(ctx, root.clone(), generation);
            let cancel = ctx.source.subscribe(&path, None, observer);
            state.roots.insert(
                root.clone(),
                RootNode {
                    handle: SubscriptionHandle::new(generation, path, cancel),
                    children: HashMap::new(),
                },
            );
            state.aggregates.track_root(root);
            debug!(root = %root, %generation, "root subscribed");
        }
    }

    /// Current aggregate for a root; `None` if the root is not watched.
    pub fn aggregate_of(&self, root: &RootId) -> Option<f64> {
        self.ctx.state.lock().aggregates.total_of(root)
    }

    /// Live node counts.
    pub fn stats(&self) -> TreeStats {
        let state = self.ctx.state.lock();
        TreeStats {
            root_count: state.roots.len(),
            child_count: state.roots.values().map(|r| r.children.len()).sum(),
        }
    }

    /// Status of a root's child-collection subscription.
    pub fn root_status(&self, root: &RootId) -> Option<SubscriptionStatus> {
        self.ctx
            .state
            .lock()
            .roots
            .get(root)
            .map(|node| node.handle.status())
    }

    /// Status of a child's leaf subscription.
    pub fn child_status(&self, root: &RootId, child: &ChildId) -> Option<SubscriptionStatus> {
        self.ctx
            .state
            .lock()
            .roots
            .get(root)
            .and_then(|node| node.children.get(child))
            .map(|node| node.handle.status())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────────

    fn child_collection_observer(
        ctx: &Arc<TreeCtx>,
        root: RootId,
        generation: Generation,
    ) -> SourceObserver {
        let next_ctx = Arc::downgrade(ctx);
        let error_ctx = Arc::downgrade(ctx);
        let error_root = root.clone();
        SourceObserver::new(
            move |items| {
                if let Some(ctx) = next_ctx.upgrade() {
                    TreeCtx::handle_child_set(&ctx, &root, generation, items);
                }
            },
            move |err| {
                if let Some(ctx) = error_ctx.upgrade() {
                    TreeCtx::handle_child_collection_error(&ctx, &error_root, generation, err);
                }
            },
        )
    }

    fn leaf_observer(
        ctx: &Arc<TreeCtx>,
        root: RootId,
        child: ChildId,
        generation: Generation,
    ) -> SourceObserver {
        let next_ctx = Arc::downgrade(ctx);
        let error_ctx = Arc::downgrade(ctx);
        let error_root = root.clone();
        let error_child = child.clone();
        SourceObserver::new(
            move |items| {
                if let Some(ctx) = next_ctx.upgrade() {
                    TreeCtx::handle_leaf(&ctx, &root, &child, generation, items);
                }
            },
            move |err| {
                if let Some(ctx) = error_ctx.upgrade() {
                    TreeCtx::handle_leaf_error(&ctx, &error_root, &error_child, generation, err);
                }
            },
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Emission Handling
// ═══════════════════════════════════════════════════════════════════════════════

impl TreeCtx {
    fn stale(generation: Generation, what: &str) {
        counter!("callboard_stale_callbacks_total").increment(1);
        trace!(%generation, what, "stale emission dropped");
    }

    /// A root's child-collection emitted a new id set: diff and reconcile.
    fn handle_child_set(
        ctx: &Arc<TreeCtx>,
        root: &RootId,
        generation: Generation,
        items: Vec<Entity>,
    ) {
        let mut state = ctx.state.lock();
        let TreeState { roots, aggregates } = &mut *state;
        let Some(node) = roots.get_mut(root) else {
            return Self::stale(generation, "child set for departed root");
        };
        // A terminal handle means this generation is dead even though the ids
        // still match; buffered emissions must not revive an errored root.
        if node.handle.generation() != generation || node.handle.status().is_terminal() {
            return Self::stale(generation, "child set");
        }
        node.handle.mark_active();

        let observed: HashSet<ChildId> =
            items.iter().map(|e| ChildId::new(e.id.as_str())).collect();

        // Departed children are canceled and removed before new nodes are
        // created; their contribution leaves the aggregate immediately.
        let removed: Vec<ChildId> = node
            .children
            .keys()
            .filter(|c| !observed.contains(c))
            .cloned()
            .collect();
        for child in &removed {
            node.children.remove(child);
            aggregates.remove_child(root, child);
            trace!(root = %root, child = %child, "child departed");
        }

        // Unchanged children keep their live subscription untouched.
        for child in observed {
            if node.children.contains_key(&child) {
                continue;
            }
            let generation = ctx.generations.issue();
            let path = ctx
                .layout
                .leaf_collection
                .with_root_and_child(root.as_str(), child.as_str());
            let observer =
                SubscriptionTree::leaf_observer(ctx, root.clone(), child.clone(), generation);
            let cancel = ctx.source.subscribe(&path, None, observer);
            trace!(root = %root, child = %child, %generation, "child subscribed");
            node.children.insert(
                child,
                ChildNode {
                    handle: SubscriptionHandle::new(generation, path, cancel),
                },
            );
        }
    }

    /// A root's child-collection channel failed. Membership is now unknown;
    /// last-known children and their contributions are retained as stale
    /// data. No retry here — recovery is the caller re-invoking `set_roots`.
    fn handle_child_collection_error(
        ctx: &Arc<TreeCtx>,
        root: &RootId,
        generation: Generation,
        err: SourceError,
    ) {
        let mut state = ctx.state.lock();
        let Some(node) = state.roots.get_mut(root) else {
            return Self::stale(generation, "error for departed root");
        };
        if node.handle.generation() != generation || node.handle.status().is_terminal() {
            return Self::stale(generation, "child-collection error");
        }
        warn!(root = %root, error = %err, "child-collection subscription errored");
        node.handle.mark_errored();
    }

    /// A leaf emitted: update the child's contribution and republish.
    fn handle_leaf(
        ctx: &Arc<TreeCtx>,
        root: &RootId,
        child: &ChildId,
        generation: Generation,
        items: Vec<Entity>,
    ) {
        let mut state = ctx.state.lock();
        let TreeState { roots, aggregates } = &mut *state;
        let Some(child_node) = roots
            .get_mut(root)
            .and_then(|node| node.children.get_mut(child))
        else {
            return Self::stale(generation, "leaf emission for departed child");
        };
        // Errored is terminal for this generation; a buffered emission after
        // the failure must not re-apply a contribution.
        if child_node.handle.generation() != generation || child_node.handle.status().is_terminal()
        {
            return Self::stale(generation, "leaf emission");
        }
        child_node.handle.mark_active();

        let value = (ctx.reducer)(&items);
        aggregates.set_contribution(root, child, value);
    }

    /// A leaf channel failed: the node's contribution becomes unknown and is
    /// excluded from the aggregate. Not fatal to the tree.
    fn handle_leaf_error(
        ctx: &Arc<TreeCtx>,
        root: &RootId,
        child: &ChildId,
        generation: Generation,
        err: SourceError,
    ) {
        let mut state = ctx.state.lock();
        let TreeState { roots, aggregates } = &mut *state;
        let Some(child_node) = roots
            .get_mut(root)
            .and_then(|node| node.children.get_mut(child))
        else {
            return Self::stale(generation, "leaf error for departed child");
        };
        if child_node.handle.generation() != generation || child_node.handle.status().is_terminal()
        {
            return Self::stale(generation, "leaf error");
        }
        warn!(root = %root, child = %child, error = %err, "leaf subscription errored");
        child_node.handle.mark_errored();
        aggregates.clear_contribution(root, child);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CollectionPath, InMemorySource};
    use serde_json::json;

    const BOARD_LAYOUT: (&str, &str) = ("boards/{root}/lists", "boards/{root}/lists/{child}/cards");

    fn setup() -> (Arc<InMemorySource>, SubscriptionTree) {
        let source = Arc::new(InMemorySource::new());
        let tree = SubscriptionTree::new(
            Arc::clone(&source) as Arc<dyn RemoteCollectionSource>,
            Arc::new(GenerationCounter::new()),
            TreeLayout::new(BOARD_LAYOUT.0, BOARD_LAYOUT.1),
        );
        (source, tree)
    }

    fn root(id: &str) -> RootId {
        RootId::new(id)
    }

    fn child(id: &str) -> ChildId {
        ChildId::new(id)
    }

    fn lists_path(root: &str) -> CollectionPath {
        CollectionPath::new(format!("boards/{root}/lists"))
    }

    fn cards_path(root: &str, child: &str) -> CollectionPath {
        CollectionPath::new(format!("boards/{root}/lists/{child}/cards"))
    }

    fn list_entities(ids: &[&str]) -> Vec<Entity> {
        ids.iter().map(|id| Entity::new(*id, json!({}))).collect()
    }

    fn cards(n: usize) -> Vec<Entity> {
        (0..n)
            .map(|i| Entity::new(format!("c{i}"), json!({})))
            .collect()
    }

    #[test]
    fn test_two_boards_aggregate_independently() {
        let (source, tree) = setup();
        tree.set_roots(&[root("a"), root("b")]);

        source.set_collection(&lists_path("a"), list_entities(&["l1", "l2"]));
        source.set_collection(&lists_path("b"), list_entities(&["l3"]));

        source.set_collection(&cards_path("a", "l1"), cards(3));
        source.set_collection(&cards_path("a", "l2"), cards(5));
        source.set_collection(&cards_path("b", "l3"), cards(2));

        assert_eq!(tree.aggregate_of(&root("a")), Some(8.0));
        assert_eq!(tree.aggregate_of(&root("b")), Some(2.0));
    }

    #[test]
    fn test_child_removal_updates_aggregate_immediately() {
        let (source, tree) = setup();
        tree.set_roots(&[root("a")]);

        source.set_collection(&lists_path("a"), list_entities(&["l1", "l2"]));
        source.set_collection(&cards_path("a", "l1"), cards(3));
        source.set_collection(&cards_path("a", "l2"), cards(5));
        assert_eq!(tree.aggregate_of(&root("a")), Some(8.0));

        // Dropping l2 takes effect without waiting for l1 to re-emit.
        source.set_collection(&lists_path("a"), list_entities(&["l1"]));
        assert_eq!(tree.aggregate_of(&root("a")), Some(3.0));
        assert_eq!(source.listeners_on(&cards_path("a", "l2")), 0);
    }

    #[test]
    fn test_leaf_subscriptions_match_roots_times_children() {
        let (source, tree) = setup();
        tree.set_roots(&[root("a"), root("b")]);

        source.set_collection(&lists_path("a"), list_entities(&["l1", "l2"]));
        source.set_collection(&lists_path("b"), list_entities(&["l3"]));

        // Two child-collection listeners plus three leaf listeners.
        assert_eq!(source.active_listener_count(), 5);
        assert_eq!(
            tree.stats(),
            TreeStats {
                root_count: 2,
                child_count: 3
            }
        );

        tree.set_roots(&[root("b")]);
        assert_eq!(source.active_listener_count(), 2);
        assert_eq!(
            tree.stats(),
            TreeStats {
                root_count: 1,
                child_count: 1
            }
        );
    }

    #[test]
    fn test_unchanged_children_are_not_resubscribed() {
        let (source, tree) = setup();
        tree.set_roots(&[root("a")]);

        source.set_collection(&lists_path("a"), list_entities(&["l1", "l2"]));
        source.set_collection(&cards_path("a", "l1"), cards(3));
        source.set_collection(&cards_path("a", "l2"), cards(5));

        let mut updates = tree.subscribe_updates();
        while updates.try_recv().is_ok() {}

        // Same id set again: no teardown, no churn, no transient zero.
        source.set_collection(&lists_path("a"), list_entities(&["l1", "l2"]));

        assert_eq!(tree.aggregate_of(&root("a")), Some(8.0));
        assert!(updates.try_recv().is_err());
        assert_eq!(source.listeners_on(&cards_path("a", "l1")), 1);
        assert_eq!(source.listeners_on(&cards_path("a", "l2")), 1);
    }

    #[test]
    fn test_removed_root_loses_aggregate_entry() {
        let (source, tree) = setup();
        tree.set_roots(&[root("a")]);
        source.set_collection(&lists_path("a"), list_entities(&["l1"]));
        source.set_collection(&cards_path("a", "l1"), cards(4));
        assert_eq!(tree.aggregate_of(&root("a")), Some(4.0));

        tree.set_roots(&[]);
        assert_eq!(tree.aggregate_of(&root("a")), None);
        assert_eq!(source.active_listener_count(), 0);
    }

    #[test]
    fn test_root_removed_before_first_emission() {
        let (source, tree) = setup();
        tree.set_roots(&[root("a")]);
        tree.set_roots(&[]);

        assert_eq!(source.active_listener_count(), 0);
        assert_eq!(tree.aggregate_of(&root("a")), None);

        // The child list that never got delivered can still be published by
        // the store; nobody is listening and nothing resurrects the root.
        source.set_collection(&lists_path("a"), list_entities(&["l1"]));
        assert_eq!(
            tree.stats(),
            TreeStats {
                root_count: 0,
                child_count: 0
            }
        );
    }

    #[test]
    fn test_leaf_error_excludes_contribution_only() {
        let (source, tree) = setup();
        tree.set_roots(&[root("a")]);
        source.set_collection(&lists_path("a"), list_entities(&["l1", "l2"]));
        source.set_collection(&cards_path("a", "l1"), cards(3));
        source.set_collection(&cards_path("a", "l2"), cards(5));

        source.fail(&cards_path("a", "l2"), SourceError::transient("boom"));

        // l2's contribution is unknown, the rest of the tree is intact.
        assert_eq!(tree.aggregate_of(&root("a")), Some(3.0));
        assert_eq!(
            tree.child_status(&root("a"), &child("l2")),
            Some(SubscriptionStatus::Errored)
        );
        assert_eq!(
            tree.child_status(&root("a"), &child("l1")),
            Some(SubscriptionStatus::Active)
        );
    }

    #[test]
    fn test_child_collection_error_keeps_last_known_children() {
        let (source, tree) = setup();
        tree.set_roots(&[root("a")]);
        source.set_collection(&lists_path("a"), list_entities(&["l1"]));
        source.set_collection(&cards_path("a", "l1"), cards(4));

        source.fail(&lists_path("a"), SourceError::transient("membership lost"));

        assert_eq!(tree.root_status(&root("a")), Some(SubscriptionStatus::Errored));
        // Stale membership and contributions remain visible.
        assert_eq!(tree.aggregate_of(&root("a")), Some(4.0));
    }

    #[test]
    fn test_aggregate_updates_are_published() {
        let (source, tree) = setup();
        let mut updates = tree.subscribe_updates();

        tree.set_roots(&[root("a")]);
        source.set_collection(&lists_path("a"), list_entities(&["l1"]));
        source.set_collection(&cards_path("a", "l1"), cards(2));

        assert_eq!(
            updates.try_recv().unwrap(),
            AggregateUpdate {
                root: root("a"),
                value: 0.0
            }
        );
        assert_eq!(
            updates.try_recv().unwrap(),
            AggregateUpdate {
                root: root("a"),
                value: 2.0
            }
        );
    }

    #[test]
    fn test_sum_field_reducer() {
        let source = Arc::new(InMemorySource::new());
        let tree = SubscriptionTree::with_reducer(
            Arc::clone(&source) as Arc<dyn RemoteCollectionSource>,
            Arc::new(GenerationCounter::new()),
            TreeLayout::new(BOARD_LAYOUT.0, BOARD_LAYOUT.1),
            sum_field_reducer("weight"),
        );

        tree.set_roots(&[root("a")]);
        source.set_collection(&lists_path("a"), list_entities(&["l1"]));
        source.set_collection(
            &cards_path("a", "l1"),
            vec![
                Entity::new("c1", json!({"weight": 2.5})),
                Entity::new("c2", json!({"weight": 4})),
                Entity::new("c3", json!({"label": "no weight"})),
            ],
        );

        assert_eq!(tree.aggregate_of(&root("a")), Some(6.5));
    }
}
