//! Integration tests for the Callboard live-sync engine.
//!
//! These tests verify end-to-end functionality across modules.

use callboard_core::aggregate::{AggregateUpdate, RootId};
use callboard_core::selection::{JsonFilePreferenceStore, PreferenceStore, SelectionStore};
use callboard_core::source::{
    CollectionPath, Entity, EntityId, FilterPredicate, InMemorySource, RemoteCollectionSource,
    SourceError, SourceQuery,
};
use callboard_core::subscription::GenerationCounter;
use callboard_core::tree::{SubscriptionTree, TreeLayout, TreeStats};
use callboard_core::view::MergedQueryView;
use serde_json::json;
use std::sync::Arc;

// ============================================================================
// Test Utilities
// ============================================================================

const SELECTION_KEY: &str = "selected-production";

fn shows(ids: &[&str]) -> Vec<Entity> {
    ids.iter()
        .map(|id| Entity::new(*id, json!({"title": id.to_uppercase()})))
        .collect()
}

fn cards(n: usize) -> Vec<Entity> {
    (0..n)
        .map(|i| Entity::new(format!("c{i}"), json!({})))
        .collect()
}

fn engine() -> (Arc<InMemorySource>, Arc<GenerationCounter>) {
    (
        Arc::new(InMemorySource::new()),
        Arc::new(GenerationCounter::new()),
    )
}

// ============================================================================
// View + Selection Integration Tests
// ============================================================================

#[test]
fn test_view_feeds_selection_through_binding() {
    let (source, generations) = engine();
    let view = MergedQueryView::new(
        Arc::clone(&source) as Arc<dyn RemoteCollectionSource>,
        generations,
    );
    let prefs = Arc::new(JsonFilePreferenceStore::new(
        tempfile::tempdir().unwrap().path().join("prefs.json"),
    ));
    let selection = Arc::new(SelectionStore::new(
        SELECTION_KEY,
        prefs as Arc<dyn PreferenceStore>,
    ));
    selection.bind(&view);

    let owned = CollectionPath::new("shows/owned");
    let shared = CollectionPath::new("shows/shared");
    view.subscribe(&[SourceQuery::new("shows/owned"), SourceQuery::new("shows/shared")])
        .unwrap();

    // First non-empty merged snapshot drives the initial selection.
    source.set_collection(&owned, shows(&["s2", "s3"]));
    assert_eq!(selection.current(), Some(EntityId::new("s2")));

    // Overlapping data from the second source does not disturb it.
    source.set_collection(&shared, shows(&["s1", "s2"]));
    assert_eq!(selection.current(), Some(EntityId::new("s2")));

    // When the selected show vanishes from both sources, the selection
    // clears and stays cleared.
    source.set_collection(&owned, shows(&["s3"]));
    source.set_collection(&shared, shows(&["s1"]));
    assert_eq!(selection.current(), None);
}

#[test]
fn test_selection_survives_restart_via_preference_file() {
    let dir = tempfile::tempdir().unwrap();
    let prefs_path = dir.path().join("prefs.json");
    let owned = CollectionPath::new("shows/owned");

    {
        let (source, generations) = engine();
        let view = MergedQueryView::new(
            Arc::clone(&source) as Arc<dyn RemoteCollectionSource>,
            generations,
        );
        let prefs = Arc::new(JsonFilePreferenceStore::new(&prefs_path));
        let selection = Arc::new(SelectionStore::new(
            SELECTION_KEY,
            prefs as Arc<dyn PreferenceStore>,
        ));
        selection.bind(&view);
        view.subscribe(&[SourceQuery::new("shows/owned")]).unwrap();
        source.set_collection(&owned, shows(&["s1", "s4"]));

        selection.select(Some(EntityId::new("s4"))).unwrap();
    }

    // A fresh engine over the same preference file restores the choice once
    // the view confirms membership.
    let (source, generations) = engine();
    let view = MergedQueryView::new(
        Arc::clone(&source) as Arc<dyn RemoteCollectionSource>,
        generations,
    );
    let prefs = Arc::new(JsonFilePreferenceStore::new(&prefs_path));
    let selection = Arc::new(SelectionStore::new(
        SELECTION_KEY,
        prefs as Arc<dyn PreferenceStore>,
    ));
    selection.bind(&view);
    view.subscribe(&[SourceQuery::new("shows/owned")]).unwrap();
    source.set_collection(&owned, shows(&["s1", "s4"]));

    assert_eq!(selection.current(), Some(EntityId::new("s4")));
}

#[test]
fn test_permission_latch_freezes_view_and_selection() {
    let (source, generations) = engine();
    let view = MergedQueryView::new(
        Arc::clone(&source) as Arc<dyn RemoteCollectionSource>,
        generations,
    );
    let prefs = Arc::new(JsonFilePreferenceStore::new(
        tempfile::tempdir().unwrap().path().join("prefs.json"),
    ));
    let selection = Arc::new(SelectionStore::new(
        SELECTION_KEY,
        prefs as Arc<dyn PreferenceStore>,
    ));
    selection.bind(&view);

    let owned = CollectionPath::new("shows/owned");
    view.subscribe(&[SourceQuery::new("shows/owned")]).unwrap();
    source.set_collection(&owned, shows(&["s1"]));
    assert_eq!(selection.current(), Some(EntityId::new("s1")));

    source.fail(&owned, SourceError::permission_denied("revoked"));
    assert!(view.is_latched());
    assert!(view.snapshot().is_empty());
    assert_eq!(source.active_listener_count(), 0);

    // Selection is left alone while the latch is set; no churn, no clearing
    // driven by the emptied view.
    assert_eq!(selection.current(), Some(EntityId::new("s1")));

    // Recovery is an explicit resubscribe.
    view.subscribe(&[SourceQuery::new("shows/owned")]).unwrap();
    assert!(!view.is_latched());
    source.set_collection(&owned, shows(&["s1", "s2"]));
    assert_eq!(view.snapshot().len(), 2);
}

#[test]
fn test_server_side_filter_applies_per_query() {
    let (source, generations) = engine();
    let view = MergedQueryView::new(
        Arc::clone(&source) as Arc<dyn RemoteCollectionSource>,
        generations,
    );

    let path = CollectionPath::new("shows/all");
    view.subscribe(&[
        SourceQuery::new("shows/all").with_filter(FilterPredicate::equals("owner", "me"))
    ])
    .unwrap();

    source.set_collection(
        &path,
        vec![
            Entity::new("mine", json!({"owner": "me"})),
            Entity::new("theirs", json!({"owner": "them"})),
        ],
    );

    let snap = view.snapshot();
    assert_eq!(snap.len(), 1);
    assert!(snap.contains(&EntityId::new("mine")));
}

// ============================================================================
// Tree + Aggregate Integration Tests
// ============================================================================

fn board_tree(source: &Arc<InMemorySource>) -> SubscriptionTree {
    SubscriptionTree::new(
        Arc::clone(source) as Arc<dyn RemoteCollectionSource>,
        Arc::new(GenerationCounter::new()),
        TreeLayout::new("boards/{root}/lists", "boards/{root}/lists/{child}/cards"),
    )
}

fn lists_path(root: &str) -> CollectionPath {
    CollectionPath::new(format!("boards/{root}/lists"))
}

fn cards_path(root: &str, child: &str) -> CollectionPath {
    CollectionPath::new(format!("boards/{root}/lists/{child}/cards"))
}

#[test]
fn test_card_counts_roll_up_per_board() {
    let source = Arc::new(InMemorySource::new());
    let tree = board_tree(&source);
    let mut updates = tree.subscribe_updates();

    tree.set_roots(&[RootId::new("a"), RootId::new("b")]);

    source.set_collection(&lists_path("a"), shows(&["l1", "l2"]));
    source.set_collection(&lists_path("b"), shows(&["l3"]));
    source.set_collection(&cards_path("a", "l1"), cards(3));
    source.set_collection(&cards_path("a", "l2"), cards(5));
    source.set_collection(&cards_path("b", "l3"), cards(2));

    assert_eq!(tree.aggregate_of(&RootId::new("a")), Some(8.0));
    assert_eq!(tree.aggregate_of(&RootId::new("b")), Some(2.0));

    // Removing a list from board A updates its total without waiting on the
    // surviving list to re-emit.
    source.set_collection(&lists_path("a"), shows(&["l1"]));
    assert_eq!(tree.aggregate_of(&RootId::new("a")), Some(3.0));

    // The update stream ends on the corrected value.
    let mut last_a = None;
    while let Ok(update) = updates.try_recv() {
        if update.root == RootId::new("a") {
            last_a = Some(update);
        }
    }
    assert_eq!(
        last_a,
        Some(AggregateUpdate {
            root: RootId::new("a"),
            value: 3.0
        })
    );
}

#[test]
fn test_leaf_subscription_count_tracks_membership() {
    let source = Arc::new(InMemorySource::new());
    let tree = board_tree(&source);

    tree.set_roots(&[RootId::new("a"), RootId::new("b")]);
    source.set_collection(&lists_path("a"), shows(&["l1", "l2"]));
    source.set_collection(&lists_path("b"), shows(&["l3"]));

    // One child-collection listener per root plus one leaf listener per
    // last-known child.
    assert_eq!(source.active_listener_count(), 5);
    assert_eq!(
        tree.stats(),
        TreeStats {
            root_count: 2,
            child_count: 3
        }
    );

    // Board A's list set shrinks, then the board itself departs.
    source.set_collection(&lists_path("a"), shows(&["l1"]));
    assert_eq!(source.active_listener_count(), 4);

    tree.set_roots(&[RootId::new("b")]);
    assert_eq!(source.active_listener_count(), 2);

    tree.set_roots(&[]);
    assert_eq!(source.active_listener_count(), 0);
}

#[test]
fn test_view_and_tree_share_one_source() {
    // A production list view and a board aggregate tree running against the
    // same store do not interfere.
    let (source, generations) = engine();
    let view = MergedQueryView::new(
        Arc::clone(&source) as Arc<dyn RemoteCollectionSource>,
        Arc::clone(&generations),
    );
    let tree = SubscriptionTree::new(
        Arc::clone(&source) as Arc<dyn RemoteCollectionSource>,
        generations,
        TreeLayout::new("boards/{root}/lists", "boards/{root}/lists/{child}/cards"),
    );

    view.subscribe(&[SourceQuery::new("productions")]).unwrap();
    tree.set_roots(&[RootId::new("a")]);

    source.set_collection(&CollectionPath::new("productions"), shows(&["p1"]));
    source.set_collection(&lists_path("a"), shows(&["l1"]));
    source.set_collection(&cards_path("a", "l1"), cards(7));

    assert_eq!(view.snapshot().len(), 1);
    assert_eq!(tree.aggregate_of(&RootId::new("a")), Some(7.0));

    view.unsubscribe_all();
    assert_eq!(tree.aggregate_of(&RootId::new("a")), Some(7.0));
    assert_eq!(source.active_listener_count(), 2);
}
