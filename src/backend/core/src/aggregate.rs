//! Live numeric aggregates derived from leaf subscriptions.
//!
//! The cache holds one contribution per (root, child) pair. A root's
//! aggregate is always the sum of its currently-live children's last-known
//! contributions: a removed or unknown child is excluded the moment the tree
//! says so, never lazily on the child's next emission. Consumers react to
//! [`AggregateUpdate`] notifications on a broadcast channel rather than poll.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier of a root document (e.g. a task board).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RootId(String);

impl RootId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a child document under a root (e.g. a list on a board).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChildId(String);

impl ChildId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Updates
// ═══════════════════════════════════════════════════════════════════════════════

/// A freshly published aggregate value for one root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateUpdate {
    pub root: RootId,
    pub value: f64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-root numeric summaries, kept live by the subscription tree.
pub struct AggregationCache {
    contributions: HashMap<RootId, HashMap<ChildId, f64>>,
    updates: broadcast::Sender<AggregateUpdate>,
}

impl AggregationCache {
    pub fn new(channel_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            contributions: HashMap::new(),
            updates,
        }
    }

    /// Receive aggregate updates as they are published.
    pub fn subscribe(&self) -> broadcast::Receiver<AggregateUpdate> {
        self.updates.subscribe()
    }

    /// Begin tracking a root. Its aggregate starts at zero.
    pub fn track_root(&mut self, root: &RootId) {
        self.contributions.entry(root.clone()).or_default();
        self.publish(root);
    }

    /// Drop a root and its aggregate entry entirely.
    pub fn remove_root(&mut self, root: &RootId) {
        if self.contributions.remove(root).is_some() {
            debug!(root = %root, "aggregate entry removed");
        }
    }

    /// Record a child's latest known contribution.
    pub fn set_contribution(&mut self, root: &RootId, child: &ChildId, value: f64) {
        if let Some(children) = self.contributions.get_mut(root) {
            children.insert(child.clone(), value);
            self.publish(root);
        }
    }

    /// Mark a child's contribution unknown (e.g. its leaf channel errored).
    /// The child stays live; its value is excluded until it reports again.
    pub fn clear_contribution(&mut self, root: &RootId, child: &ChildId) {
        if let Some(children) = self.contributions.get_mut(root) {
            if children.remove(child).is_some() {
                self.publish(root);
            }
        }
    }

    /// Drop a departed child's contribution.
    pub fn remove_child(&mut self, root: &RootId, child: &ChildId) {
        self.clear_contribution(root, child);
    }

    /// Current aggregate for a root; `None` if the root is not tracked.
    pub fn total_of(&self, root: &RootId) -> Option<f64> {
        self.contributions
            .get(root)
            .map(|children| children.values().sum())
    }

    /// Number of tracked roots.
    pub fn root_count(&self) -> usize {
        self.contributions.len()
    }

    fn publish(&self, root: &RootId) {
        if let Some(value) = self.total_of(root) {
            // No receivers is fine; consumers attach when they care.
            let _ = self.updates.send(AggregateUpdate {
                root: root.clone(),
                value,
            });
        }
    }
}

impl fmt::Debug for AggregationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationCache")
            .field("contributions", &self.contributions)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
