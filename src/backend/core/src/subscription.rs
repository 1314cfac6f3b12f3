//! Shared subscription primitives: generations, status, cancelable handles.
//!
//! Every live subscription in the engine is wrapped in a
//! [`SubscriptionHandle`] tagged with a [`Generation`]. Callbacks carry the
//! generation they were created under; handlers compare it against the
//! handle's current generation and silently drop mismatches. That covers a
//! collaborator that delivers one more buffered event after cancellation was
//! requested.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::source::{CancelFn, CollectionPath};

// ═══════════════════════════════════════════════════════════════════════════════
// Generations
// ═══════════════════════════════════════════════════════════════════════════════

/// Monotonically increasing tag identifying one subscription instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Generation(u64);

impl Generation {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Issues strictly increasing generations for one engine instance.
///
/// A single counter is shared across all nodes, so generations are strictly
/// increasing per node as well.
#[derive(Debug)]
pub struct GenerationCounter {
    next: AtomicU64,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Issue the next generation.
    pub fn issue(&self) -> Generation {
        Generation(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle of one subscription generation.
///
/// `Canceled` and `Errored` are terminal for that generation; re-entering
/// `Active` requires a new handle under a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Created, no emission received yet
    Pending,
    /// At least one emission received
    Active,
    /// Torn down by the owner
    Canceled,
    /// The channel delivered a failure
    Errored,
}

impl SubscriptionStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Errored)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handles
// ═══════════════════════════════════════════════════════════════════════════════

/// A live subscription against the remote store.
///
/// Cancellation is idempotent and also runs on drop, so a handle cannot leak
/// its listener regardless of exit path.
pub struct SubscriptionHandle {
    generation: Generation,
    path: CollectionPath,
    status: SubscriptionStatus,
    cancel: Option<CancelFn>,
    created_at: DateTime<Utc>,
}

impl SubscriptionHandle {
    pub fn new(generation: Generation, path: CollectionPath, cancel: CancelFn) -> Self {
        counter!("callboard_subscriptions_opened_total").increment(1);
        trace!(%generation, path = %path, "subscription opened");
        Self {
            generation,
            path,
            status: SubscriptionStatus::Pending,
            cancel: Some(cancel),
            created_at: Utc::now(),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn path(&self) -> &CollectionPath {
        &self.path
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record the first (or any later) successful emission.
    pub fn mark_active(&mut self) {
        if self.status == SubscriptionStatus::Pending {
            self.status = SubscriptionStatus::Active;
        }
    }

    /// Record a channel failure and release the listener.
    pub fn mark_errored(&mut self) {
        self.teardown(SubscriptionStatus::Errored);
    }

    /// Tear the subscription down. Safe to call any number of times.
    pub fn cancel(&mut self) {
        self.teardown(SubscriptionStatus::Canceled);
    }

    fn teardown(&mut self, terminal: SubscriptionStatus) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
            counter!("callboard_subscriptions_canceled_total").increment(1);
            trace!(
                generation = %self.generation,
                path = %self.path,
                status = ?terminal,
                "subscription torn down"
            );
        }
        if !self.status.is_terminal() {
            self.status = terminal;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.teardown(SubscriptionStatus::Canceled);
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("generation", &self.generation)
            .field("path", &self.path)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
