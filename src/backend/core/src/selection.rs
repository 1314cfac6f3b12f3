//! Current-selection derivation and persistence.
//!
//! A [`SelectionStore`] derives a single "current selection" from a merged
//! view: on the first non-empty view it restores a persisted preferred id if
//! still a member, otherwise selects the first element in the view's stable
//! order and persists that choice. A selection whose id later disappears from
//! the view is cleared — never silently replaced; the caller decides what
//! happens next. Nothing is reselected while the view is latched.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::source::EntityId;
use crate::view::{MergedQueryView, MergedSnapshot};

// ═══════════════════════════════════════════════════════════════════════════════
// Preference Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Platform key-value store for durable user preferences.
pub trait PreferenceStore: Send + Sync {
    /// Persist a value under a key; `None` clears the key.
    fn persist(&self, key: &str, value: Option<&str>) -> Result<()>;

    /// Read a previously persisted value.
    fn read(&self, key: &str) -> Result<Option<String>>;
}

/// Volatile preference store, mostly for tests.
#[derive(Default)]
pub struct MemoryPreferenceStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn persist(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut entries = self.entries.lock();
        match value {
            Some(value) => entries.insert(key.to_string(), value.to_string()),
            None => entries.remove(key),
        };
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }
}

/// Preference store backed by a single JSON file.
pub struct JsonFilePreferenceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| SyncError::preference("preference file is corrupt").with_source(e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(SyncError::preference("failed to read preference file").with_source(e)),
        }
    }

    fn store(&self, entries: &HashMap<String, String>) -> Result<()> {
        let contents = serde_json::to_string_pretty(entries)
            .map_err(|e| SyncError::preference("failed to encode preferences").with_source(e))?;
        fs::write(&self.path, contents)
            .map_err(|e| SyncError::preference("failed to write preference file").with_source(e))
    }
}

impl PreferenceStore for JsonFilePreferenceStore {
    fn persist(&self, key: &str, value: Option<&str>) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        match value {
            Some(value) => entries.insert(key.to_string(), value.to_string()),
            None => entries.remove(key),
        };
        self.store(&entries)
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.get(key).cloned())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Selection Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct SelectionState {
    current: Option<EntityId>,
    /// Whether the first-non-empty-view selection has already run. A cleared
    /// selection afterwards stays cleared until the caller selects again.
    initialized: bool,
}

/// Derives and persists the current selection from a merged view.
pub struct SelectionStore {
    key: String,
    prefs: Arc<dyn PreferenceStore>,
    state: Mutex<SelectionState>,
}

impl SelectionStore {
    pub fn new(key: impl Into<String>, prefs: Arc<dyn PreferenceStore>) -> Self {
        Self {
            key: key.into(),
            prefs,
            state: Mutex::new(SelectionState::default()),
        }
    }

    /// The currently selected id, if any.
    pub fn current(&self) -> Option<EntityId> {
        self.state.lock().current.clone()
    }

    /// Caller-driven selection; persists for restoration across restarts.
    pub fn select(&self, id: Option<EntityId>) -> Result<()> {
        let mut state = self.state.lock();
        state.initialized = true;
        state.current = id.clone();
        drop(state);
        self.prefs
            .persist(&self.key, id.as_ref().map(|i| i.as_str()))
    }

    /// Reconcile the selection with a new view snapshot.
    pub fn sync_with(&self, snapshot: &MergedSnapshot) -> Result<()> {
        if snapshot.latched {
            return Ok(());
        }

        let mut state = self.state.lock();
        if !state.initialized {
            if snapshot.is_empty() {
                return Ok(());
            }
            state.initialized = true;

            let preferred = self.prefs.read(&self.key)?.map(EntityId::new);
            let chosen = match preferred {
                Some(id) if snapshot.contains(&id) => id,
                _ => match snapshot.first_id() {
                    Some(id) => id,
                    None => return Ok(()),
                },
            };
            debug!(id = %chosen, "initial selection");
            state.current = Some(chosen.clone());
            drop(state);
            return self.prefs.persist(&self.key, Some(chosen.as_str()));
        }

        if let Some(current) = &state.current {
            if !snapshot.contains(current) {
                // The selected document vanished from the view. Clear, do not
                // auto-reselect; the caller decides what happens next.
                debug!(id = %current, "selection disappeared from view");
                state.current = None;
            }
        }
        Ok(())
    }

    /// Register this store as a change observer on a merged view.
    pub fn bind(self: &Arc<Self>, view: &MergedQueryView) {
        let store = Arc::clone(self);
        view.on_change(Arc::new(move |snapshot| {
            if let Err(err) = store.sync_with(snapshot) {
                err.log();
            }
        }));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
