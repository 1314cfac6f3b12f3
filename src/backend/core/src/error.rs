//! Error handling for the Callboard live-sync engine.
//!
//! This module provides:
//! - A stable error taxonomy shared with the remote-store collaborator
//! - Severity classification for logging and alerting
//! - Error chaining with source errors
//! - Tracing and metrics integration
//!
//! Nothing in the engine surface panics or throws past this type: views expose
//! data and error state simultaneously and leave the stale-data-vs-block
//! decision to the consumer.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Kinds
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error kinds.
///
/// The first four mirror the failure classes the remote document store can
/// deliver on a watch channel; the rest are crate-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Connectivity hiccup. Stale data is retained and the next successful
    /// emission clears the condition.
    TransientNetwork,
    /// Authorization-class failure. Latches the affected view until a fresh
    /// subscribe.
    PermissionDenied,
    /// The queried collection or document does not exist. Treated as an empty
    /// result set, not an error.
    NotFound,
    /// A callback arrived tagged with a dead generation. Internal only,
    /// silently dropped, never surfaced to consumers.
    StaleGeneration,

    /// Two sources in one merged view target the same logical path.
    DuplicateSource,
    /// The platform preference store failed to read or write.
    Preference,
    /// Configuration could not be loaded or is invalid.
    InvalidConfiguration,
    /// Catch-all for bugs and unclassified failures.
    Internal,
}

impl ErrorKind {
    /// Whether the condition clears on its own with continued emissions.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork | Self::Preference)
    }

    /// Whether the condition requires an explicit fresh subscribe to recover.
    pub const fn is_fatal_to_view(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }

    /// Error category for metric labels.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::TransientNetwork | Self::PermissionDenied | Self::NotFound => "source",
            Self::StaleGeneration => "generation",
            Self::DuplicateSource => "view",
            Self::Preference => "preference",
            Self::InvalidConfiguration => "configuration",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected operational noise (stale callbacks, empty collections)
    Low,
    /// Degraded but self-healing (transient network, preference I/O)
    Medium,
    /// Requires consumer action (permission latch, bad configuration, bugs)
    High,
}

impl ErrorSeverity {
    /// Get severity based on error kind.
    pub const fn from_kind(kind: &ErrorKind) -> Self {
        match kind {
            ErrorKind::StaleGeneration | ErrorKind::NotFound => Self::Low,
            ErrorKind::TransientNetwork | ErrorKind::Preference => Self::Medium,
            ErrorKind::PermissionDenied
            | ErrorKind::DuplicateSource
            | ErrorKind::InvalidConfiguration
            | ErrorKind::Internal => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the engine.
#[derive(Error, Debug)]
pub struct SyncError {
    /// Machine-readable kind
    kind: ErrorKind,

    /// Human-readable message (safe to surface in a banner)
    message: Cow<'static, str>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl SyncError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        let err = Self {
            kind,
            message: message.into(),
            source: None,
        };
        err.record_metrics();
        err
    }

    /// Create a transient network error.
    pub fn transient(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::TransientNetwork, message)
    }

    /// Create a permission-denied error.
    pub fn permission_denied(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    /// Create a duplicate-source error.
    pub fn duplicate_source(path: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::DuplicateSource,
            format!("duplicate source path in one view: {}", path),
        )
    }

    /// Create a preference-store error.
    pub fn preference(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Preference, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::InvalidConfiguration, message)
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Check if this error clears on its own.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_kind(&self.kind)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let kind = self.kind.to_string();
        let category = self.kind.category();

        match self.severity() {
            ErrorSeverity::High => {
                error!(
                    error_kind = %kind,
                    category = category,
                    message = %self.message,
                    source = ?self.source,
                    "sync error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_kind = %kind,
                    category = category,
                    message = %self.message,
                    "sync error"
                );
            }
            ErrorSeverity::Low => {
                debug!(
                    error_kind = %kind,
                    category = category,
                    message = %self.message,
                    "sync error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "callboard_sync_errors_total",
            "kind" => self.kind.to_string(),
            "category" => self.kind.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
