//! Leak detection for pooled and transaction-scoped resources
//!
//! Every resource that must be released through an explicit path carries a
//! `LeakGuard`. Dropping an armed guard means the owner was reclaimed
//! without that path running; the guard logs the diagnostic tag and bumps a
//! process-wide counter that tests poll. Release builds keep the disarm
//! bookkeeping but skip the accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::error;

static LEAKED: AtomicUsize = AtomicUsize::new(0);

/// Total number of armed guards dropped since process start.
pub fn leaked_total() -> usize {
    LEAKED.load(Ordering::Relaxed)
}

/// Drop guard that fires a diagnostic unless explicitly disarmed.
#[derive(Debug)]
pub struct LeakGuard {
    tag: String,
    armed: bool,
    /// Test hook: an extra counter observed by the owning test
    observer: Option<Arc<AtomicUsize>>,
}

impl LeakGuard {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            armed: true,
            observer: None,
        }
    }

    /// Guard whose firings are also counted into `observer`.
    pub fn with_observer(tag: impl Into<String>, observer: Arc<AtomicUsize>) -> Self {
        Self {
            tag: tag.into(),
            armed: true,
            observer: Some(observer),
        }
    }

    /// Mark the resource as explicitly released. Must be called before or
    /// as part of the owner's close path.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Drop for LeakGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if cfg!(debug_assertions) {
            error!(tag = %self.tag, "Resource dropped without explicit release");
            LEAKED.fetch_add(1, Ordering::Relaxed);
            if let Some(ref observer) = self.observer {
                observer.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
