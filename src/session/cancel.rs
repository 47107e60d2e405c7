//! Cancel registry: named cancellation handles for one session

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

/// Key under which the response pipeline registers
pub const PROCESSING: &str = "processing";

/// A registered operation's handle
///
/// The generation number makes deregistration exact: an operation only ever
/// removes its own entry, never a newer one registered under the same name.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    key: &'static str,
    generation: u64,
    token: CancellationToken,
}

impl CancelHandle {
    /// Registry key
    #[must_use]
    pub const fn key(&self) -> &'static str {
        self.key
    }

    /// Token observed by the operation
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the operation has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

type Entries = HashMap<&'static str, (u64, CancellationToken)>;

/// Tracks cancellable operations by name
///
/// Every token is a child of the session's root token, so tearing down the
/// session cancels everything even if it was never registered here.
#[derive(Debug)]
pub struct CancelRegistry {
    root: CancellationToken,
    entries: Mutex<Entries>,
    next_generation: AtomicU64,
}

impl CancelRegistry {
    /// Create a registry whose tokens descend from `root`
    #[must_use]
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            entries: Mutex::default(),
            next_generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh handle under `key`
    ///
    /// An existing handle under the same key is cancelled and replaced.
    #[must_use]
    pub fn register(&self, key: &'static str) -> CancelHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        let previous = self.lock().insert(key, (generation, token.clone()));
        if let Some((_, stale)) = previous {
            tracing::debug!(key, "replacing registered operation");
            stale.cancel();
        }
        CancelHandle {
            key,
            generation,
            token,
        }
    }

    /// Remove a handle after normal completion
    ///
    /// Returns false if the entry was already cancelled or replaced.
    pub fn deregister(&self, handle: &CancelHandle) -> bool {
        let mut entries = self.lock();
        match entries.get(handle.key) {
            Some((generation, _)) if *generation == handle.generation => {
                entries.remove(handle.key);
                true
            }
            _ => false,
        }
    }

    /// Cancel and remove one named operation
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.lock().remove(key);
        removed.is_some_and(|(_, token)| {
            token.cancel();
            true
        })
    }

    /// Cancel every registered operation and clear the registry
    ///
    /// Returns the number of operations cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<CancellationToken> = self.lock().drain().map(|(_, (_, t))| t).collect();
        for token in &drained {
            token.cancel();
        }
        drained.len()
    }

    /// Whether `key` is currently registered
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of registered operations
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
