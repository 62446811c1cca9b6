use std::sync::Arc;

use tracing::{debug, warn};

/// A strategy that can be looked up by its string id
pub trait Named {
    fn id(&self) -> &str;
}

/// Id-keyed table of strategies, filled at startup and read at negotiation
/// time. Ids compare without regard to ASCII case.
pub struct Registry<T: ?Sized> {
    entries: Vec<Arc<T>>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T: ?Sized + Named> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id().eq_ignore_ascii_case(id))
    }

    /// Add a strategy, replacing any previous one with the same id
    pub fn register(&mut self, strategy: Arc<T>) {
        if let Some(pos) = self.position(strategy.id()) {
            warn!("replacing registered strategy '{}'", strategy.id());
            self.entries[pos] = strategy;
        } else {
            debug!("registered strategy '{}'", strategy.id());
            self.entries.push(strategy);
        }
    }

    pub fn unregister(&mut self, id: &str) -> Option<Arc<T>> {
        let pos = self.position(id)?;
        Some(self.entries.remove(pos))
    }

    pub fn find(&self, id: &str) -> Option<Arc<T>> {
        self.position(id).map(|pos| self.entries[pos].clone())
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
