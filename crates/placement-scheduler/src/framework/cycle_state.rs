//! Per-cycle scratch space shared by the plugins of one scheduling cycle.

use crate::error::{Result, SchedulerError};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Values stored in a [`CycleState`].
///
/// Entries are immutable once written; a plugin that needs to change one
/// clones it and writes the new value back.
pub trait StateData: Any + Send + Sync + fmt::Debug {
    /// Convert into `Any` for downcasting.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync + fmt::Debug> StateData for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Key-value store for one scheduling cycle.
#[derive(Default)]
pub struct CycleState {
    storage: RwLock<HashMap<String, Arc<dyn StateData>>>,
}

impl fmt::Debug for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = self.storage.read();
        let mut keys: Vec<&String> = storage.keys().collect();
        keys.sort();
        f.debug_struct("CycleState").field("keys", &keys).finish()
    }
}

impl Clone for CycleState {
    fn clone(&self) -> Self {
        Self {
            storage: RwLock::new(self.storage.read().clone()),
        }
    }
}

impl CycleState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::StateNotFound`] if the key is missing or
    /// holds another type.
    pub fn read<T: StateData>(&self, key: &str) -> Result<Arc<T>> {
        let entry = self
            .storage
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SchedulerError::StateNotFound(key.to_string()))?;
        entry
            .into_any()
            .downcast::<T>()
            .map_err(|_| SchedulerError::StateNotFound(key.to_string()))
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn write<T: StateData>(&self, key: &str, value: T) {
        self.storage.write().insert(key.to_string(), Arc::new(value));
    }

    /// Remove `key`.
    pub fn delete(&self, key: &str) {
        self.storage.write().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter(u32);

    #[test]
    fn read_write_and_type_mismatch() {
        let state = CycleState::new();
        state.write("count", Counter(1));
        assert_eq!(*state.read::<Counter>("count").unwrap(), Counter(1));
        assert!(matches!(
            state.read::<String>("count"),
            Err(SchedulerError::StateNotFound(_))
        ));
        state.delete("count");
        assert!(state.read::<Counter>("count").is_err());
    }

    #[test]
    fn clone_branches_independently() {
        let state = CycleState::new();
        state.write("count", Counter(1));
        let branch = state.clone();
        branch.write("count", Counter(2));
        assert_eq!(state.read::<Counter>("count").unwrap().0, 1);
        assert_eq!(branch.read::<Counter>("count").unwrap().0, 2);
    }
}
