use std::collections::HashMap;
use std::fmt;

use crate::error::{DispatchError, Result};

/// Opaque handle of a registered model. Handles start at 1 and are never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub fn id(self) -> u64 {
        self.0
    }

    fn raw(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Interprets a host integer as a handle. Non-positive or oversized
    /// values can never name a live entry.
    pub fn from_raw(raw: i64) -> Result<Self> {
        u64::try_from(raw)
            .ok()
            .filter(|&id| id > 0)
            .map(Self)
            .ok_or(DispatchError::UnknownHandle(raw))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owns every live model instance.
#[derive(Debug)]
pub struct Registry<M> {
    instances: HashMap<Handle, M>,
    last_id: u64,
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Registry<M> {
    pub fn new() -> Self {
        Self {
            instances: HashMap::new(),
            last_id: 0,
        }
    }

    /// Stores `instance` under a fresh handle.
    pub fn create(&mut self, instance: M) -> Handle {
        self.last_id += 1;
        let handle = Handle(self.last_id);
        self.instances.insert(handle, instance);
        handle
    }

    pub fn resolve(&self, handle: Handle) -> Result<&M> {
        self.instances
            .get(&handle)
            .ok_or(DispatchError::UnknownHandle(handle.raw()))
    }

    pub fn resolve_mut(&mut self, handle: Handle) -> Result<&mut M> {
        self.instances
            .get_mut(&handle)
            .ok_or(DispatchError::UnknownHandle(handle.raw()))
    }

    /// Swaps in a new instance for an existing handle.
    pub fn replace(&mut self, handle: Handle, instance: M) -> Result<()> {
        *self.resolve_mut(handle)? = instance;
        Ok(())
    }

    pub fn destroy(&mut self, handle: Handle) -> Result<M> {
        self.instances
            .remove(&handle)
            .ok_or(DispatchError::UnknownHandle(handle.raw()))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.instances.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_increase_and_are_not_reused() {
        let mut reg = Registry::new();
        let a = reg.create("a");
        let b = reg.create("b");
        assert_eq!(a.id(), 1);
        assert!(b > a);

        reg.destroy(b).unwrap();
        let c = reg.create("c");
        assert!(c > b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_destroyed_handle_is_unknown() {
        let mut reg = Registry::new();
        let h = reg.create(1);
        assert_eq!(reg.destroy(h).unwrap(), 1);
        assert!(matches!(reg.resolve(h), Err(DispatchError::UnknownHandle(1))));
        assert!(matches!(reg.destroy(h), Err(DispatchError::UnknownHandle(1))));
        assert!(reg.replace(h, 2).is_err());
        assert!(!reg.contains(h));
    }

    #[test]
    fn test_handle_from_raw() {
        assert_eq!(Handle::from_raw(3).unwrap().id(), 3);
        assert!(Handle::from_raw(0).is_err());
        assert!(Handle::from_raw(-4).is_err());
    }
}
