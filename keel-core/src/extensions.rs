//! Application state shared with every request.
//!
//! Values are keyed by type and registered once on the `Deployment`.
//! Handlers receive them through a `State<T>` parameter, resolved by the
//! context tier without copying the value.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

/// Type-keyed, read-only after deployment.
#[derive(Clone, Default)]
pub struct Extensions {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a typed value, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|arc| arc.downcast_ref::<T>())
    }

    pub fn get_arc<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|arc| arc.clone().downcast::<T>().ok())
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Handle to a value registered in [`Extensions`].
pub struct State<T>(pub Arc<T>);

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        State(self.0.clone())
    }
}

impl<T> Deref for State<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pool {
        size: usize,
    }

    #[test]
    fn test_insert_and_get() {
        let mut ext = Extensions::new();
        ext.insert(Pool { size: 4 });
        ext.insert(7u32);
        assert_eq!(ext.get::<Pool>(), Some(&Pool { size: 4 }));
        assert_eq!(ext.get::<u32>(), Some(&7));
        assert!(ext.get::<String>().is_none());
        assert_eq!(ext.len(), 2);
    }

    #[test]
    fn test_state_derefs_to_shared_value() {
        let mut ext = Extensions::new();
        ext.insert(Pool { size: 2 });
        let state = State(ext.get_arc::<Pool>().unwrap());
        let again = state.clone();
        assert_eq!(again.size, 2);
        assert!(Arc::ptr_eq(&state.0, &again.0));
    }
}
