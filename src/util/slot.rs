// CLASSIFICATION: COMMUNITY
// Filename: slot.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Late-initialised shared component.

use std::sync::{Arc, RwLock};

use crate::error::{PmuError, PmuResult};

/// A component that appears during bring-up and goes away on teardown.
/// Readers clone the `Arc` out and drop the lock straight away.
pub struct SharedSlot<T: ?Sized> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> Default for SharedSlot<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }
}

impl<T: ?Sized> SharedSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, `NotReady` when the slot is empty.
    pub fn get(&self) -> PmuResult<Arc<T>> {
        self.try_get().ok_or(PmuError::NotReady)
    }

    #[must_use]
    pub fn try_get(&self) -> Option<Arc<T>> {
        self.inner.read().ok().and_then(|g| g.clone())
    }

    pub fn set(&self, value: Arc<T>) -> Option<Arc<T>> {
        match self.inner.write() {
            Ok(mut g) => g.replace(value),
            Err(p) => p.into_inner().replace(value),
        }
    }

    pub fn take(&self) -> Option<Arc<T>> {
        match self.inner.write() {
            Ok(mut g) => g.take(),
            Err(p) => p.into_inner().take(),
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.try_get().is_some()
    }
}
