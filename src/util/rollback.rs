// CLASSIFICATION: COMMUNITY
// Filename: rollback.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Ordered undo list for multi-step initialisation.

use log::debug;

/// Undo steps registered as each resource comes up. Dropping an armed list
/// runs them newest first; `commit` disarms it once every step succeeded.
pub struct Rollback<'a> {
    steps: Vec<(&'static str, Box<dyn FnOnce() + 'a>)>,
}

impl<'a> Default for Rollback<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Rollback<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, name: &'static str, undo: impl FnOnce() + 'a) {
        self.steps.push((name, Box::new(undo)));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn commit(mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        while let Some((name, undo)) = self.steps.pop() {
            debug!("rollback: {name}");
            undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn unwinds_in_reverse_unless_committed() {
        let order = RefCell::new(Vec::new());
        {
            let mut rb = Rollback::new();
            rb.push("a", || order.borrow_mut().push("a"));
            rb.push("b", || order.borrow_mut().push("b"));
            rb.push("c", || order.borrow_mut().push("c"));
        }
        assert_eq!(*order.borrow(), vec!["c", "b", "a"]);

        order.borrow_mut().clear();
        let mut rb = Rollback::new();
        rb.push("a", || order.borrow_mut().push("a"));
        rb.commit();
        assert!(order.borrow().is_empty());
    }
}
