// CLASSIFICATION: COMMUNITY
// Filename: fenced.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Flags shared with interrupt context.
//!
//! Writers publish with release ordering, readers observe with acquire
//! ordering. No other access is exposed, so a call site cannot pick a
//! weaker ordering by accident.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct FencedU32(AtomicU32);

impl FencedU32 {
    pub const fn new(v: u32) -> Self {
        Self(AtomicU32::new(v))
    }

    pub fn publish(&self, v: u32) {
        self.0.store(v, Ordering::Release);
    }

    #[must_use]
    pub fn observe(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct FencedBool(AtomicBool);

impl FencedBool {
    pub const fn new(v: bool) -> Self {
        Self(AtomicBool::new(v))
    }

    pub fn publish(&self, v: bool) {
        self.0.store(v, Ordering::Release);
    }

    #[must_use]
    pub fn observe(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
