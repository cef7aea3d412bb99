// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! GPU memory regions and the allocators carved out of them.

pub mod lockless;
pub mod mem;

pub use lockless::{AllocatorStats, LocklessAllocator};
pub use mem::MemRegion;
