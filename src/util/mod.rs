// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Small shared helpers.

pub mod fenced;
pub mod rollback;
pub mod slot;
pub mod timeout;

pub use fenced::{FencedBool, FencedU32};
pub use rollback::Rollback;
pub use slot::SharedSlot;
pub use timeout::{Backoff, Timeout};
