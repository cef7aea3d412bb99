// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Reference-counted GPU completion tokens.
//!
//! A fence is built over exactly one backing primitive, a GPU semaphore or a
//! host1x syncpoint, and never changes kind. `get` takes a reference, `put`
//! drops one, and the last `put` tears the backing down together with the
//! optional OS fence handed to user space.

use std::fmt;
use std::sync::Arc;

use log::{debug, trace};

use crate::error::PmuResult;
use crate::hal::Platform;
use crate::util::Timeout;

pub mod pool;
pub mod sema;
pub mod syncpt;

pub use pool::{FencePool, FenceSlot};
pub use sema::{Semaphore, SemaphoreFence, WaitQueue};
pub use syncpt::{SyncpointDevice, SyncpointFence, SYNCPT_INVALID};

/// Backing kind of a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceKind {
    Semaphore,
    Syncpoint,
}

/// Per-kind behaviour dispatched by [`Fence`].
pub trait FenceOps: Send + Sync {
    fn kind(&self) -> FenceKind;
    fn wait(&self, timeout: Timeout) -> PmuResult<()>;
    fn is_expired(&self) -> bool;
    /// Syncpoint id and threshold, if this kind has them.
    fn syncpt(&self) -> Option<(u32, u32)> {
        None
    }
}

/// OS-level fence object exported to user space.
pub trait OsFenceOps: Send + Sync {
    fn dup(&self);
    fn drop_ref(&self);
}

/// One counted reference to an OS fence. Dropping the handle drops the
/// reference; `dup` takes another.
#[derive(Default)]
pub struct OsFence {
    ops: Option<Arc<dyn OsFenceOps>>,
}

impl OsFence {
    /// Adopt an existing reference.
    pub fn new(ops: Arc<dyn OsFenceOps>) -> Self {
        Self { ops: Some(ops) }
    }

    /// No OS fence attached.
    pub fn none() -> Self {
        Self { ops: None }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.ops.is_some()
    }

    #[must_use]
    pub fn dup(&self) -> OsFence {
        match &self.ops {
            Some(ops) => {
                ops.dup();
                OsFence {
                    ops: Some(Arc::clone(ops)),
                }
            }
            None => OsFence::none(),
        }
    }
}

impl Drop for OsFence {
    fn drop(&mut self) {
        if let Some(ops) = self.ops.take() {
            ops.drop_ref();
        }
    }
}

impl fmt::Debug for OsFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsFence").field("valid", &self.is_valid()).finish()
    }
}

/// Plain-data copy of a fence for a caller outside the submission path.
#[derive(Debug)]
pub struct UserFence {
    pub syncpt_id: u32,
    pub syncpt_value: u32,
    pub os_fence: OsFence,
}

struct FenceInner {
    ops: Box<dyn FenceOps>,
    os_fence: OsFence,
    slot: Option<FenceSlot>,
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        debug!("fence teardown ({:?})", self.ops.kind());
    }
}

/// Handle to a shared fence. Not `Clone`: references are taken with `get`
/// and dropped with `put` (or by dropping the handle).
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Refcount 1, dispatching to `ops`.
    pub fn init(ops: impl FenceOps + 'static, os_fence: OsFence) -> Self {
        Self::build(Box::new(ops), os_fence, None)
    }

    pub(crate) fn build(ops: Box<dyn FenceOps>, os_fence: OsFence, slot: Option<FenceSlot>) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                ops,
                os_fence,
                slot,
            }),
        }
    }

    /// Semaphore fence owning both the semaphore and the OS fence reference.
    pub fn from_semaphore(sema: Arc<Semaphore>, wq: Arc<WaitQueue>, os_fence: OsFence) -> Self {
        Self::init(SemaphoreFence::new(sema, wq), os_fence)
    }

    pub fn from_syncpoint(
        dev: Arc<dyn SyncpointDevice>,
        id: u32,
        value: u32,
        os_fence: OsFence,
    ) -> Self {
        Self::init(SyncpointFence::new(dev, id, value), os_fence)
    }

    #[must_use]
    pub fn get(&self) -> Fence {
        trace!("fence get, refs {}", self.refcount() + 1);
        Fence {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Drop this reference; the last one tears the fence down.
    pub fn put(self) {
        trace!("fence put, refs {}", self.refcount() - 1);
        drop(self);
    }

    #[must_use]
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    #[must_use]
    pub fn kind(&self) -> FenceKind {
        self.inner.ops.kind()
    }

    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.inner.slot.is_some()
    }

    /// Wait for completion. Emulation platforms wait without a deadline.
    pub fn wait(&self, platform: &dyn Platform, timeout_ms: u64) -> PmuResult<()> {
        let timeout = if platform.is_silicon() {
            Timeout::from_ms(timeout_ms)
        } else {
            Timeout::infinite()
        };
        self.inner.ops.wait(timeout)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.inner.ops.is_expired()
    }

    /// Copy for user space. The OS fence reference is duplicated, not moved.
    #[must_use]
    pub fn extract_user(&self) -> UserFence {
        let (syncpt_id, syncpt_value) = self.inner.ops.syncpt().unwrap_or((SYNCPT_INVALID, 0));
        UserFence {
            syncpt_id,
            syncpt_value,
            os_fence: self.inner.os_fence.dup(),
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("kind", &self.kind())
            .field("refcount", &self.refcount())
            .field("os_fence", &self.inner.os_fence)
            .finish()
    }
}
