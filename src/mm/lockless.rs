// CLASSIFICATION: COMMUNITY
// Filename: lockless.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Fixed block size allocator over a pre-registered address range.
//!
//! Free blocks form an intrusive singly linked list stored as indices in
//! `next`, with `-1` terminating the list. `alloc` pops the head and `free`
//! pushes onto it, both with a compare-and-swap on `head` and no locks.
//!
//! The head word carries a generation tag in its upper half. Every
//! successful swap bumps the tag, so a pop that raced with a pop/push pair
//! of the same index fails its swap instead of installing a stale `next`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use log::{debug, error, warn};

use crate::error::{PmuError, PmuResult};

const LIST_END: i32 = -1;

#[inline]
fn pack(tag: u32, idx: i32) -> u64 {
    (u64::from(tag) << 32) | u64::from(idx as u32)
}

#[inline]
fn unpack(word: u64) -> (u32, i32) {
    ((word >> 32) as u32, word as u32 as i32)
}

/// Lock-free pool of `length / block_size` equally sized blocks.
pub struct LocklessAllocator {
    name: String,
    base: u64,
    length: u64,
    blk_size: u64,
    nr_nodes: i32,
    flags: u64,
    next: Box<[AtomicI32]>,
    head: AtomicU64,
    nr_allocs: AtomicI32,
    inited: AtomicBool,
}

/// Snapshot of a pool, printed by `pmuctl alloc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorStats {
    pub name: String,
    pub base: u64,
    pub length: u64,
    pub block_size: u64,
    pub nodes: u32,
    pub allocated: u32,
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lockless allocator params:")?;
        writeln!(f, "  name       = {}", self.name)?;
        writeln!(f, "  start      = {:#x}", self.base)?;
        writeln!(f, "  end        = {:#x}", self.base + self.length)?;
        writeln!(f, "  block size = {:#x}", self.block_size)?;
        writeln!(f, "  nodes      = {}", self.nodes)?;
        write!(f, "  allocated  = {}", self.allocated)
    }
}

impl LocklessAllocator {
    /// Build the pool and chain node `i` to `i + 1`.
    ///
    /// Fails with `InvalidArgument` for a zero block size, a zero base, a
    /// range smaller than one block, a range ending past `u64::MAX`, or more
    /// nodes than an `i32` index can address. The next-array reservation failing maps to `OutOfMemory`.
    pub fn init(
        name: &str,
        base: u64,
        length: u64,
        blk_size: u64,
        flags: u64,
    ) -> PmuResult<Self> {
        if blk_size == 0 {
            return Err(PmuError::InvalidArgument("block size is zero"));
        }
        if base == 0 {
            return Err(PmuError::InvalidArgument("base address is zero"));
        }
        let count = length / blk_size;
        if count == 0 {
            return Err(PmuError::InvalidArgument("range holds no blocks"));
        }
        if count > i32::MAX as u64 {
            return Err(PmuError::InvalidArgument("too many blocks for an i32 index"));
        }
        if base.checked_add(count * blk_size).is_none() {
            error!("{name}: range {base:#x}+{:#x} wraps the address space", count * blk_size);
            return Err(PmuError::InvalidArgument("range wraps the address space"));
        }
        let nr_nodes = count as i32;

        let mut next = Vec::new();
        next.try_reserve_exact(count as usize).map_err(|_| {
            error!("{name}: cannot allocate free list of {count} nodes");
            PmuError::OutOfMemory
        })?;
        for i in 0..nr_nodes - 1 {
            next.push(AtomicI32::new(i + 1));
        }
        next.push(AtomicI32::new(LIST_END));

        let pool = Self {
            name: name.to_string(),
            base,
            length: count * blk_size,
            blk_size,
            nr_nodes,
            flags,
            next: next.into_boxed_slice(),
            head: AtomicU64::new(pack(0, 0)),
            nr_allocs: AtomicI32::new(0),
            inited: AtomicBool::new(false),
        };
        pool.inited.store(true, Ordering::Release);

        debug!(
            "{name}: lockless allocator base={base:#x} length={:#x} blk_size={blk_size:#x} nodes={nr_nodes}",
            pool.length
        );
        Ok(pool)
    }

    /// Pop a block. Returns `0` when `len` is not the block size or the pool
    /// is exhausted.
    pub fn alloc(&self, len: u64) -> u64 {
        if len != self.blk_size || !self.inited() {
            return 0;
        }
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (tag, head) = unpack(cur);
            if head < 0 {
                return 0;
            }
            let new_head = self.next[head as usize].load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                cur,
                pack(tag.wrapping_add(1), new_head),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.nr_allocs.fetch_add(1, Ordering::Relaxed);
                    let addr = self.base + head as u64 * self.blk_size;
                    log::trace!("{}: alloc node {head} addr {addr:#x}", self.name);
                    return addr;
                }
                Err(seen) => cur = seen,
            }
        }
    }

    /// Push a block back. Addresses outside the pool or off a block boundary
    /// are logged and ignored.
    pub fn free(&self, addr: u64) {
        if addr < self.base || addr >= self.end() || (addr - self.base) % self.blk_size != 0 {
            warn!("{}: free of foreign address {addr:#x}", self.name);
            return;
        }
        let idx = ((addr - self.base) / self.blk_size) as i32;
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (tag, head) = unpack(cur);
            // The caller owns node `idx` until the swap below publishes it.
            self.next[idx as usize].store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                cur,
                pack(tag.wrapping_add(1), idx),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }
        self.nr_allocs.fetch_sub(1, Ordering::Relaxed);
        log::trace!("{}: free node {idx} addr {addr:#x}", self.name);
    }

    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.blk_size
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        self.flags
    }

    #[must_use]
    pub fn inited(&self) -> bool {
        self.inited.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn node_count(&self) -> u32 {
        self.nr_nodes as u32
    }

    /// Blocks currently handed out.
    #[must_use]
    pub fn alloc_count(&self) -> i32 {
        self.nr_allocs.load(Ordering::Relaxed)
    }

    /// Current free-list head, `-1` when every block is allocated.
    #[must_use]
    pub fn head(&self) -> i32 {
        unpack(self.head.load(Ordering::Acquire)).1
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            name: self.name.clone(),
            base: self.base,
            length: self.length,
            block_size: self.blk_size,
            nodes: self.node_count(),
            allocated: self.alloc_count().max(0) as u32,
        }
    }

    /// Tear the pool down. Callers must have quiesced every user first.
    pub fn destroy(self) {
        let outstanding = self.alloc_count();
        if outstanding != 0 {
            warn!("{}: destroyed with {outstanding} blocks outstanding", self.name);
        }
        self.inited.store(false, Ordering::Release);
    }
}

impl fmt::Debug for LocklessAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocklessAllocator")
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base))
            .field("length", &self.length)
            .field("blk_size", &self.blk_size)
            .field("nr_allocs", &self.alloc_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_survives_pack_roundtrip_for_list_end() {
        let (tag, idx) = unpack(pack(7, LIST_END));
        assert_eq!(tag, 7);
        assert_eq!(idx, -1);
    }

    #[test]
    fn truncates_length_to_whole_blocks() {
        let a = LocklessAllocator::init("t", 0x1000, 1000, 256, 0).unwrap();
        assert_eq!(a.node_count(), 3);
        assert_eq!(a.length(), 768);
        assert_eq!(a.end(), 0x1000 + 768);
    }

    #[test]
    fn foreign_free_is_ignored() {
        let a = LocklessAllocator::init("t", 0x1000, 512, 256, 0).unwrap();
        let x = a.alloc(256);
        a.free(0x1001);
        a.free(0x9000);
        assert_eq!(a.alloc_count(), 1);
        a.free(x);
        assert_eq!(a.alloc_count(), 0);
    }
}
