// CLASSIFICATION: COMMUNITY
// Filename: mod.rs · HAL facade v0.1
// Date Modified: 2026-10-18
// Author: Lukas Bower
//
// ─────────────────────────────────────────────────────────────
// PMU runtime · Hardware‑Abstraction Layer (facade)
//
// The runtime never touches hardware directly. Everything it
// needs from the chip and the host OS comes through the traits
// below:
//
//   • `RegisterIo`         – 32-bit register read/write
//   • `FirmwareSource`     – named firmware blob request/release
//   • `DeviceTableParser`  – hardware device table walker
//   • `Platform`           – silicon/emulation and shutdown state
//   • `FalconHal`          – PMU microcontroller primitives
//
// `hal::sim` implements all of them in-process so the runtime
// can be brought up end to end without a GPU.
// ─────────────────────────────────────────────────────────────

use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::error::PmuResult;
use crate::mm::MemRegion;

pub mod sim;

/// Register read/write primitive pair.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// One firmware file handed out by a [`FirmwareSource`].
pub struct FirmwareBlob {
    name: String,
    data: Vec<u8>,
}

impl FirmwareBlob {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for FirmwareBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareBlob")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Firmware request primitive. Every blob returned by `request` must be
/// handed back through `release` exactly once.
pub trait FirmwareSource: Send + Sync {
    fn request(&self, name: &str) -> Option<Arc<FirmwareBlob>>;
    fn release(&self, blob: Arc<FirmwareBlob>);
}

/// Walks the hardware device table. `cursor` is opaque parser state
/// starting at zero; `None` ends the table.
pub trait DeviceTableParser {
    fn parse_next_device(&mut self, cursor: &mut u32) -> Option<Device>;
}

/// Host platform predicates consulted by every blocking wait.
pub trait Platform: Send + Sync {
    /// False on emulation/FPGA where waits must not time out.
    fn is_silicon(&self) -> bool;
    /// False once the GPU is shutting down.
    fn can_busy(&self) -> bool;
}

/// PMU falcon primitives. Command queues are addressed by their physical
/// index; the message queue has its own head/tail pair.
pub trait FalconHal: Send + Sync {
    fn reset(&self) -> PmuResult<()>;
    fn dmem_size(&self) -> u32;

    fn copy_to_dmem(&self, dst: u32, data: &[u8]) -> PmuResult<()>;
    fn copy_from_dmem(&self, src: u32, buf: &mut [u8]) -> PmuResult<()>;
    fn copy_to_emem(&self, dst: u32, data: &[u8]) -> PmuResult<()>;
    fn copy_from_emem(&self, src: u32, buf: &mut [u8]) -> PmuResult<()>;
    fn copy_to_imem(&self, dst: u32, data: &[u8]) -> PmuResult<()>;

    fn queue_head(&self, index: u32) -> u32;
    fn set_queue_head(&self, index: u32, head: u32);
    fn queue_tail(&self, index: u32) -> u32;
    fn set_queue_tail(&self, index: u32, tail: u32);
    fn msgq_head(&self) -> u32;
    fn set_msgq_head(&self, head: u32);
    fn msgq_tail(&self) -> u32;
    fn set_msgq_tail(&self, tail: u32);

    fn is_interrupted(&self) -> bool;
    fn clear_interrupts(&self);
    fn enable_irq(&self, enable: bool);
    fn clear_halt_intr_status(&self) -> PmuResult<()>;
    fn setup_apertures(&self) -> PmuResult<()>;
    /// Points the falcon at the system-memory surface holding FB queues.
    fn bind_super_surface(&self, surface: Option<MemRegion>);

    /// Non-secure start at `boot_vector`.
    fn bootstrap(&self, boot_vector: u32) -> PmuResult<()>;
    /// Low-security start trigger after the secure setup sequence.
    fn start_secure(&self) -> PmuResult<()>;
    /// Hand the PMU to SEC2 for authenticated bootstrap.
    fn bootstrap_via_sec2(&self) -> PmuResult<()>;
}
