// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! PMU RTOS runtime.
//!
//! [`Pmu`] owns every piece of host-side state the RTOS protocol needs.
//! Components come up in two phases: `rtos_early_init` allocates what does
//! not depend on the firmware running, `rtos_init` loads and starts the
//! firmware. The queues and the DMEM payload allocator only exist after the
//! RTOS INIT message has been processed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, TryLockError};

use log::{debug, warn};

use crate::config::PmuConfig;
use crate::error::{PmuError, PmuResult};
use crate::hal::{FalconHal, FirmwareSource, Platform, RegisterIo};
use crate::mm::LocklessAllocator;
use crate::util::{FencedBool, FencedU32, SharedSlot};

pub mod fw;
pub mod fw_ver;
pub mod ipc;
pub mod lsfm;
pub mod msg;
pub mod mutex;
pub mod pg;
pub mod queue;
pub mod rtos;
pub mod seq;
pub mod super_surface;

pub use fw::{PmuFwState, RtosFw};
pub use ipc::{PayloadIn, PayloadOut, PmuPayload, RpcReply, RpcRequest};
pub use lsfm::LsfManager;
pub use msg::{PmuCmd, PmuMsg};
pub use mutex::{mutex_id, PmuLock, PmuMutexes};
pub use pg::PgState;
pub use queue::{PmuQueues, QueueId};
pub use seq::{PayloadBuffer, PmuCallback, SeqState, SequenceTable};
pub use super_surface::SuperSurface;

/// Hardware and host services the runtime is wired to.
#[derive(Clone)]
pub struct PmuHal {
    pub falcon: Arc<dyn FalconHal>,
    pub regs: Arc<dyn RegisterIo>,
    pub platform: Arc<dyn Platform>,
    pub firmware: Arc<dyn FirmwareSource>,
}

/// Handler for unsolicited RTOS events of one unit.
pub type EventHandler = Arc<dyn Fn(&PmuMsg) + Send + Sync>;

pub struct Pmu {
    cfg: PmuConfig,
    hal: PmuHal,
    fw_state: FencedU32,
    fw_ready: FencedBool,
    pmu_ready: FencedBool,
    sw_ready: FencedBool,
    fw: Mutex<Option<RtosFw>>,
    mutexes: SharedSlot<PmuMutexes>,
    sequences: SharedSlot<SequenceTable>,
    pg: SharedSlot<PgState>,
    lsfm: SharedSlot<LsfManager>,
    super_surface: SharedSlot<SuperSurface>,
    queues: SharedSlot<PmuQueues>,
    dmem: SharedSlot<LocklessAllocator>,
    events: Mutex<HashMap<u8, EventHandler>>,
    msg_lock: Mutex<()>,
}

impl Pmu {
    pub fn new(cfg: PmuConfig, hal: PmuHal) -> PmuResult<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            hal,
            fw_state: FencedU32::new(PmuFwState::Off as u32),
            fw_ready: FencedBool::new(false),
            pmu_ready: FencedBool::new(false),
            sw_ready: FencedBool::new(false),
            fw: Mutex::new(None),
            mutexes: SharedSlot::new(),
            sequences: SharedSlot::new(),
            pg: SharedSlot::new(),
            lsfm: SharedSlot::new(),
            super_surface: SharedSlot::new(),
            queues: SharedSlot::new(),
            dmem: SharedSlot::new(),
            events: Mutex::new(HashMap::new()),
            msg_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PmuConfig {
        &self.cfg
    }

    #[must_use]
    pub fn hal(&self) -> &PmuHal {
        &self.hal
    }

    #[must_use]
    pub fn falcon(&self) -> &Arc<dyn FalconHal> {
        &self.hal.falcon
    }

    /// INIT message processed; queues and DMEM allocator exist.
    #[must_use]
    pub fn is_pmu_ready(&self) -> bool {
        self.pmu_ready.observe()
    }

    #[must_use]
    pub fn is_sw_ready(&self) -> bool {
        self.sw_ready.observe()
    }

    pub fn sequences(&self) -> PmuResult<Arc<SequenceTable>> {
        self.sequences.get()
    }

    pub fn queues(&self) -> PmuResult<Arc<PmuQueues>> {
        self.queues.get()
    }

    pub fn dmem_allocator(&self) -> PmuResult<Arc<LocklessAllocator>> {
        self.dmem.get()
    }

    pub fn lsfm(&self) -> PmuResult<Arc<LsfManager>> {
        self.lsfm.get()
    }

    #[must_use]
    pub fn pg(&self) -> Option<Arc<PgState>> {
        self.pg.try_get()
    }

    #[must_use]
    pub fn super_surface(&self) -> Option<Arc<SuperSurface>> {
        self.super_surface.try_get()
    }

    /// Take PMU hardware mutex `id`.
    ///
    /// Without LS PMU support or ELPG nothing else competes for the
    /// registers and an empty guard is returned. With them, power gating
    /// must have been set up first.
    pub fn lock_acquire(&self, id: u32) -> PmuResult<PmuLock> {
        if !self.cfg.support_ls_pmu || !self.cfg.can_elpg {
            return Ok(PmuLock::unlocked(id));
        }
        match self.pg.try_get() {
            Some(pg) if pg.is_initialized() => {}
            _ => return Err(PmuError::InvalidArgument("power gating not initialised")),
        }
        self.mutexes.get()?.acquire(id)
    }

    pub fn register_event_handler(&self, unit_id: u8, handler: EventHandler) -> PmuResult<()> {
        if !msg::unit_id_is_valid(unit_id) {
            return Err(PmuError::InvalidArgument("event unit id"));
        }
        let mut events = self.events.lock().map_err(|_| PmuError::LockPoisoned)?;
        if events.insert(unit_id, handler).is_some() {
            debug!("replaced event handler for unit {unit_id:#x}");
        }
        Ok(())
    }

    fn event_handler(&self, unit_id: u8) -> Option<EventHandler> {
        self.events.lock().ok()?.get(&unit_id).cloned()
    }

    /// Interrupt service: acknowledge and drain the message queue.
    ///
    /// Only one thread drains at a time; a second caller returns straight
    /// away and the pending interrupt stays latched for the next pass.
    pub fn isr(&self) -> PmuResult<()> {
        let _guard = match self.msg_lock.try_lock() {
            Ok(g) => g,
            Err(TryLockError::WouldBlock) => return Ok(()),
            Err(TryLockError::Poisoned(_)) => {
                warn!("PMU message lock poisoned");
                return Err(PmuError::LockPoisoned);
            }
        };
        if !self.hal.falcon.is_interrupted() {
            return Ok(());
        }
        self.hal.falcon.clear_interrupts();
        self.drain_messages()
    }
}

impl fmt::Debug for Pmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmu")
            .field("fw_state", &PmuFwState::from_u32(self.fw_state.observe()))
            .field("fw_ready", &self.fw_ready.observe())
            .field("pmu_ready", &self.pmu_ready.observe())
            .field("sw_ready", &self.sw_ready.observe())
            .finish_non_exhaustive()
    }
}
