// CLASSIFICATION: COMMUNITY
// Filename: device.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Catalog of GPU sub-engines discovered from the hardware device table.
//!
//! Built once at boot and read-only afterwards. Devices of one type keep
//! hardware table order, so the position in a type's list is the instance
//! index.

use std::collections::VecDeque;

use log::{debug, error, info};
use once_cell::sync::OnceCell;

use crate::error::{PmuError, PmuResult};
use crate::hal::DeviceTableParser;

pub const DEVTYPE_GRAPHICS: u32 = 0;
pub const DEVTYPE_COPY0: u32 = 1;
pub const DEVTYPE_COPY1: u32 = 2;
pub const DEVTYPE_COPY2: u32 = 3;
pub const DEVTYPE_IOCTRL: u32 = 18;
pub const DEVTYPE_LCE: u32 = 19;
/// One past the largest device type id.
pub const MAX_DEVTYPE: u32 = 24;

/// One hardware engine. Immutable once parsed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Device {
    pub dev_type: u32,
    pub inst_id: u32,
    pub engine_id: u32,
    pub runlist_id: u32,
    pub intr_id: u32,
    pub reset_id: u32,
    pub pri_base: u32,
    pub fault_id: u32,
}

impl Device {
    #[must_use]
    pub fn is_copy_engine(&self) -> bool {
        matches!(
            self.dev_type,
            DEVTYPE_COPY0 | DEVTYPE_COPY1 | DEVTYPE_COPY2 | DEVTYPE_LCE
        )
    }

    #[must_use]
    pub fn is_graphics_engine(&self) -> bool {
        self.dev_type == DEVTYPE_GRAPHICS
    }
}

#[must_use]
pub fn type_name(dev_type: u32) -> &'static str {
    match dev_type {
        DEVTYPE_GRAPHICS => "GRAPHICS",
        DEVTYPE_COPY0 => "COPY0",
        DEVTYPE_COPY1 => "COPY1",
        DEVTYPE_COPY2 => "COPY2",
        DEVTYPE_IOCTRL => "IOCTRL",
        DEVTYPE_LCE => "LCE",
        _ => "UNKNOWN",
    }
}

/// Per-type ordered device lists plus per-type counters.
#[derive(Debug)]
pub struct DeviceList {
    lists: Vec<VecDeque<Device>>,
    counts: Vec<u32>,
}

impl DeviceList {
    /// Drain `parser` until it reports the end of the table.
    pub fn build(parser: &mut dyn DeviceTableParser) -> PmuResult<Self> {
        let slots = MAX_DEVTYPE as usize;
        let mut lists = Vec::new();
        lists.try_reserve_exact(slots).map_err(|_| {
            error!("failed to allocate device table");
            PmuError::OutOfMemory
        })?;
        lists.resize_with(slots, VecDeque::new);
        let mut counts = vec![0u32; slots];

        let mut cursor = 0u32;
        while let Some(dev) = parser.parse_next_device(&mut cursor) {
            if dev.dev_type >= MAX_DEVTYPE {
                error!("device table entry with bad type {}", dev.dev_type);
                return Err(PmuError::InvalidArgument("device type out of range"));
            }
            debug!(
                "device {} inst {} engine {} runlist {} pri_base {:#x}",
                type_name(dev.dev_type),
                dev.inst_id,
                dev.engine_id,
                dev.runlist_id,
                dev.pri_base
            );
            let t = dev.dev_type as usize;
            lists[t].push_back(dev);
            counts[t] += 1;
        }
        Ok(Self { lists, counts })
    }

    /// `instance_id`-th device of `dev_type` in table order.
    pub fn get(&self, dev_type: u32, instance_id: u32) -> PmuResult<&Device> {
        if dev_type >= MAX_DEVTYPE {
            return Err(PmuError::InvalidArgument("device type out of range"));
        }
        self.lists[dev_type as usize]
            .iter()
            .nth(instance_id as usize)
            .ok_or_else(|| {
                PmuError::NotFound(format!("{} instance {instance_id}", type_name(dev_type)))
            })
    }

    #[must_use]
    pub fn count(&self, dev_type: u32) -> u32 {
        if dev_type >= MAX_DEVTYPE {
            return 0;
        }
        self.counts[dev_type as usize]
    }

    /// Every device of `dev_type`, in instance order.
    pub fn iter_type(&self, dev_type: u32) -> impl Iterator<Item = &Device> {
        self.lists
            .get(dev_type as usize)
            .into_iter()
            .flat_map(|l| l.iter())
    }

    fn cleanup(&mut self) {
        for l in &mut self.lists {
            l.clear();
        }
        self.counts.iter_mut().for_each(|c| *c = 0);
    }
}

/// Owner of the device table. `init` is idempotent.
#[derive(Debug, Default)]
pub struct Devices {
    table: OnceCell<DeviceList>,
}

impl Devices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self, parser: &mut dyn DeviceTableParser) -> PmuResult<()> {
        self.table.get_or_try_init(|| {
            let list = DeviceList::build(parser)?;
            let total: u32 = list.counts.iter().sum();
            info!("device table initialised, {total} devices");
            Ok::<_, PmuError>(list)
        })?;
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.table.get().is_some()
    }

    pub fn list(&self) -> PmuResult<&DeviceList> {
        self.table.get().ok_or(PmuError::NotReady)
    }

    pub fn get(&self, dev_type: u32, instance_id: u32) -> PmuResult<&Device> {
        self.list()?.get(dev_type, instance_id)
    }

    #[must_use]
    pub fn count(&self, dev_type: u32) -> u32 {
        self.table.get().map_or(0, |l| l.count(dev_type))
    }

    /// Free every device and drop the table.
    pub fn cleanup(&mut self) {
        if let Some(mut list) = self.table.take() {
            list.cleanup();
        }
    }
}
