// CLASSIFICATION: COMMUNITY
// Filename: fw_ver.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

//! Firmware-version dependent layouts.
//!
//! The PMU ucode descriptor names the firmware build through `app_version`.
//! Layouts of DMEM allocation records and boot command-line arguments differ
//! between firmware families, so the loader resolves one [`FwVersionOps`]
//! implementation at load time and every later encode goes through it.

use std::fmt;

use log::{error, info};

use crate::error::{PmuError, PmuResult};

pub const APP_VERSION_GM20B: u32 = 20490253;
pub const APP_VERSION_GP10B: u32 = 23782727;
pub const APP_VERSION_GP10X: u32 = 24076634;
pub const APP_VERSION_GV11B: u32 = 25005711;
pub const APP_VERSION_GV10X: u32 = 25633490;
pub const APP_VERSION_TU10X: u32 = 28084434;

pub const PMU_UCODE_NB_MAX_DATE_LENGTH: usize = 32;
/// Bytes of the descriptor prefix the loader parses.
pub const PMU_UCODE_DESC_SIZE: usize = 4 * 4 + PMU_UCODE_NB_MAX_DATE_LENGTH + 15 * 4;

/// DMEM (or FB queue heap) block holding one command payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmuAllocation {
    pub dmem_offset: u32,
    pub dmem_size: u16,
    /// System memory address of the payload, FB queue capable firmware only.
    pub fb_addr: u64,
    pub fb_size: u32,
}

/// Boot arguments copied to the top of DMEM before the RTOS starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CmdLineArgs {
    pub cpu_freq_hz: u32,
    pub falc_trace_size: u32,
    pub falc_trace_dma_base: u32,
    pub falc_trace_dma_idx: u32,
    pub secure_mode: bool,
    pub raise_priv_sec: bool,
    pub super_surface_base: u64,
    pub super_surface_size: u32,
}

/// Per-version layout operations.
pub trait FwVersionOps: Send + Sync + fmt::Debug {
    fn app_version(&self) -> u32;
    fn allocation_struct_size(&self) -> u32;
    fn encode_allocation(&self, alloc: &PmuAllocation) -> Vec<u8>;
    fn decode_allocation(&self, bytes: &[u8]) -> PmuResult<PmuAllocation>;
    fn cmd_line_args_size(&self) -> u32;
    fn encode_cmd_line_args(&self, args: &CmdLineArgs) -> Vec<u8>;
    fn supports_super_surface(&self) -> bool;
}

/// Firmware families with distinct layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FwVersion {
    /// Maxwell/Pascal integrated firmware.
    V1,
    /// Volta and later, with FB queue support.
    V3,
}

impl FwVersion {
    pub fn from_app_version(app_version: u32) -> PmuResult<Self> {
        match app_version {
            APP_VERSION_GM20B | APP_VERSION_GP10B => Ok(FwVersion::V1),
            APP_VERSION_GP10X | APP_VERSION_GV11B | APP_VERSION_GV10X | APP_VERSION_TU10X => {
                Ok(FwVersion::V3)
            }
            other => {
                error!("PMU firmware app_version {other} is not supported");
                Err(PmuError::InvalidArgument("unsupported PMU firmware version"))
            }
        }
    }
}

/// Resolve the ops table for `app_version`.
pub fn init_fw_ver_ops(app_version: u32) -> PmuResult<Box<dyn FwVersionOps>> {
    let ver = FwVersion::from_app_version(app_version)?;
    info!("PMU firmware app_version {app_version} uses {ver:?} layouts");
    Ok(match ver {
        FwVersion::V1 => Box::new(FwOpsV1 { app_version }),
        FwVersion::V3 => Box::new(FwOpsV3 { app_version }),
    })
}

fn le32(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]])
}

#[derive(Debug)]
struct FwOpsV1 {
    app_version: u32,
}

impl FwVersionOps for FwOpsV1 {
    fn app_version(&self) -> u32 {
        self.app_version
    }

    fn allocation_struct_size(&self) -> u32 {
        8
    }

    fn encode_allocation(&self, alloc: &PmuAllocation) -> Vec<u8> {
        let mut b = Vec::with_capacity(8);
        b.extend_from_slice(&alloc.dmem_size.to_le_bytes());
        b.extend_from_slice(&[0, 0]);
        b.extend_from_slice(&alloc.dmem_offset.to_le_bytes());
        b
    }

    fn decode_allocation(&self, b: &[u8]) -> PmuResult<PmuAllocation> {
        if b.len() < 8 {
            return Err(PmuError::InvalidArgument("short allocation record"));
        }
        Ok(PmuAllocation {
            dmem_size: u16::from_le_bytes([b[0], b[1]]),
            dmem_offset: le32(b, 4),
            ..PmuAllocation::default()
        })
    }

    fn cmd_line_args_size(&self) -> u32 {
        24
    }

    fn encode_cmd_line_args(&self, a: &CmdLineArgs) -> Vec<u8> {
        let mut b = Vec::with_capacity(24);
        b.extend_from_slice(&a.cpu_freq_hz.to_le_bytes());
        b.extend_from_slice(&a.falc_trace_size.to_le_bytes());
        b.extend_from_slice(&a.falc_trace_dma_base.to_le_bytes());
        b.extend_from_slice(&a.falc_trace_dma_idx.to_le_bytes());
        b.push(u8::from(a.secure_mode));
        b.push(u8::from(a.raise_priv_sec));
        b.resize(24, 0);
        b
    }

    fn supports_super_surface(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct FwOpsV3 {
    app_version: u32,
}

impl FwVersionOps for FwOpsV3 {
    fn app_version(&self) -> u32 {
        self.app_version
    }

    fn allocation_struct_size(&self) -> u32 {
        20
    }

    fn encode_allocation(&self, alloc: &PmuAllocation) -> Vec<u8> {
        let mut b = Vec::with_capacity(20);
        b.extend_from_slice(&alloc.dmem_size.to_le_bytes());
        b.extend_from_slice(&[0, 0]);
        b.extend_from_slice(&alloc.dmem_offset.to_le_bytes());
        b.extend_from_slice(&alloc.fb_addr.to_le_bytes());
        b.extend_from_slice(&alloc.fb_size.to_le_bytes());
        b
    }

    fn decode_allocation(&self, b: &[u8]) -> PmuResult<PmuAllocation> {
        if b.len() < 20 {
            return Err(PmuError::InvalidArgument("short allocation record"));
        }
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&b[8..16]);
        Ok(PmuAllocation {
            dmem_size: u16::from_le_bytes([b[0], b[1]]),
            dmem_offset: le32(b, 4),
            fb_addr: u64::from_le_bytes(addr),
            fb_size: le32(b, 16),
        })
    }

    fn cmd_line_args_size(&self) -> u32 {
        40
    }

    fn encode_cmd_line_args(&self, a: &CmdLineArgs) -> Vec<u8> {
        let mut b = Vec::with_capacity(40);
        b.extend_from_slice(&a.cpu_freq_hz.to_le_bytes());
        b.extend_from_slice(&a.falc_trace_size.to_le_bytes());
        b.extend_from_slice(&a.falc_trace_dma_base.to_le_bytes());
        b.extend_from_slice(&a.falc_trace_dma_idx.to_le_bytes());
        b.push(u8::from(a.secure_mode));
        b.push(u8::from(a.raise_priv_sec));
        b.extend_from_slice(&[0, 0]);
        b.extend_from_slice(&a.super_surface_base.to_le_bytes());
        b.extend_from_slice(&a.super_surface_size.to_le_bytes());
        b.resize(40, 0);
        b
    }

    fn supports_super_surface(&self) -> bool {
        true
    }
}

/// Parsed PMU ucode descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PmuUcodeDesc {
    pub descriptor_size: u32,
    pub image_size: u32,
    pub tools_version: u32,
    pub app_version: u32,
    pub date: String,
    pub bootloader_start_offset: u32,
    pub bootloader_size: u32,
    pub bootloader_imem_offset: u32,
    pub bootloader_entry_point: u32,
    pub app_start_offset: u32,
    pub app_size: u32,
    pub app_imem_offset: u32,
    pub app_imem_entry: u32,
    pub app_dmem_offset: u32,
    pub app_resident_code_offset: u32,
    pub app_resident_code_size: u32,
    pub app_resident_data_offset: u32,
    pub app_resident_data_size: u32,
}

impl PmuUcodeDesc {
    pub fn parse(b: &[u8]) -> PmuResult<Self> {
        if b.len() < PMU_UCODE_DESC_SIZE {
            error!("PMU ucode descriptor truncated: {} bytes", b.len());
            return Err(PmuError::InvalidArgument("truncated ucode descriptor"));
        }
        let date_raw = &b[16..16 + PMU_UCODE_NB_MAX_DATE_LENGTH];
        let date_len = date_raw.iter().position(|&c| c == 0).unwrap_or(date_raw.len());
        let w = |i: usize| le32(b, 16 + PMU_UCODE_NB_MAX_DATE_LENGTH + i * 4);
        Ok(Self {
            descriptor_size: le32(b, 0),
            image_size: le32(b, 4),
            tools_version: le32(b, 8),
            app_version: le32(b, 12),
            date: String::from_utf8_lossy(&date_raw[..date_len]).into_owned(),
            bootloader_start_offset: w(0),
            bootloader_size: w(1),
            bootloader_imem_offset: w(2),
            bootloader_entry_point: w(3),
            app_start_offset: w(4),
            app_size: w(5),
            app_imem_offset: w(6),
            app_imem_entry: w(7),
            app_dmem_offset: w(8),
            app_resident_code_offset: w(9),
            app_resident_code_size: w(10),
            app_resident_data_offset: w(11),
            app_resident_data_size: w(12),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(PMU_UCODE_DESC_SIZE);
        for v in [self.descriptor_size, self.image_size, self.tools_version, self.app_version] {
            b.extend_from_slice(&v.to_le_bytes());
        }
        let mut date = [0u8; PMU_UCODE_NB_MAX_DATE_LENGTH];
        let n = self.date.len().min(PMU_UCODE_NB_MAX_DATE_LENGTH - 1);
        date[..n].copy_from_slice(&self.date.as_bytes()[..n]);
        b.extend_from_slice(&date);
        for v in [
            self.bootloader_start_offset,
            self.bootloader_size,
            self.bootloader_imem_offset,
            self.bootloader_entry_point,
            self.app_start_offset,
            self.app_size,
            self.app_imem_offset,
            self.app_imem_entry,
            self.app_dmem_offset,
            self.app_resident_code_offset,
            self.app_resident_code_size,
            self.app_resident_data_offset,
            self.app_resident_data_size,
        ] {
            b.extend_from_slice(&v.to_le_bytes());
        }
        // Remaining two words of the parsed prefix are reserved.
        b.resize(PMU_UCODE_DESC_SIZE, 0);
        b
    }

    /// Check that the app code and data segments lie inside an image of
    /// `image_len` bytes.
    pub fn check_segments(&self, image_len: usize) -> PmuResult<()> {
        let inside = |off: u32, size: u32| {
            u64::from(off) + u64::from(size) <= image_len as u64
        };
        let code_off = self.app_start_offset.saturating_add(self.app_resident_code_offset);
        let data_off = self.app_start_offset.saturating_add(self.app_resident_data_offset);
        if !inside(self.app_start_offset, self.app_size)
            || !inside(code_off, self.app_resident_code_size)
            || !inside(data_off, self.app_resident_data_size)
        {
            error!(
                "PMU ucode segments exceed the {image_len} byte image (app {:#x}+{:#x})",
                self.app_start_offset, self.app_size
            );
            return Err(PmuError::InvalidArgument("ucode segment outside image"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_app_version_is_rejected() {
        assert!(matches!(
            init_fw_ver_ops(1234),
            Err(PmuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn layouts_differ_between_families() {
        let v1 = init_fw_ver_ops(APP_VERSION_GP10B).unwrap();
        let v3 = init_fw_ver_ops(APP_VERSION_GV11B).unwrap();
        assert_eq!(v1.allocation_struct_size(), 8);
        assert_eq!(v3.allocation_struct_size(), 20);
        assert!(!v1.supports_super_surface());
        assert!(v3.supports_super_surface());
        let a = PmuAllocation {
            dmem_offset: 0x4100,
            dmem_size: 0x40,
            fb_addr: 0x1_0000_2000,
            fb_size: 0x40,
        };
        assert_eq!(v3.decode_allocation(&v3.encode_allocation(&a)).unwrap(), a);
        let narrow = v1.decode_allocation(&v1.encode_allocation(&a)).unwrap();
        assert_eq!(narrow.dmem_offset, 0x4100);
        assert_eq!(narrow.fb_addr, 0);
        assert_eq!(v3.encode_cmd_line_args(&CmdLineArgs::default()).len(), 40);
    }

    #[test]
    fn descriptor_segment_check() {
        let desc = PmuUcodeDesc {
            app_start_offset: 0x100,
            app_size: 0x200,
            app_resident_code_size: 0x100,
            app_resident_data_offset: 0x100,
            app_resident_data_size: 0x100,
            ..PmuUcodeDesc::default()
        };
        assert!(desc.check_segments(0x300).is_ok());
        assert!(desc.check_segments(0x2ff).is_err());
        let parsed = PmuUcodeDesc::parse(&desc.to_bytes()).unwrap();
        assert_eq!(parsed.app_size, 0x200);
    }
}
