// CLASSIFICATION: COMMUNITY
// Filename: main.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-18

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;

use pmu_rtos::device::{type_name, DeviceList, MAX_DEVTYPE};
use pmu_rtos::hal::sim::{SimDeviceTable, SimGpu};
use pmu_rtos::mm::LocklessAllocator;
use pmu_rtos::pmu::lsfm::{FALCON_ID_FECS, FALCON_ID_GPCCS};
use pmu_rtos::pmu::msg::PMU_UNIT_PERFMON;
use pmu_rtos::pmu::{PmuCallback, PmuMsg, RpcRequest};
use pmu_rtos::{Pmu, PmuConfig};

#[derive(Parser)]
#[command(about = "Drive the PMU runtime against the simulated GPU")]
struct Cli {
    /// TOML config; defaults plus PMU_* environment overrides otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Boot from the signed multi-blob firmware
    #[arg(long, global = true)]
    secure: bool,
    /// Use FB queues in the super surface
    #[arg(long, global = true)]
    super_surface: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the RTOS and print the queue layout
    Boot,
    /// Bootstrap an LS falcon through the ACR RPCs
    Bootstrap {
        /// fecs or gpccs
        #[arg(long, default_value = "fecs")]
        falcon: String,
    },
    /// Post echo RPCs and count the completions
    Rpc {
        #[arg(long, default_value_t = 8)]
        count: u32,
    },
    /// Exercise the lock-free block allocator
    Alloc {
        #[arg(long, default_value_t = 0x1000)]
        base: u64,
        #[arg(long, default_value_t = 4096)]
        length: u64,
        #[arg(long, default_value_t = 256)]
        block: u64,
        /// Blocks to allocate before freeing them all
        #[arg(long, default_value_t = 4)]
        count: u32,
    },
    /// List the simulated device table
    Devices,
}

fn load_config(cli: &Cli) -> anyhow::Result<PmuConfig> {
    let mut cfg = match &cli.config {
        Some(path) => PmuConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PmuConfig::from_env()?,
    };
    if cli.secure {
        cfg.secure_boot = true;
    }
    if cli.super_surface {
        cfg.super_surface = true;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn bring_up(cfg: PmuConfig) -> anyhow::Result<(SimGpu, Pmu)> {
    let gpu = SimGpu::new(&cfg);
    let timeout = cfg.fw_ready_timeout_ms;
    let pmu = Pmu::new(cfg, gpu.hal())?;
    pmu.rtos_early_init().context("early init")?;
    pmu.rtos_init().context("rtos init")?;
    pmu.wait_fw_ready(timeout).context("waiting for PMU INIT")?;
    info!("PMU is up: {:?}", pmu.get_fw_state());
    Ok((gpu, pmu))
}

fn boot(cfg: PmuConfig) -> anyhow::Result<()> {
    let (gpu, pmu) = bring_up(cfg)?;
    let queues = pmu.queues()?;
    let dmem = pmu.dmem_allocator()?;
    println!("state      {:?}", pmu.get_fw_state());
    println!("queues     {}", if queues.is_fb_mode() { "FB" } else { "DMEM" });
    println!(
        "dmem heap  {:#x}+{:#x} in {} blocks",
        dmem.base(),
        dmem.length(),
        dmem.node_count()
    );
    println!("boots      {}", gpu.falcon.stats().boots);
    pmu.shutdown();
    pmu.remove_support();
    Ok(())
}

fn bootstrap(cfg: PmuConfig, falcon: &str) -> anyhow::Result<()> {
    let falcon_id = match falcon {
        "fecs" => FALCON_ID_FECS,
        "gpccs" => FALCON_ID_GPCCS,
        other => bail!("unknown falcon {other}"),
    };
    let (gpu, pmu) = bring_up(cfg)?;
    pmu.lsfm_bootstrap_ls_falcon(falcon_id)?;
    println!(
        "bootstrapped {falcon} ({falcon_id}); RTOS reports {:?}",
        gpu.falcon.bootstrapped_falcons()
    );
    pmu.remove_support();
    Ok(())
}

fn rpc(cfg: PmuConfig, count: u32) -> anyhow::Result<()> {
    let (gpu, pmu) = bring_up(cfg)?;
    let ok = Arc::new(AtomicU32::new(0));
    let failed = Arc::new(AtomicU32::new(0));
    for i in 0..count {
        let (ok, failed) = (Arc::clone(&ok), Arc::clone(&failed));
        let cb: PmuCallback = Box::new(move |_: &PmuMsg, err: i32| {
            if err == 0 {
                ok.fetch_add(1, Ordering::Relaxed);
            } else {
                failed.fetch_add(1, Ordering::Relaxed);
            }
        });
        let req = RpcRequest::new(PMU_UNIT_PERFMON, 0, i.to_le_bytes().to_vec());
        pmu.rpc_execute(req, false, Some(cb))
            .with_context(|| format!("posting rpc {i}"))?;
        pmu.process_message()?;
    }
    println!(
        "{} of {count} rpcs completed, {} failed, {} seen by the RTOS",
        ok.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        gpu.falcon.stats().rpcs
    );
    pmu.remove_support();
    Ok(())
}

fn alloc(base: u64, length: u64, block: u64, count: u32) -> anyhow::Result<()> {
    let pool = LocklessAllocator::init("pmuctl", base, length, block, 0)?;
    let mut addrs = Vec::new();
    for _ in 0..count {
        let addr = pool.alloc(block);
        if addr == 0 {
            println!("pool exhausted after {} blocks", addrs.len());
            break;
        }
        println!("alloc {addr:#x}");
        addrs.push(addr);
    }
    print!("{}", pool.stats());
    for addr in addrs {
        pool.free(addr);
    }
    print!("{}", pool.stats());
    pool.destroy();
    Ok(())
}

fn devices() -> anyhow::Result<()> {
    let mut table = SimDeviceTable::typical();
    let list = DeviceList::build(&mut table)?;
    for dev_type in 0..MAX_DEVTYPE {
        for dev in list.iter_type(dev_type) {
            println!(
                "{:<9} inst {} engine {} runlist {} pri_base {:#x}",
                type_name(dev.dev_type),
                dev.inst_id,
                dev.engine_id,
                dev.runlist_id,
                dev.pri_base
            );
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match &cli.cmd {
        Command::Boot => boot(load_config(&cli)?),
        Command::Bootstrap { falcon } => bootstrap(load_config(&cli)?, falcon),
        Command::Rpc { count } => rpc(load_config(&cli)?, *count),
        Command::Alloc {
            base,
            length,
            block,
            count,
        } => alloc(*base, *length, *block, *count),
        Command::Devices => devices(),
    }
}
