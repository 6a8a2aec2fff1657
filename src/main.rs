//! tfe-hw-mgr - drive the TFE hardware manager against simulated units
//!
//! Commands:
//! - `tfe-hw-mgr run --scenario dual` - acquire, stream frames, inject a fault, tear down
//! - `tfe-hw-mgr caps` - list the simulated hardware
//! - `tfe-hw-mgr config` - print the effective configuration
//! - `tfe-hw-mgr ope` - build bus-read commands for one NV12 frame
//!
//! Logging follows `RUST_LOG` (default `info`); `--json` switches to JSON lines.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use ope_bus_rd::{BusRd, HwInfo, InPortAcquire, IoBuf, PixelFormat, PrepareRequest, StripeIo};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tfe_hw_mgr::config::ManagerConfig;
use tfe_hw_mgr::event::{CallbackTable, IspEvent};
use tfe_hw_mgr::hw::mock::MockRig;
use tfe_hw_mgr::hw::{HwEvent, HwEventKind, HwFault, OutResId, TfeInId, UsageType};
use tfe_hw_mgr::limits::TFE_HW_NUM_MAX;
use tfe_hw_mgr::manager::{
    AcquireArgs, ConfigArgs, HwUpdateEntry, RecoveryOutcome, StartArgs, StopArgs,
};
use tfe_hw_mgr::ports::InPortInfo;
use tfe_hw_mgr::TfeHwManager;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tfe-hw-mgr")]
#[command(version)]
#[command(about = "TFE hardware manager on simulated hardware", long_about = None)]
struct Cli {
    /// TOML configuration file, layered over defaults and under TFEHW_ variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one context through its whole lifecycle
    Run {
        #[arg(short, long, value_enum, default_value_t = Scenario::Single)]
        scenario: Scenario,

        /// Frames to simulate before the fault
        #[arg(short, long, default_value_t = 3)]
        frames: u32,

        /// Raise an input overflow after the frames
        #[arg(long)]
        fault: bool,

        /// Recover from the fault instead of only dumping registers
        #[arg(long)]
        recover: bool,
    },

    /// List the simulated hardware
    Caps,

    /// Print the effective configuration
    Config,

    /// Build OPE bus-read commands for one NV12 frame
    Ope {
        #[arg(long, default_value_t = 1920)]
        width: u32,

        #[arg(long, default_value_t = 1080)]
        height: u32,

        /// Horizontal stripes per plane
        #[arg(long, default_value_t = 2)]
        stripes: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// One pixel pipe on one core
    Single,
    /// Pixel pipe split across two cores
    Dual,
    /// Raw dump through a per-channel path only
    Rdi,
}

impl Scenario {
    fn ports(self) -> Vec<InPortInfo> {
        match self {
            Scenario::Single => vec![InPortInfo::sensor(
                0,
                UsageType::Single,
                &[OutResId::Full, OutResId::StatsBf],
            )],
            Scenario::Dual => vec![InPortInfo::sensor(
                1,
                UsageType::Dual,
                &[OutResId::Full, OutResId::StatsAwbBg, OutResId::Rdi0],
            )],
            Scenario::Rdi => vec![InPortInfo::sensor(2, UsageType::Single, &[OutResId::Rdi0])],
        }
    }

    fn event(self, kind: HwEventKind, hw_idx: u32) -> HwEvent {
        match self {
            Scenario::Rdi => HwEvent::rdi(kind, hw_idx, TfeInId::Rdi0),
            _ => HwEvent::camif(kind, hw_idx),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ManagerConfig> {
    let config = match path {
        Some(path) => ManagerConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::load().context("loading configuration")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            scenario,
            frames,
            fault,
            recover,
        } => run_scenario(config, scenario, frames, fault, recover).await?,
        Commands::Caps => show_caps(config).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
        Commands::Ope {
            width,
            height,
            stripes,
        } => build_ope(width, height, stripes)?,
    }

    Ok(())
}

async fn run_scenario(
    config: ManagerConfig,
    scenario: Scenario,
    frames: u32,
    fault: bool,
    recover: bool,
) -> anyhow::Result<()> {
    let rig = MockRig::new(TFE_HW_NUM_MAX as u32);
    let mgr = TfeHwManager::new(config, rig.devices(), rig.cdm_engine())?;
    mgr.debug_flags().set_recovery_enabled(recover);
    let mut outcomes = mgr.subscribe_recovery();

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let callbacks = CallbackTable::uniform(Arc::new(move |event: &IspEvent| {
        counter.fetch_add(1, Ordering::Relaxed);
        info!(?event, "Client event");
    }));

    let ctx = mgr.acquire(AcquireArgs::new(scenario.ports()).with_callbacks(callbacks))?;
    let snap = mgr.snapshot(ctx)?;
    let bases: Vec<u32> = snap.bases.iter().map(|b| b.idx).collect();
    info!(%ctx, ?scenario, is_dual = snap.is_dual, rdi_only = snap.rdi_only, ?bases, "Acquired");

    mgr.start(
        ctx,
        StartArgs {
            config: ConfigArgs::init(1, vec![HwUpdateEntry::general(1, 0, 256)]),
            start_only: false,
        },
    )
    .await?;

    for frame in 0..frames {
        for kind in [HwEventKind::Sof, HwEventKind::RegUpdate, HwEventKind::Epoch, HwEventKind::Eof] {
            for &hw_idx in &bases {
                mgr.handle_hw_event(ctx, scenario.event(kind.clone(), hw_idx));
            }
        }
        let req_id = u64::from(frame) + 2;
        mgr.config_hw(ctx, ConfigArgs::update(req_id, vec![HwUpdateEntry::general(1, 256, 128)]))
            .await?;
    }

    if fault {
        let master = snap.master_hw_idx;
        mgr.handle_hw_event(ctx, scenario.event(HwEventKind::Error(HwFault::Overflow), master));
        match tokio::time::timeout(Duration::from_secs(2), outcomes.recv()).await {
            Ok(Ok(RecoveryOutcome::Recovered { contexts, cores })) => {
                info!(?contexts, ?cores, "Recovered");
            }
            Ok(Ok(outcome)) => warn!(?outcome, "Fault not recovered"),
            Ok(Err(e)) => warn!(error = %e, "Recovery channel closed"),
            Err(_) => warn!("No recovery outcome within 2s"),
        }
    }

    mgr.stop(ctx, StopArgs::default()).await?;
    mgr.release(ctx)?;
    mgr.shutdown().await?;

    println!(
        "{ctx}: {} events delivered, {} adapter calls, {} resources still reserved",
        delivered.load(Ordering::Relaxed),
        rig.log.snapshot().len(),
        rig.reserved_total()
    );
    Ok(())
}

async fn show_caps(config: ManagerConfig) -> anyhow::Result<()> {
    let rig = MockRig::new(TFE_HW_NUM_MAX as u32);
    let mgr = TfeHwManager::new(config, rig.devices(), rig.cdm_engine())?;
    println!("{}", serde_json::to_string_pretty(&mgr.hw_caps())?);
    mgr.shutdown().await?;
    Ok(())
}

fn build_ope(width: u32, height: u32, stripes: u32) -> anyhow::Result<()> {
    anyhow::ensure!(stripes > 0, "at least one stripe is required");
    let bus_rd = BusRd::probe(HwInfo::default())?;
    bus_rd.acquire(0, false, &[InPortAcquire::new(1, PixelFormat::Nv12, width, height)])?;

    let stripe_width = width / stripes;
    let plane = |base: u32, rows: u32| -> Vec<StripeIo> {
        (0..stripes)
            .map(|s| StripeIo::new(base + s * stripe_width, stripe_width, rows, width))
            .collect()
    };
    let request = PrepareRequest {
        request_id: 1,
        batches: vec![vec![IoBuf::input(
            1,
            PixelFormat::Nv12,
            vec![plane(0x1000_0000, height), plane(0x2000_0000, height / 2)],
        )]],
    };

    let prepared = bus_rd.prepare(0, &request, 0)?;
    for (stripe, cmds) in prepared.batches[0].stripes.iter().enumerate() {
        let spans: Vec<String> = cmds
            .iter()
            .map(|c| format!("{:#06x}+{}", c.offset, c.len))
            .collect();
        println!("stripe {stripe}: {}", spans.join(" "));
    }
    println!("go: {:#06x}+{}", prepared.go.offset, prepared.go.len);
    println!("total: {} bytes", prepared.len());
    bus_rd.release(0)?;
    Ok(())
}
