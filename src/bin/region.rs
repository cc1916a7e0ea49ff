//! veldt-region-server binary
//!
//! Boots a region group, loads persisted state, and runs the main-thread
//! tick loop until interrupted.
//!
//! ## Configuration (flags / env / TOML via the `config` crate)
//!
//! | Key                      | Default        | Description                  |
//! |--------------------------|----------------|------------------------------|
//! | `VELDT_REGION__NAME`     | `Veldt Test`   | Region name                  |
//! | `VELDT_REGION__GRID_X/Y` | `1000`/`1000`  | Grid coordinates             |
//! | `VELDT_REGION__UDP_PORT` | `9000`         | Viewer circuit port          |
//! | `VELDT_REGION__HTTP_PORT`| `9001`         | Capability / federation port |
//! | `VELDT_REGION__STATE_DIR`| `.`            | simstate file directory      |
//! | `[grid] grid_server`     | *(unset)*      | Unset means standalone mode  |

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use veldt_region::config::RegionConfig;
use veldt_region::grid::standalone::StandaloneGrid;
use veldt_region::region::{Region, RegionGroup};
use veldt_region::scripting::stubvm::StubVmFactory;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "veldt-region-server", about = "Veldt Region Server", version)]
struct Args {
    /// Configuration file (TOML), defaults to ./veldt.toml when present
    #[arg(long, env = "VELDT_CONFIG")]
    config: Option<String>,

    /// Region name override
    #[arg(long, env = "VELDT_REGION_NAME")]
    name: Option<String>,

    /// Grid X coordinate override
    #[arg(long, env = "VELDT_GRID_X")]
    grid_x: Option<u32>,

    /// Grid Y coordinate override
    #[arg(long, env = "VELDT_GRID_Y")]
    grid_y: Option<u32>,

    /// Skip loading persisted region state
    #[arg(long, default_value_t = false)]
    fresh: bool,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("veldt_region=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = RegionConfig::load(args.config.as_deref())?;
    if let Some(name) = args.name {
        config.region.name = name;
    }
    if let Some(x) = args.grid_x {
        config.region.grid_x = x;
    }
    if let Some(y) = args.grid_y {
        config.region.grid_y = y;
    }

    if !config.is_standalone() {
        // the networked backend is deployment-specific glue implementing
        // grid::GridBackend; this build ships only the standalone grid
        bail!("grid_server is set, but this build only supports standalone mode");
    }

    log::info!(
        "starting veldt-region-server (region='{}' at ({},{}), state_dir='{}')",
        config.region.name,
        config.region.grid_x,
        config.region.grid_y,
        config.region.state_dir,
    );

    let state_dir = PathBuf::from(config.region.state_dir.clone());
    let mut group = RegionGroup::new(config.clone());
    let backend = Rc::new(StandaloneGrid::new(group.task_queue()));
    group.set_backend(backend);

    let mut region = Region::new(&config, Arc::new(StubVmFactory));
    if !args.fresh {
        // unreadable state is fatal; an operator must intervene rather than
        // have the server quietly start an empty region
        let count = region.load_state(&state_dir)?;
        log::info!("restored {} prims", count);
    }
    group.add_region(region);

    // main loop: fast pump at 20 Hz, housekeeping at 1 Hz
    let mut fast = tokio::time::interval(std::time::Duration::from_millis(50));
    let mut slow = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = fast.tick() => group.tick(),
            _ = slow.tick() => group.slow_tick(),
            _ = tokio::signal::ctrl_c() => {
                log::info!("SIGINT: saving state and shutting down");
                break;
            }
        }
    }

    for region in group.regions.iter_mut() {
        region.save_state(&state_dir)?;
        region.shutdown();
    }
    Ok(())
}
