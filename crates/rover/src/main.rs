pub mod config;
pub mod demo;
pub mod rig;

use std::process::ExitCode;

use clap::Parser;
use config::{Cli, RoverBuildError, RoverConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rover=info,rover_drive=info,rover_devices=info,rover_rpi=info,rover_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg = match config::load(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("Failed to load config: {:?}", err);
            return ExitCode::FAILURE;
        }
    };

    info!("rover starting up on {}", cfg.bus);
    match run(cfg).await {
        Ok(_) => {
            info!("rover shut down!");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("rover exited with an error: {:?}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "rpi")]
async fn run(cfg: RoverConfig) -> Result<(), RoverBuildError> {
    use rover_rpi::RpiDelay;
    use std::sync::Mutex;
    use tracing::warn;

    let bus = Mutex::new(rover_rpi::open_bus(&cfg.bus)?);
    let mut rig = rig::Rig::build(&bus, &cfg, RpiDelay)?;

    let res = match rig.initialize() {
        Ok(()) => {
            tokio::select! {
                res = demo::run(&mut rig, &cfg) => res,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, stopping");
                    Ok(())
                }
            }
        }
        Err(err) => Err(err),
    };

    //teardown runs however the demo ended
    let closed = rig.teardown();
    res.and(closed).map_err(RoverBuildError::from)
}

#[cfg(not(feature = "rpi"))]
async fn run(_cfg: RoverConfig) -> Result<(), RoverBuildError> {
    Err(RoverBuildError::message(
        "built without the rpi feature, there is no i2c transport to open",
    ))
}
