//! Thin CLI wiring the `blkmig` save handlers to a TCP stream and a
//! demo in-memory device set, for manual exercise — the equivalent role
//! `mayastor.rs` plays for the library crate it wraps.

use std::{net::TcpStream, sync::Arc, time::Duration};

use blkmig::{
    device::{DeviceRegistry, MemDevice, StaticRegistry},
    receiver,
    stream::Stream,
    MigrationCliArgs, MigrationConfig, MigrationDriver, SaveHandlers,
};
use structopt::StructOpt;
use tokio::net::TcpListener;
use tracing::info;

fn demo_registry() -> Arc<dyn DeviceRegistry> {
    Arc::new(StaticRegistry::new(vec![Arc::new(MemDevice::new("disk0", 4096))]))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = MigrationCliArgs::from_args();
    blkmig::logging::init(&args.log_level);

    let config = MigrationConfig::from(&args);

    if args.listen {
        run_receiver(&args).await
    } else {
        run_sender(&args, &config).await
    }
}

async fn run_sender(args: &MigrationCliArgs, config: &MigrationConfig) -> Result<(), Box<dyn std::error::Error>> {
    let socket = TcpStream::connect(&args.address)?;
    let mut stream = blkmig::stream::TcpMigrationStream::new(socket)?;

    let driver = MigrationDriver::new(demo_registry());
    driver.set_params(config.blk, config.shared, config.bandwidth_limit, config.max_downtime());

    driver.save_live_setup(&mut stream).await?;
    while driver.save_live_pending(0) > 0 {
        driver.save_live_iterate(&mut stream).await?;
        if driver.save_live_pending(0) <= bytes_budget(config.max_downtime(), config.bandwidth_limit) {
            break;
        }
    }
    driver.save_live_complete(&mut stream).await?;

    info!("migration complete");
    Ok(())
}

fn bytes_budget(max_downtime: Duration, bandwidth_limit: u64) -> u64 {
    if bandwidth_limit == 0 {
        0
    } else {
        (max_downtime.as_secs_f64() * bandwidth_limit as f64) as u64
    }
}

async fn run_receiver(args: &MigrationCliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&args.address).await?;
    info!(address = %args.address, "listening for migration stream");
    let (socket, _peer) = listener.accept().await?;
    let socket = socket.into_std()?;
    let mut stream = blkmig::stream::TcpMigrationStream::new(socket)?;

    let registry = demo_registry();
    loop {
        receiver::load(&mut stream, registry.as_ref()).await?;
        if stream.has_error() {
            break;
        }
    }
    Ok(())
}
