use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use crossbeam_channel::bounded;
use log::{error, info, warn};
use thiserror::Error;

use beacon_server::config::{ConfigError, ServerConfig};
use beacon_server::dispatch::{Dispatcher, RoutingTable};
use beacon_server::link::{BeaconLink, ReferenceLink};
use beacon_server::scheduler::Scheduler;
use beacon_server::store::{JsonFileStore, StoreError};
use beacon_server::transport::TransportError;

#[derive(Parser)]
#[command(name = "beacon_server")]
#[command(about = "Schedules beacon messages and relays reference station queries", long_about = None)]
struct Args {
    /// INI configuration file
    #[arg(short, long, default_value = "server.ini")]
    config: PathBuf,

    /// Override the message store path from the configuration
    #[arg(long)]
    store: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), DaemonError> {
    let mut config = ServerConfig::load_from(&args.config)?;
    if let Some(store) = args.store {
        config.store_path = store;
    }
    info!("using configuration {}", args.config.display());

    let store = Arc::new(JsonFileStore::open(&config.store_path)?);

    let beacon = Arc::new(BeaconLink::new(config.beacon.link_config()));
    beacon
        .listen(&config.beacon.listen)?
        .spawn()
        .map_err(TransportError::from)?;

    let mut routes = RoutingTable::new();
    for station in &config.references {
        let link = Arc::new(ReferenceLink::new(station.station_id, station.link.link_config()));
        link.listen(&station.link.listen)?
            .spawn()
            .map_err(TransportError::from)?;
        if routes.register(link).is_some() {
            warn!("station {} configured twice, keeping the last", station.station_id);
        }
    }
    info!("{} reference station(s) registered", routes.len());
    Dispatcher::new(routes)
        .with_window(config.window.clone())
        .listen(&config.dispatcher)?
        .spawn()
        .map_err(TransportError::from)?;

    let scheduler = Scheduler::new(store, beacon, config.scheduler.clone());
    let summary = scheduler.start()?;
    info!(
        "startup reconciliation: {} requeued, {} missed",
        summary.requeued, summary.missed
    );

    let (stop, stopped) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop.try_send(());
    })?;
    let _ = stopped.recv();

    info!("shutting down");
    let summary = scheduler.shutdown()?;
    info!(
        "shutdown reconciliation: {} requeued, {} missed",
        summary.requeued, summary.missed
    );
    Ok(())
}
