// main.rs

mod config;
mod dispatcher;
mod driver;
mod gateway;
mod housekeeping;
mod link;
mod ring_buffer;
mod shutdown;
#[cfg(any(test, feature = "testing"))]
mod sim_link;
mod sink;
mod supervisor;

use crate::config::DaemonConfig;
use crate::dispatcher::Dispatcher;
use crate::driver::DriverTransport;
use crate::gateway::{ClientGateway, client_task};
use crate::housekeeping::housekeeping_task;
use crate::link::{LinkClient, LinkTransport};
#[cfg(feature = "testing")]
use crate::sim_link::SimulatedTransport;
use crate::sink::{SinkSettings, delivery_task, telemetry_channel};
use crate::supervisor::Supervisor;
use anyhow::Context;
use cdh_shared::Catalog;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// The compiled UART driver, or the dummy link when testing without hardware.
fn open_transport(driver_path: &Path) -> anyhow::Result<Box<dyn LinkTransport>> {
    match DriverTransport::load(driver_path) {
        Ok(driver) => {
            info!(path = ?driver_path, "UART driver loaded");
            Ok(Box::new(driver))
        }
        Err(e) => {
            #[cfg(feature = "testing")]
            {
                warn!("UART driver missing, using simulated link: {e}");
                Ok(Box::new(SimulatedTransport::dummy()))
            }
            #[cfg(not(feature = "testing"))]
            Err(e).context("UART driver missing and testing mode not enabled")
        }
    }
}

async fn termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM, only Ctrl-C will stop the daemon: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = DaemonConfig::load().context("failed to load configuration")?;
    let catalog = Catalog::standard();
    let available = cfg.available_in(catalog);
    info!(source_tag = %cfg.source_tag, ?available, "starting CDH daemon");

    // --- Channels ---
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(32);
    let (reply_tx, reply_rx) = mpsc::channel::<String>(32);
    let (sink, queue) = telemetry_channel(cfg.sink_capacity);

    let mut supervisor = Supervisor::new(cfg.join_timeout(), cfg.liveness_interval());

    // --- Link / dispatcher ---
    // The transport is opened before any other role so a missing driver
    // fails startup instead of tearing down running roles.
    let transport = open_transport(&cfg.driver_path)?;
    let link = LinkClient::init(transport, cfg.link_timeout(), cfg.link_retries)
        .context("failed to initialize link")?;
    let dispatcher = Dispatcher::new(catalog, available, link, sink.clone(), cfg.source_tag.clone());
    let listener = supervisor.listener();
    let idle = cfg.command_poll();
    supervisor.add_role(
        "dispatcher",
        tokio::task::spawn_blocking(move || dispatcher.run(cmd_rx, reply_tx, listener, idle)),
    );

    // --- Client gateway ---
    let gateway = ClientGateway::bind(&cfg.client_socket_path);
    supervisor.add_role(
        "client gateway",
        tokio::spawn(client_task(
            gateway,
            cmd_tx,
            reply_rx,
            cfg.reply_wait(),
            supervisor.listener(),
        )),
    );

    // --- Telemetry sink ---
    supervisor.add_role(
        "telemetry sink",
        tokio::spawn(delivery_task(
            SinkSettings::from(&cfg),
            queue,
            supervisor.listener(),
        )),
    );

    // --- OBC housekeeping ---
    if cfg.housekeeping.enabled {
        match housekeeping::open_adc(&cfg.housekeeping) {
            Ok(adc) => supervisor.add_role(
                "housekeeping",
                tokio::spawn(housekeeping_task(
                    adc,
                    Duration::from_secs(cfg.housekeeping.period_secs),
                    sink,
                    supervisor.listener(),
                )),
            ),
            Err(e) => warn!("OBC housekeeping disabled: {e}"),
        }
    }

    let outcome = supervisor.run(termination_signal()).await;
    info!(?outcome, "all roles stopped or abandoned, exiting");
    std::process::exit(outcome.exit_code());
}
