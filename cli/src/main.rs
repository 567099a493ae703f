use std::sync::Arc;

use clap::{Command, command};
use dotenv::dotenv;
use rover_eth::rover::{EthDriver, EthRoverConfig};
use rover_lib::collector::{
    Collector, RpcCollector, StandaloneCollector, spawn_directive_pump,
};
use rover_lib::control::{ChainDriver, RoverControl, RoverEvent};
use rover_lib::marker::{SettlementProbe, TxMarker};
use rover_lib::metrics::{SharedMetrics, create_shared_metrics};
use rover_lib::tracker::{RequestTracker, shared_heights};
use rover_lsk::rover::{LskDriver, LskRoverConfig};
use rover_protocol::{Chain, RoverMessage};
use tracing::{error, info};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{RoverConfig, get_rover_config};

mod config;

#[tokio::main]
async fn main() {
    // ignore failures as .env might not be present at runtime
    dotenv()
        .inspect_err(|err| println!("[WARN] reading .env files failed with err {err}"))
        .ok();

    let config = match get_rover_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(3);
        }
    };

    let (non_blocking_appender, _guard_stdout) = tracing_appender::non_blocking(std::io::stdout());
    let stdout_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_appender)
        .with_filter(config.rust_log);
    tracing_subscriber::registry()
        .with(stdout_subscriber)
        .init();

    let matches = command!()
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new("eth").about("run the Ethereum devp2p rover"))
        .subcommand(Command::new("lsk").about("run the Lisk HTTP rover"))
        .get_matches();

    let chain = match matches.subcommand() {
        Some(("eth", _)) => Chain::Eth,
        Some(("lsk", _)) => Chain::Lsk,
        _ => unreachable!("subcommand is required"),
    };

    if let Err(err) = run(chain, config).await {
        error!(%err, "rover terminated with unrecoverable error");
        std::process::exit(3);
    }
    info!(chain = %chain, "rover stopped cleanly");
}

async fn run(chain: Chain, config: RoverConfig) -> anyhow::Result<()> {
    info!(
        chain = %chain,
        network = %config.bc_network,
        standalone = config.is_standalone,
        "starting rover"
    );

    let metrics = create_shared_metrics();
    let (event_tx, event_rx) = flume::bounded(256);
    let (directive_tx, directive_rx) = flume::unbounded();

    let designated = match chain {
        Chain::Eth => config.eth_designated_pubkey.clone(),
        Chain::Lsk => config.lsk_designated_pubkey.clone(),
    };
    let marker = TxMarker::new(designated, config.is_standalone);
    let heights = shared_heights();
    let tracker = RequestTracker::new(heights.clone());

    if config.is_standalone {
        // keep the directive channel open; standalone rovers get no directives
        let _directive_tx = directive_tx;
        let collector = Arc::new(StandaloneCollector);
        match chain {
            Chain::Eth => {
                let driver = start_eth(&config, &heights, &event_tx, &metrics).await?;
                run_until_shutdown(driver, collector, marker, tracker, directive_rx, event_rx, metrics).await
            }
            Chain::Lsk => {
                let driver = start_lsk(&config, &event_tx)?;
                run_until_shutdown(driver, collector, marker, tracker, directive_rx, event_rx, metrics).await
            }
        }
    } else {
        let collector = Arc::new(RpcCollector::connect(&config.rover_collector_url).await?);
        let (pump_shutdown_tx, pump_shutdown_rx) = tokio::sync::oneshot::channel();
        let pump = spawn_directive_pump(collector.clone(), chain, directive_tx, pump_shutdown_rx);

        let result = match chain {
            Chain::Eth => {
                let driver = start_eth(&config, &heights, &event_tx, &metrics).await?;
                run_until_shutdown(driver, collector, marker, tracker, directive_rx, event_rx, metrics).await
            }
            Chain::Lsk => {
                let driver = start_lsk(&config, &event_tx)?;
                run_until_shutdown(driver, collector, marker, tracker, directive_rx, event_rx, metrics).await
            }
        };

        let _ = pump_shutdown_tx.send(());
        let _ = pump.await;
        result
    }
}

async fn start_eth(
    config: &RoverConfig,
    heights: &rover_lib::tracker::SharedHeights,
    event_tx: &flume::Sender<RoverEvent>,
    metrics: &SharedMetrics,
) -> anyhow::Result<EthDriver> {
    EthDriver::start(
        EthRoverConfig {
            network: config.bc_network,
            maximum_peers: config.maximum_peers,
            alt_boot_nodes: config.eth_alt_boot_nodes.clone(),
        },
        heights.clone(),
        event_tx.clone(),
        metrics.clone(),
    )
    .await
}

fn start_lsk(
    config: &RoverConfig,
    event_tx: &flume::Sender<RoverEvent>,
) -> anyhow::Result<LskDriver> {
    LskDriver::new(
        LskRoverConfig {
            hosts: config.lsk_hosts.clone(),
            randomize_nodes: config.randomize_nodes,
            banned_peers: config.banned_peers.clone(),
        },
        event_tx.clone(),
    )
}

async fn run_until_shutdown<D, C>(
    driver: D,
    collector: Arc<C>,
    marker: TxMarker,
    tracker: RequestTracker,
    directive_rx: flume::Receiver<RoverMessage>,
    event_rx: flume::Receiver<RoverEvent>,
    metrics: SharedMetrics,
) -> anyhow::Result<()>
where
    D: ChainDriver + 'static,
    C: Collector + SettlementProbe + 'static,
{
    let chain = driver.chain();
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
    let control = RoverControl::new(
        driver,
        collector,
        marker,
        tracker,
        directive_rx,
        event_rx,
        shutdown_rx,
        rover_lib::emitted_cache_size(chain),
        metrics,
    );
    let control_task = tokio::spawn(control.run());

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(()).await;

    control_task.await?
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
