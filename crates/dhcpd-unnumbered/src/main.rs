//! dhcpd-unnumbered daemon entry point.
//!
//! Opens the unscoped base listener on the main routing table and, when
//! `--bind` is given, watches for VRF devices to attach scoped listeners
//! to. Runs until SIGINT or SIGTERM, or until the base listener or the
//! link monitor fails.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dhcpd_unnumbered::frame::SERVER_PORT;
use dhcpd_unnumbered::kernel::source_address;
use dhcpd_unnumbered::{
    Args, KernelLinks, Listener, ListenerSupervisor, LogLevel, NetlinkKernel, NetlinkLinkSource,
    NetlinkMonitor, ServerConfig, VrfListenerFactory,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Semaphore;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level)?;
    info!(level = ?args.log_level, "dhcpd-unnumbered: Setting log level");

    match run(args).await {
        Ok(()) => {
            info!("dhcpd-unnumbered: Exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "dhcpd-unnumbered: Exiting with error");
            Err(e)
        }
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` directives are applied on
/// top of `--loglevel`.
fn init_logging(level: LogLevel) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_filter().into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")?;
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = Arc::new(ServerConfig::from_args(&args).context("invalid configuration")?);
    log_config(&config);

    let kernel: Arc<dyn KernelLinks> = Arc::new(NetlinkKernel::new());
    let source = source_address("lo").context("unable to get source IP to be used")?;
    let in_flight = Arc::new(Semaphore::new(config.max_in_flight));

    // Listen across interfaces with a single socket.
    let mut base = Listener::spawn(
        None,
        SERVER_PORT,
        config.clone(),
        kernel.clone(),
        source,
        in_flight.clone(),
    )
    .context("unable to open base listener")?;

    let mut monitor_task = None;
    let mut supervisor_task = None;
    let mut close_monitor = None;
    if let Some(pattern) = config.vrf_pattern.clone() {
        info!(%pattern, "Will also bind VRFs matching pattern");
        // Subscribe before the monitor takes its snapshot.
        let links = NetlinkLinkSource::new().context("unable to open netlink feed")?;
        let (monitor, events) = NetlinkMonitor::new(pattern, config.link_readiness);
        close_monitor = Some(monitor.close_handle());
        monitor_task = Some(tokio::spawn(monitor.listen(links)));

        let factory = VrfListenerFactory::new(config.clone(), kernel.clone(), source, in_flight);
        supervisor_task = Some(tokio::spawn(ListenerSupervisor::new(factory).run(events)));
    }

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    let outcome = tokio::select! {
        interrupt = tokio::signal::ctrl_c() => {
            interrupt.context("failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM");
            Ok(())
        }
        exit = base.finished() => match exit {
            Ok(()) => Err(anyhow!("unexpected server exit")),
            Err(e) => Err(anyhow::Error::new(e).context("unexpected server exit")),
        },
        exit = async {
            match monitor_task.as_mut() {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        } => match exit {
            Ok(Ok(())) => Err(anyhow!("netlink monitor exited unexpectedly")),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("netlink monitor unexpected exit")),
            Err(e) => Err(anyhow::Error::new(e).context("netlink monitor task failed")),
        },
    };

    info!("closing...");
    if let Some(close) = close_monitor {
        close.cancel();
    }
    if let Some(task) = monitor_task {
        if !task.is_finished() {
            if let Err(e) = task.await {
                error!(error = %e, "Netlink monitor task failed");
            }
        }
    }
    // The monitor dropped its sender, so the supervisor drains and closes
    // every VRF listener.
    if let Some(task) = supervisor_task {
        if let Err(e) = task.await {
            error!(error = %e, "Listener supervisor task failed");
        }
    }
    base.close().await;

    outcome
}

fn log_config(config: &ServerConfig) {
    if config.dynamic_hostname {
        info!("Dynamic hostnames based on IP enabled");
    }
    if config.hostname_override {
        info!(prefix = %config.override_prefix, "Hostname override enabled");
    }
    info!(pattern = %config.interface_pattern, "Handling interfaces matching pattern");
    if let Some(tftp) = config.tftp {
        info!(%tftp, "Using TFTP server");
    }
    info!(range = %config.private_range, "Deprioritizing private IPs");
    info!(dns = ?config.dns_servers, "Using DNS");
    info!(
        lease_secs = config.lease_secs(),
        max_in_flight = config.max_in_flight,
        readiness = ?config.link_readiness,
        "Server settings"
    );
}
