use std::path::Path;
use std::sync::{mpsc, Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

use wol_wake::config::{Config, EnablementKind};
use wol_wake::controller::Virsh;
use wol_wake::descriptor::{LibvirtDir, MacListFile, UuidStateFile};
use wol_wake::dispatch::{Debounce, Dispatcher};
use wol_wake::index::{self, TargetIndex};
use wol_wake::{layer2, layer4};

#[derive(Parser)]
#[command(version, about = "Starts libvirt domains when a Wake-on-LAN packet for them is seen")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "/etc/wol-wake/config.yml")]
    config: String,

    /// Interface to listen on, overrides the configuration
    #[arg(short, long)]
    interface: Option<String>,

    /// Comma-separated UDP ports, overrides the configuration
    #[arg(long, value_delimiter = ',')]
    udp_ports: Option<Vec<u16>>,

    /// Run even if the configuration has `enabled: false`
    #[arg(long, default_value_t = false)]
    force: bool,

    /// More output, repeat for trace logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logger(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    SimpleLogger::new()
        .with_level(level)
        .env()
        .init()
        .context("failed to initialize logger")
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = shellexpand::full(&cli.config)
        .with_context(|| format!("cannot expand config path {}", cli.config))?;
    let mut cfg = Config::load(Path::new(path.as_ref()))?;

    if let Some(iface) = &cli.interface {
        cfg.interface = iface.clone();
    }
    if let Some(ports) = &cli.udp_ports {
        cfg.layer4.ports = ports.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

fn build_index(cfg: &Config) -> TargetIndex {
    let source = LibvirtDir::new(&cfg.descriptor_dir);
    match cfg.enablement.kind {
        EnablementKind::Uuid => TargetIndex::new(source, UuidStateFile::new(&cfg.enablement.path)),
        EnablementKind::Mac => TargetIndex::new(source, MacListFile::new(&cfg.enablement.path)),
    }
}

async fn run(cfg: Config, token: CancellationToken) -> Result<()> {
    let index = Arc::new(build_index(&cfg));
    let count = index.refresh();
    log::info!("indexed {} enabled MAC(s) from {}", count, cfg.descriptor_dir.display());

    let raw = match cfg.layer2_interface() {
        Some(name) => layer2::open(&name).with_context(|| format!("raw listener on '{name}'"))?,
        None => None,
    };

    let (tx, rx) = mpsc::sync_channel(cfg.queue_len);
    let udp = layer4::spawn(&cfg.layer4, cfg.layer4_interface(), tx.clone(), token.clone())
        .context("UDP listeners")?;

    let dispatcher = Dispatcher::new(
        Arc::clone(&index),
        cfg.allowlist(),
        Debounce::new(cfg.debounce()),
        Virsh::new(cfg.controller.as_str()),
    );
    let dispatch_task = {
        let token = token.clone();
        tokio::task::spawn_blocking(move || dispatcher.run(rx, token))
    };
    let refresh_task = tokio::spawn(index::refresh_loop(Arc::clone(&index), cfg.refresh_interval(), token.clone()));

    /*
     * The raw listener blocks in recv, so it gets a thread of its own instead of a task.
     * It is the only listener that can fail after startup.
     */
    let raw_task = raw.map(|listener| {
        let (tx, token) = (tx.clone(), token.clone());
        tokio::task::spawn_blocking(move || listener.run(tx, token))
    });
    drop(tx);

    log::info!("wol-wake running: iface={} ports={:?} allow={:?} debounce={}s",
        cfg.interface, cfg.layer4.ports, cfg.allow_subnets, cfg.debounce_secs);

    let raw_result = match raw_task {
        Some(mut task) => tokio::select! {
            _ = token.cancelled() => task.await,
            res = &mut task => res,
        },
        None => {
            token.cancelled().await;
            Ok(Ok(()))
        },
    };

    // whatever ended the wait, every task has to stop now
    token.cancel();

    udp.join().await;
    if let Err(e) = refresh_task.await {
        log::error!("index refresh task failed: {}", e);
    }
    if let Err(e) = dispatch_task.await {
        log::error!("dispatch task failed: {}", e);
    }
    log::info!("all listeners stopped");

    match raw_result {
        Ok(res) => res.context("raw listener failed"),
        Err(e) => Err(anyhow!("raw listener panicked: {e}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose)?;

    let cfg = load_config(&cli)?;
    if !cfg.enabled && !cli.force {
        log::info!("disabled in configuration, exiting");
        return Ok(());
    }

    let cancel_token = CancellationToken::new();
    let sigint_token = cancel_token.clone();

    ctrlc::set_handler(move || {
        log::info!("received termination signal");
        sigint_token.cancel();
    }).context("failed to install signal handler")?;

    run(cfg, cancel_token).await
}
