//! `dcb-actor` binary
//!
//! Loads the configuration, attaches both controllers and serves commands
//! read line by line from stdin. Replies are written to stdout as
//! `<code> <keywords>`, logs go to stderr.
//!
//! ```bash
//! dcb-actor --config config/dcb.toml
//! echo "filterwheel move linewheel 3" | dcb-actor --simulation
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use dcb_actor::actors::{FilterWheelHandle, SourcesHandle};
use dcb_actor::adapters::{filterwheel_transport, pdu_transport};
use dcb_actor::collimators::Collimators;
use dcb_actor::config::{DcbConfig, Mode};
use dcb_actor::dispatch::Dispatcher;
use dcb_actor::sink::{ChannelSink, CommandSink};
use dcb_actor::store;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dcb-actor")]
#[command(about = "Filter-wheel and calibration-lamp controller", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, default_value = "config/dcb.toml")]
    config: PathBuf,

    /// Run both controllers against in-process simulators
    #[arg(long)]
    simulation: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn init_tracing(level: &str, json: bool) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DcbConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.simulation {
        config.filterwheel.mode = Mode::Simulation;
        config.sources.mode = Mode::Simulation;
    }
    init_tracing(
        &config.application.log_level,
        cli.json || config.application.json_logs,
    );
    info!(
        "{} starting (filterwheel: {}, sources: {})",
        config.application.name,
        config.filterwheel.mode.as_str(),
        config.sources.mode.as_str()
    );

    let store = store::from_config(&config.persistence);
    let filterwheel = FilterWheelHandle::spawn(
        config.filterwheel.clone(),
        filterwheel_transport(&config.filterwheel),
        Arc::clone(&store),
    );
    let sources = SourcesHandle::spawn(config.sources.clone(), pdu_transport(&config.sources));
    let collimators = Collimators::new(Arc::clone(&store), config.collimators.bundle_colors.clone());
    let dispatcher = Dispatcher::new(filterwheel.clone(), sources.clone(), collimators);

    let (sink, mut replies) = ChannelSink::new();
    let sink: Arc<dyn CommandSink> = Arc::new(sink);
    let printer = tokio::spawn(async move {
        while let Some(line) = replies.recv().await {
            println!("{line}");
        }
    });

    // A controller that cannot be reached stays LOADED; `connect` retries.
    if let Err(e) = filterwheel.connect(Arc::clone(&sink)).await {
        warn!("filterwheel not connected: {}", e);
    }
    if let Err(e) = sources.connect(Arc::clone(&sink)).await {
        warn!("sources not connected: {}", e);
    }

    // Each command runs on its own task so `sources abort` is not stuck
    // behind the warm-up it is meant to cut short.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut running = Vec::new();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let dispatcher = dispatcher.clone();
                    let sink = Arc::clone(&sink);
                    running.push(tokio::spawn(async move {
                        dispatcher.dispatch(&line, sink).await;
                    }));
                    running.retain(|task: &tokio::task::JoinHandle<()>| !task.is_finished());
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                sources.abort();
                break;
            }
        }
    }

    for task in running {
        if let Err(e) = task.await {
            warn!("command task ended abnormally: {}", e);
        }
    }
    // Monitor tasks hold the reply sink; stop them before it is closed.
    dispatcher.monitors().stop_all();

    if let Err(e) = sources.shutdown(Arc::clone(&sink)).await {
        warn!("lamp shutdown failed: {}", e);
    }
    filterwheel.stop().await;
    sources.stop().await;

    drop(dispatcher);
    drop(sink);
    printer.await.context("reply printer")?;
    info!("stopped");
    Ok(())
}
