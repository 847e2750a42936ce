use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use inoflow::channel::{emission_channel, Stats};
use inoflow::consumer;
use inoflow::engine::{Engine, EngineConfig};
use inoflow::filter::PathFilter;
use inoflow::hook::FanotifySource;
use inoflow::output::{self, Output};
use inoflow::setup::{self, Args};
use inoflow::store::AggregateStore;
use inoflow_common::STORE_RECORDS_MAX;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.legend {
        output::print_legend();
        return Ok(());
    }
    setup::validate(&args)?;
    setup::init_logging(args.verbose);
    // Fork before any thread or the runtime exists.
    if args.daemon {
        nix::unistd::daemon(true, true).context("failed to daemonize")?;
    }
    run(args)
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    setup::check_permission()?;

    let filter = match args.paths {
        Some(ref path) => {
            PathFilter::load(path).context("failed to load the allowed paths file")?
        }
        None => PathFilter::permit_all(),
    };
    let prefixes = filter.len();

    let stats = Arc::new(Stats::new());
    let (tx, rx) = emission_channel();
    let channel_capacity = tx.capacity();
    let engine = Arc::new(Engine::new(
        EngineConfig { self_pid: process::id(), agg_events_max: args.events },
        filter,
        AggregateStore::with_capacity(STORE_RECORDS_MAX),
        tx,
        stats.clone(),
    ));

    let output = Output::new(args.output, args.socket.as_deref(), setup::console_enabled(&args))
        .context("failed to set up record output")?;

    // All hooks must be in place before any event processing begins.
    let source =
        FanotifySource::new(&args.watch).context("failed to attach filesystem notifications")?;

    setup::log_configuration(&args, prefixes, channel_capacity);
    info!("inoflow started with pid {}", process::id());

    let shutdown = Arc::new(AtomicBool::new(false));
    let consumer = {
        let shutdown = shutdown.clone();
        thread::spawn(move || consumer::run(rx, &output, &shutdown))
    };
    let producer = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || source.run(&engine, &shutdown))
    };

    let health = {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
            tick.tick().await;
            loop {
                tick.tick().await;
                let s = stats.snapshot();
                log::debug!(
                    "health: {} opened, {} closed, {} dropped, {} evicted",
                    s.opened,
                    s.closed,
                    s.dropped,
                    s.evicted
                );
            }
        })
    };

    wait_for_signal().await?;
    info!("shutting down");
    health.abort();
    shutdown.store(true, Ordering::Relaxed);
    if producer.join().is_err() {
        error!("notification reader ended abnormally");
    }
    if consumer.join().is_err() {
        error!("consumer ended abnormally");
    }

    let snap = stats.snapshot();
    info!(
        "aggregates: {} opened, {} closed, {} dropped, {} evicted; {} events; channel capacity {}",
        snap.opened, snap.closed, snap.dropped, snap.evicted, snap.events, snap.channel_capacity
    );
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("failed to install signal handler")?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.context("failed to wait for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}
