use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use crate::output::OutputMode;

#[derive(Parser, Debug)]
#[command(
    name = "inoflow",
    version,
    disable_version_flag = true,
    about = "Aggregated per-process file activity telemetry",
    long_about = "Observes filesystem notifications, aggregates all activity on a \
                  (process, file) pair into a single enriched record and exports the \
                  record as json once the operation is finished."
)]
pub struct Args {
    /// Max number of filesystem events per aggregated record until export
    /// (0: until the operation finishes, 1: no aggregation)
    #[arg(short, long, default_value_t = 0)]
    pub events: u32,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    pub output: OutputMode,

    /// Unix domain socket path to send json output to
    #[arg(short = 'x', long = "socket")]
    pub socket: Option<PathBuf>,

    /// Suppress record output on the console
    #[arg(short, long)]
    pub quiet: bool,

    /// Run in the background
    #[arg(short, long)]
    pub daemon: bool,

    /// Verbose logging
    #[arg(short = 'V', long)]
    pub verbose: bool,

    /// Print version and exit
    #[arg(long, action = clap::ArgAction::Version)]
    pub version: Option<bool>,

    /// File containing allowed path prefixes, one per line; without it
    /// every path is exported
    #[arg(short = 'p', long = "paths")]
    pub paths: Option<PathBuf>,

    /// Directory tree to watch, repeatable; without it the whole mount
    /// namespace is watched
    #[arg(short = 'w', long = "watch")]
    pub watch: Vec<PathBuf>,

    /// Show the legend of exported keys and exit
    #[arg(short, long)]
    pub legend: bool,
}

pub fn validate(args: &Args) -> Result<()> {
    if (args.daemon || args.quiet) && args.socket.is_none() {
        bail!("option --daemon or --quiet requires --socket");
    }
    Ok(())
}

pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default)).init();
}

pub fn check_permission() -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        bail!("inoflow must run as root to install filesystem notification marks");
    }
    Ok(())
}

/// Whether records are printed to the console at all, given daemon and
/// socket settings.
pub fn console_enabled(args: &Args) -> bool {
    if args.daemon {
        return false;
    }
    !(args.socket.is_some() && args.quiet)
}

pub fn log_configuration(args: &Args, prefixes: usize, channel_capacity: usize) {
    info!("aggregating by pid+inode until the file operation finishes");
    match args.events {
        0 => {}
        1 => info!("aggregation disabled, every event exports its own record"),
        n => info!("aggregation capped at {n} events per record"),
    }
    match args.paths {
        Some(ref p) => info!("path filtering enabled with {prefixes} prefixes from {}", p.display()),
        None => info!("path filtering disabled, all paths exported"),
    }
    if args.watch.is_empty() {
        info!("watching the whole mount namespace");
    } else {
        for root in &args.watch {
            info!("watching directory tree {}", root.display());
        }
    }
    if let Some(ref path) = args.socket {
        info!("sending records to unix socket {}", path.display());
    }
    info!(
        "emission channel holds up to {channel_capacity} records, output as {}",
        match args.output {
            OutputMode::Json => "json",
            OutputMode::JsonMin => "json-min",
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_and_quiet_require_a_socket() {
        let args = Args::parse_from(["inoflow", "-d"]);
        assert!(validate(&args).is_err());
        let args = Args::parse_from(["inoflow", "-q"]);
        assert!(validate(&args).is_err());
        let args = Args::parse_from(["inoflow", "-q", "-x", "/tmp/s.sock"]);
        assert!(validate(&args).is_ok());
    }

    #[test]
    fn console_follows_daemon_and_quiet() {
        let args = Args::parse_from(["inoflow"]);
        assert!(console_enabled(&args));
        let args = Args::parse_from(["inoflow", "-x", "/tmp/s.sock"]);
        assert!(console_enabled(&args));
        let args = Args::parse_from(["inoflow", "-x", "/tmp/s.sock", "-q"]);
        assert!(!console_enabled(&args));
        let args = Args::parse_from(["inoflow", "-x", "/tmp/s.sock", "-d"]);
        assert!(!console_enabled(&args));
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let args = Args::parse_from(["inoflow"]);
        assert_eq!(args.events, 0);
        assert_eq!(args.output, OutputMode::Json);
        assert!(args.watch.is_empty());
        assert!(args.paths.is_none());
    }
}
