use axonkeep::{context::AppContext, paths::KeeperPaths, rpc};
use clap::{Parser, Subcommand};
use eyre::Context as _;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "axonkeep", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: the trusted control surface on stdio plus the local
    /// dApp relay socket.
    Serve {
        /// Connect to this network id at startup instead of the configured
        /// default.
        #[arg(long)]
        network: Option<String>,

        /// Skip the startup chain connection (connect later via
        /// `network:connect`).
        #[arg(long, default_value_t = false)]
        offline: bool,
    },

    /// Print resolved paths (useful for debugging).
    Paths,

    /// Print a quick self-diagnostic report (safe to paste; contains no
    /// secrets).
    Doctor {
        /// Emit JSON to stdout (machine-readable).
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn init_logging(paths: &KeeperPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("axonkeep.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // stderr only: stdout carries the control-surface frames.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

async fn serve(network: Option<String>, offline: bool) -> eyre::Result<()> {
    let paths = KeeperPaths::discover()?;
    let ctx = AppContext::new(paths)?;

    if !offline {
        let target = network.unwrap_or_else(|| ctx.config.default_network.clone());
        // Startup connectivity is best-effort; the reconnect scheduler and
        // explicit network:connect cover the rest.
        if let Err(e) = ctx.chain.connect(&target, None).await {
            warn!(network = %target, error = %e, "startup connect failed");
        }
    }

    let relay_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        if let Err(e) = rpc::dapp::run_relay(relay_ctx).await {
            warn!(error = %e, "relay listener exited");
        }
    });

    rpc::server::run(ctx).await.context("control surface failed")
}

fn print_paths(paths: &KeeperPaths) -> eyre::Result<()> {
    use std::io::Write as _;
    let s = serde_json::to_string(&serde_json::json!({
        "config_dir": paths.config_dir,
        "data_dir": paths.data_dir,
        "log_file": paths.log_file,
    }))
    .context("serialize paths")?;
    writeln!(std::io::stdout().lock(), "{s}").context("write paths")?;
    Ok(())
}

fn doctor(paths: &KeeperPaths, json: bool) -> eyre::Result<()> {
    use std::io::Write as _;
    let report = serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "paths": {
            "config_dir": paths.config_dir,
            "data_dir": paths.data_dir,
        },
        "config_present": paths.config_dir.join("config.toml").exists(),
        "vault_present": paths.config_dir.join("vault.json").exists(),
    });
    let out = if json {
        serde_json::to_string(&report).context("serialize report")?
    } else {
        serde_json::to_string_pretty(&report).context("serialize report")?
    };
    writeln!(std::io::stdout().lock(), "{out}").context("write report")?;
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = KeeperPaths::discover()?;
    std::fs::create_dir_all(&paths.data_dir).context("create data dir")?;
    let _log_guard = init_logging(&paths);

    match cli.cmd {
        Command::Serve { network, offline } => serve(network, offline).await,
        Command::Paths => print_paths(&paths),
        Command::Doctor { json } => doctor(&paths, json),
    }
}
