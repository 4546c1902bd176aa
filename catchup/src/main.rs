//! Operator entry point: parses arguments, opens the two database
//! sessions the engine needs, and maps a fatal error to a process exit
//! code (`spec.md` §6).

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use pg_catchup::cli::{Cli, Command};
use pg_catchup::config::Config;
use pg_catchup::engine;
use pg_catchup::error::CatchupError;
use pg_catchup::pg_session::{connect_replication, connect_source};
use pg_catchup::session::SourceSession;
use pg_catchup::transfer::Interrupted;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = utils::logging::init("info") {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();
    let Command::Catchup(args) = cli.command;
    let config: Config = args.into();

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "catchup failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(config: &Config) -> Result<(), CatchupError> {
    let source = connect_source(&config.connection).await?;

    // The replication session needs the WAL segment size up front, before
    // the engine's own source probe runs; a cheap direct query here avoids
    // reshaping `engine::run`'s signature around a two-phase probe.
    let wal_seg_size = source.wal_segment_size().await?;
    let dest_wal_dir = engine::dest_wal_dir(config);
    let replication = connect_replication(&config.connection, dest_wal_dir, wal_seg_size).await?;

    // spec.md §5: "a process-wide interrupted flag (set by signal)" that
    // the worker pool samples per file. SIGINT and SIGTERM both set it;
    // the run itself is not cancelled out from under it, so in-flight
    // file copies finish before the pool notices and aborts.
    let interrupted = Arc::new(Interrupted::default());
    tokio::spawn({
        let interrupted = interrupted.clone();
        async move {
            wait_for_shutdown_signal().await;
            tracing::warn!("shutdown signal received, aborting after the in-flight file");
            interrupted.set();
        }
    });

    let result = engine::run(config, &source, &replication, &interrupted).await?;

    tracing::info!(
        start_lsn = %result.run_state.start_lsn,
        stop_lsn = %result.run_state.stop_lsn,
        files = result.source_list.len(),
        "catchup finished"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
