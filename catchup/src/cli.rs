//! Operator surface (`spec.md` §6): a single `catchup` subcommand, built
//! with `clap`'s derive API in the teacher's style (see `compute_ctl`'s use
//! of `clap::Arg` for the equivalent top-level binary).

use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::config::{Config, Mode};
use postgres_connection::ConnectionOptions;

#[derive(Parser)]
#[command(name = "pg_catchup", about = "Incremental PostgreSQL data directory catchup")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Synchronize a destination data directory from a running source.
    Catchup(CatchupArgs),
}

#[derive(Parser)]
pub struct CatchupArgs {
    #[arg(long)]
    pub source_pgdata: Utf8PathBuf,

    #[arg(long)]
    pub dest_pgdata: Utf8PathBuf,

    #[arg(long, default_value = "delta")]
    pub mode: Mode,

    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    #[arg(long)]
    pub no_sync: bool,

    #[arg(long = "tablespace-map", value_parser = parse_tablespace_mapping)]
    pub tablespace_mappings: Vec<(Utf8PathBuf, Utf8PathBuf)>,

    #[arg(long)]
    pub archive_timeout: Option<u64>,

    #[arg(long)]
    pub remote_source: bool,

    #[arg(long, default_value = "localhost")]
    pub host: String,

    #[arg(long, default_value_t = 5432)]
    pub port: u16,

    #[arg(long, default_value = "postgres")]
    pub dbname: String,

    #[arg(long, default_value = "postgres")]
    pub user: String,
}

fn parse_tablespace_mapping(s: &str) -> Result<(Utf8PathBuf, Utf8PathBuf), String> {
    let (src, dst) = s
        .split_once('=')
        .ok_or_else(|| format!("malformed tablespace mapping '{s}', expected SRC=DST"))?;
    Ok((Utf8PathBuf::from(src), Utf8PathBuf::from(dst)))
}

impl From<CatchupArgs> for Config {
    fn from(args: CatchupArgs) -> Self {
        Config {
            source_pgdata: args.source_pgdata,
            dest_pgdata: args.dest_pgdata,
            mode: args.mode,
            num_threads: args.threads.max(1),
            sync_destination: !args.no_sync,
            tablespace_mappings: args.tablespace_mappings,
            archive_timeout: args.archive_timeout.map(Duration::from_secs),
            connection: ConnectionOptions::new(args.host, args.port, args.dbname, args.user),
            remote_source: args.remote_source,
        }
    }
}
