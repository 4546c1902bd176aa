//! The flat configuration record built once from parsed CLI arguments and
//! passed by reference to every phase — no hidden globals (Design Note,
//! `spec.md` §9).

use std::time::Duration;

use camino::Utf8PathBuf;
use postgres_connection::ConnectionOptions;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Full,
    Delta,
    Ptrack,
}

impl Mode {
    pub fn is_incremental(self) -> bool {
        !matches!(self, Mode::Full)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Mode::Full),
            "delta" => Ok(Mode::Delta),
            "ptrack" => Ok(Mode::Ptrack),
            other => Err(format!("unknown mode '{other}', expected full|delta|ptrack")),
        }
    }
}

/// Default bound on the stop-of-backup wait when `archive_timeout` is not
/// configured on the source (`spec.md` §4.5).
pub const DEFAULT_STOP_BACKUP_TIMEOUT: Duration = Duration::from_secs(300);

pub struct Config {
    pub source_pgdata: Utf8PathBuf,
    pub dest_pgdata: Utf8PathBuf,
    pub mode: Mode,
    pub num_threads: usize,
    pub sync_destination: bool,
    pub tablespace_mappings: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    pub archive_timeout: Option<Duration>,
    pub connection: ConnectionOptions,
    /// True when the engine has independent knowledge that source and
    /// destination are on different hosts. Only affects whether an
    /// unmapped tablespace is a warning (remote) or a fatal error
    /// (local) — `spec.md` §4.2.
    pub remote_source: bool,
}

impl Config {
    pub fn stop_backup_timeout(&self) -> Duration {
        self.archive_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_STOP_BACKUP_TIMEOUT)
    }
}
