//! The fatal error kinds of the catchup engine. Every failure path in the
//! engine returns one of these; nothing is retried automatically and
//! nothing cleans up partial destination state on the way out.

use camino::Utf8PathBuf;

pub type CatchupResult<T> = Result<T, CatchupError>;

#[derive(Debug, thiserror::Error)]
pub enum CatchupError {
    #[error("precondition violation: {0}")]
    PreconditionViolation(String),

    #[error("tablespace mapping error: {0}")]
    MappingError(String),

    #[error("timeline divergence: destination (timeline {dest_tli}, lsn {dest_lsn}) is not reachable from source history")]
    TimelineDivergence { dest_tli: u32, dest_lsn: String },

    #[error("block tracking is stale: ptrack_lsn {ptrack_lsn} exceeds destination redo lsn {dest_redo_lsn}; re-run in FULL mode")]
    BlockTrackingStale { ptrack_lsn: String, dest_redo_lsn: String },

    #[error("destination redo lsn {dest_redo_lsn} exceeds newly obtained start lsn {start_lsn}")]
    LsnInversion { dest_redo_lsn: String, start_lsn: String },

    #[error("io failure on {path}: {source}")]
    IoFailure { path: Utf8PathBuf, #[source] source: std::io::Error },

    #[error("wal streaming failure: {0}")]
    StreamingFailure(String),

    #[error("database protocol failure: {0}")]
    DatabaseProtocolFailure(String),

    #[error("interrupted")]
    Interrupted,
}

impl CatchupError {
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        CatchupError::IoFailure { path: path.into(), source }
    }

    /// Process exit code for this error kind (`spec.md` §6: any fatal
    /// condition exits non-zero).
    pub fn exit_code(&self) -> i32 {
        1
    }
}
