//! Trait seams for the two kinds of source connections the spec calls for
//! (`spec.md` §6): an ordinary session for identity/backup/ptrack calls,
//! and a replication-protocol session for timeline history and WAL
//! streaming. Kept as traits — rather than a concrete `tokio_postgres`
//! client threaded everywhere — so the engine can be driven against a
//! fake in unit tests, the way the teacher's `RemoteStorage` trait lets
//! its callers run against a `LocalFs` backend in tests instead of S3.

use async_trait::async_trait;
use utils::id::TimelineId;
use utils::lsn::Lsn;

use crate::error::CatchupResult;

/// Capability flags and identity reported by the source's block-change
/// tracking extension.
#[derive(Clone, Debug, Default)]
pub struct PtrackInfo {
    pub version: Option<(u32, u32)>,
    pub enabled: bool,
    pub schema: Option<String>,
}

/// Everything the Source Probe, Preflight Validator, Backup-Window
/// Controller, and Change-Map Builder need from an ordinary session.
#[async_trait]
pub trait SourceSession: Send + Sync {
    async fn server_version(&self) -> CatchupResult<(u32, String)>;
    async fn is_replica(&self) -> CatchupResult<bool>;
    async fn has_elevated_rights(&self) -> CatchupResult<bool>;
    async fn system_identifier(&self) -> CatchupResult<u64>;
    async fn current_timeline(&self) -> CatchupResult<TimelineId>;
    async fn wal_segment_size(&self) -> CatchupResult<u64>;
    async fn checksum_version(&self) -> CatchupResult<u32>;
    async fn ptrack_info(&self) -> CatchupResult<PtrackInfo>;
    async fn ptrack_lsn_since(&self, dest_redo_lsn: Lsn) -> CatchupResult<Lsn>;

    async fn start_backup(&self, label: &str) -> CatchupResult<Lsn>;
    async fn stop_backup(&self) -> CatchupResult<StopBackupResult>;
    /// Skipped entirely when the source is a replica, or on 9.5 without
    /// elevated privileges (`spec.md` §4.5).
    async fn issue_restore_point(&self, name: &str) -> CatchupResult<Lsn>;
}

#[derive(Clone, Debug)]
pub struct StopBackupResult {
    pub backup_label: String,
    pub tablespace_map: String,
    pub snapshot_txid: u64,
    pub invocation_time: chrono::DateTime<chrono::Utc>,
    pub stop_lsn: Lsn,
}

/// What the WAL Streamer Supervisor and Timeline Reconciler need from a
/// `replication=database` session.
#[async_trait]
pub trait ReplicationSession: Send + Sync {
    async fn timeline_history(&self, tli: TimelineId) -> CatchupResult<String>;

    /// Streams WAL starting at `start_lsn` on `timeline` into `dest_wal_dir`
    /// until cancelled; returns the highest LSN durably flushed so far
    /// whenever polled via [`ReplicationSession::flushed_lsn`].
    async fn start_streaming(&self, timeline: TimelineId, start_lsn: Lsn) -> CatchupResult<()>;
    async fn flushed_lsn(&self) -> CatchupResult<Lsn>;
    async fn stop_streaming(&self) -> CatchupResult<()>;
}
