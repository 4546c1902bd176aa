//! Fakes shared by the unit tests of the individual catchup components.
//! There is no real `postgres` server available in this workspace's test
//! environment, so the pipeline logic is exercised against these in lieu
//! of a live source.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use camino::Utf8Path;
use chrono::Utc;
use postgres_ffi::controlfile::{ControlFileData, DbState};
use postgres_ffi::pg_constants::PG_CONTROL_FILE;
use utils::id::{SystemId, TimelineId};
use utils::lsn::Lsn;

use crate::error::{CatchupError, CatchupResult};
use crate::session::{PtrackInfo, ReplicationSession, SourceSession, StopBackupResult};

pub const DEFAULT_SYSTEM_IDENTIFIER: u64 = 0x1234_5678_9abc_def0;

pub struct FakeSourceSession {
    pub system_identifier_value: u64,
    pub current_timeline_value: TimelineId,
    pub is_replica_value: bool,
    pub has_elevated_rights_value: bool,
    pub wal_segment_size_value: u64,
    pub server_version_value: (u32, String),
    pub ptrack: PtrackInfo,
    pub ptrack_lsn: Lsn,
    pub start_lsn: Lsn,
    pub stop_result: StopBackupResult,
}

impl Default for FakeSourceSession {
    fn default() -> Self {
        FakeSourceSession {
            system_identifier_value: DEFAULT_SYSTEM_IDENTIFIER,
            current_timeline_value: TimelineId(1),
            is_replica_value: false,
            has_elevated_rights_value: true,
            wal_segment_size_value: postgres_ffi::pg_constants::DEFAULT_WAL_SEGMENT_SIZE,
            server_version_value: (160_000, "16.0".to_string()),
            ptrack: PtrackInfo::default(),
            ptrack_lsn: Lsn::INVALID,
            start_lsn: Lsn(0x3000028),
            stop_result: StopBackupResult {
                backup_label: "START WAL LOCATION: 0/3000028\n".to_string(),
                tablespace_map: String::new(),
                snapshot_txid: 100,
                invocation_time: Utc::now(),
                stop_lsn: Lsn(0x3000200),
            },
        }
    }
}

#[async_trait]
impl SourceSession for FakeSourceSession {
    async fn server_version(&self) -> CatchupResult<(u32, String)> {
        Ok(self.server_version_value.clone())
    }

    async fn is_replica(&self) -> CatchupResult<bool> {
        Ok(self.is_replica_value)
    }

    async fn has_elevated_rights(&self) -> CatchupResult<bool> {
        Ok(self.has_elevated_rights_value)
    }

    async fn system_identifier(&self) -> CatchupResult<u64> {
        Ok(self.system_identifier_value)
    }

    async fn current_timeline(&self) -> CatchupResult<TimelineId> {
        Ok(self.current_timeline_value)
    }

    async fn wal_segment_size(&self) -> CatchupResult<u64> {
        Ok(self.wal_segment_size_value)
    }

    async fn checksum_version(&self) -> CatchupResult<u32> {
        Ok(1)
    }

    async fn ptrack_info(&self) -> CatchupResult<PtrackInfo> {
        Ok(self.ptrack.clone())
    }

    async fn ptrack_lsn_since(&self, _dest_redo_lsn: Lsn) -> CatchupResult<Lsn> {
        Ok(self.ptrack_lsn)
    }

    async fn start_backup(&self, _label: &str) -> CatchupResult<Lsn> {
        Ok(self.start_lsn)
    }

    async fn stop_backup(&self) -> CatchupResult<StopBackupResult> {
        Ok(self.stop_result.clone())
    }

    async fn issue_restore_point(&self, _name: &str) -> CatchupResult<Lsn> {
        Ok(self.stop_result.stop_lsn)
    }
}

pub struct FakeReplicationSession {
    pub history_text: String,
    pub flushed: Mutex<Lsn>,
    pub fail_stream: bool,
}

impl Default for FakeReplicationSession {
    fn default() -> Self {
        FakeReplicationSession {
            history_text: String::new(),
            flushed: Mutex::new(Lsn::INVALID),
            fail_stream: false,
        }
    }
}

#[async_trait]
impl ReplicationSession for FakeReplicationSession {
    async fn timeline_history(&self, _tli: TimelineId) -> CatchupResult<String> {
        Ok(self.history_text.clone())
    }

    async fn start_streaming(&self, _timeline: TimelineId, start_lsn: Lsn) -> CatchupResult<()> {
        if self.fail_stream {
            return Err(CatchupError::StreamingFailure("fake stream start failure".into()));
        }
        *self.flushed.lock().unwrap() = start_lsn;
        Ok(())
    }

    async fn flushed_lsn(&self) -> CatchupResult<Lsn> {
        Ok(*self.flushed.lock().unwrap())
    }

    async fn stop_streaming(&self) -> CatchupResult<()> {
        Ok(())
    }
}

impl FakeReplicationSession {
    /// Advances the simulated flushed LSN straight to `target`, as if
    /// streaming had caught up instantly.
    pub fn advance_to(&self, target: Lsn) {
        *self.flushed.lock().unwrap() = target;
    }
}

pub fn write_control_file(path: &Path, system_identifier: u64) {
    let cf = ControlFileData {
        system_identifier: SystemId(system_identifier),
        state: DbState::ShutdownedClean,
        timeline: TimelineId(1),
        redo_lsn: Lsn(0x2000000),
        prior_checkpoint: Lsn(0x1000000),
        min_recovery_point: Lsn::INVALID,
        min_recovery_point_tli: TimelineId(0),
    };
    cf.write_to(path).unwrap();
}

pub fn write_control_file_full(path: &Path, cf: &ControlFileData) {
    cf.write_to(path).unwrap();
}

/// Builds a tiny fake data directory tree under `root` with the files
/// named in scenario S1: `global/pg_control`, `base/1/1259`,
/// `base/1/2619`.
pub fn build_fake_pgdata(root: &Utf8Path, system_identifier: u64) {
    std::fs::create_dir_all(root.join("global")).unwrap();
    std::fs::create_dir_all(root.join("base/1")).unwrap();
    std::fs::create_dir_all(root.join("pg_wal")).unwrap();
    write_control_file(root.join(PG_CONTROL_FILE).as_std_path(), system_identifier);
    std::fs::write(root.join("base/1/1259"), vec![0u8; 8192]).unwrap();
    std::fs::write(root.join("base/1/2619"), vec![1u8; 8192 * 2]).unwrap();
    std::fs::write(root.join("PG_VERSION"), "16\n").unwrap();
}
