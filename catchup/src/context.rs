//! The data model of `spec.md` §3 that exists for the lifetime of one
//! catchup invocation: the per-endpoint node descriptor and the run-wide
//! state record. Passed by reference, never read from a global.

use chrono::{DateTime, Utc};
use utils::id::{SystemId, TimelineId};
use utils::lsn::Lsn;

use crate::config::Mode;

/// Per-endpoint record, populated by the Source Probe for the source and
/// by reading the destination's control file for the destination.
#[derive(Clone, Debug, Default)]
pub struct NodeDescriptor {
    pub server_version_num: u32,
    pub server_version_str: String,
    pub is_replica: bool,
    pub has_elevated_rights: bool,
    pub ptrack_version: Option<(u32, u32)>,
    pub ptrack_enabled: bool,
    pub checksum_version: u32,
    pub ptrack_schema: Option<String>,
    pub system_identifier: SystemId,
}

impl NodeDescriptor {
    /// PTRACK capability requires version >= 2.0 and the extension enabled
    /// (`spec.md` §4.1).
    pub fn ptrack_usable(&self) -> bool {
        self.ptrack_enabled && matches!(self.ptrack_version, Some((major, _)) if major >= 2)
    }

    /// A replica source only supports non-exclusive backup mode, which
    /// requires server >= 9.6 (`spec.md` §4.1). We track this as a simple
    /// numeric floor on `server_version_num`, in the `X0Y00` style
    /// PostgreSQL itself has used historically.
    pub fn supports_non_exclusive_backup(&self) -> bool {
        self.server_version_num >= 90600
    }
}

/// Process-wide record of one catchup invocation (`spec.md` §3 "Run
/// state"). Created by the Source Probe, mutated by the Backup-Window
/// Controller and Finalizer.
#[derive(Debug)]
pub struct RunState {
    pub mode: Mode,
    pub start_time: DateTime<Utc>,
    pub program_version: &'static str,
    pub source_timeline: TimelineId,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub recovery_time: Option<DateTime<Utc>>,
    pub recovery_txid: Option<u64>,
    pub bytes_announced: u64,
}

impl RunState {
    pub fn new(mode: Mode, start_time: DateTime<Utc>, source_timeline: TimelineId) -> Self {
        RunState {
            mode,
            start_time,
            program_version: env!("CARGO_PKG_VERSION"),
            source_timeline,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            recovery_time: None,
            recovery_txid: None,
            bytes_announced: 0,
        }
    }

    /// Human-readable label used on the start-of-backup request
    /// (`spec.md` §4.5).
    pub fn backup_label_text(&self) -> String {
        format!(
            "pg_catchup backup, started at {}",
            self.start_time.to_rfc3339()
        )
    }
}
