//! Backup-Window Controller (`spec.md` §4.5): brackets the transfer with
//! the source's start-of-backup and stop-of-backup calls, bounding the
//! stop wait by `archive_timeout` (or a built-in default).

use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::{NodeDescriptor, RunState};
use crate::error::{CatchupError, CatchupResult};
use crate::session::{SourceSession, StopBackupResult};
use utils::lsn::Lsn;

/// Issues start-of-backup and records `start_lsn` on `run_state`.
pub async fn start(session: &dyn SourceSession, run_state: &mut RunState) -> CatchupResult<()> {
    let label = run_state.backup_label_text();
    info!(label = %label, "requesting start of backup");
    let start_lsn = session.start_backup(&label).await?;
    run_state.start_lsn = start_lsn;
    Ok(())
}

/// Optionally issues a named restore point, then stop-of-backup, storing
/// the resulting `stop_lsn` on `run_state`. A restore point is skipped for
/// a replica source, or on 9.5 without elevated privileges (§4.5).
pub async fn stop(
    session: &dyn SourceSession,
    config: &Config,
    source: &NodeDescriptor,
    run_state: &mut RunState,
) -> CatchupResult<StopBackupResult> {
    if should_issue_restore_point(source) {
        let name = format!("pg_catchup_{}", run_state.start_time.timestamp());
        match session.issue_restore_point(&name).await {
            Ok(lsn) => info!(restore_point = %name, lsn = %lsn, "issued restore point"),
            Err(e) => warn!(error = %e, "failed to issue restore point, continuing"),
        }
    }

    let result = timeout(config.stop_backup_timeout(), session.stop_backup())
        .await
        .map_err(|_| CatchupError::DatabaseProtocolFailure("stop-of-backup timed out".into()))??;

    run_state.stop_lsn = result.stop_lsn;
    Ok(result)
}

fn should_issue_restore_point(source: &NodeDescriptor) -> bool {
    if source.is_replica {
        return false;
    }
    if source.server_version_num < 90_600 && !source.has_elevated_rights {
        return false;
    }
    true
}

/// Sanity check applied right after start-of-backup: the newly obtained
/// `start_lsn` must not precede the destination's existing redo point,
/// or the destination would be asked to roll forward through a gap it
/// cannot cover (`spec.md` §7 LsnInversion).
pub fn check_no_lsn_inversion(dest_redo_lsn: Lsn, start_lsn: Lsn) -> CatchupResult<()> {
    if dest_redo_lsn > start_lsn {
        return Err(CatchupError::LsnInversion {
            dest_redo_lsn: dest_redo_lsn.to_string(),
            start_lsn: start_lsn.to_string(),
        });
    }
    Ok(())
}
