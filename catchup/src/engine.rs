//! Wires the components together in the exact phase order of `spec.md`
//! §2: `1→2→3/4 (parallel) → 6-start → 5 + 7 + 8 → 9 → 6-stop → 7-wait →
//! 10`. This is the only module that calls more than one component; every
//! other module is independently testable against the session fakes.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use postgres_ffi::pg_constants::PG_CONTROL_FILE;
use utils::lsn::Lsn;

use crate::backup_window;
use crate::change_map;
use crate::config::{Config, Mode};
use crate::context::RunState;
use crate::error::CatchupResult;
use crate::finalize;
use crate::inventory::{self, FileList};
use crate::preflight;
use crate::probe;
use crate::session::{ReplicationSession, SourceSession};
use crate::tablespace::{self, TablespaceMapping};
use crate::timeline_reconcile;
use crate::transfer::{self, Interrupted};
use crate::wal_streamer;

/// Everything a caller might want after a successful run: the mutated
/// run state and the source file list with its final per-entry claim and
/// size counters, for reporting or tests.
pub struct EngineResult {
    pub run_state: RunState,
    pub source_list: FileList,
}

pub async fn run(config: &Config, source: &dyn SourceSession, replication: &dyn ReplicationSession, interrupted: &Interrupted) -> CatchupResult<EngineResult> {
    // 1. Source Probe
    let probe_result = probe::probe_source(source, &config.source_pgdata).await?;
    let mut run_state = RunState::new(config.mode, chrono::Utc::now(), probe_result.current_timeline);
    info!(mode = ?config.mode, source_timeline = %probe_result.current_timeline, "source probed");

    // 2. Preflight Validator
    let dest_state = preflight::inspect_destination(&config.dest_pgdata)?;
    preflight::validate(config, &probe_result.descriptor, &probe_result, &config.dest_pgdata, &dest_state)?;
    let dest_redo = dest_state.control.as_ref().map(|cf| cf.redo_params());

    // 3/4. Tablespace Resolver and Timeline Reconciler, logically parallel
    let mapping = TablespaceMapping::new(config.tablespace_mappings.clone());
    let locations = tablespace::discover(&config.source_pgdata)?;
    for warning in tablespace::resolve(config.mode, &mapping, &locations, config.remote_source)? {
        warn!("{warning}");
    }
    if let Some(redo) = dest_redo {
        timeline_reconcile::check(replication, probe_result.current_timeline, redo.timeline, redo.redo_lsn).await?;
    }

    // 6-start. Backup-Window Controller, start side
    backup_window::start(source, &mut run_state).await?;
    if let Some(redo) = dest_redo {
        backup_window::check_no_lsn_inversion(redo.redo_lsn, run_state.start_lsn)?;
    }
    let dest_redo_lsn = dest_redo.map(|r| r.redo_lsn).unwrap_or(Lsn::INVALID);

    // 5 + 7 + 8, logically parallel: File Inventory, WAL Streamer start,
    // Change-Map Builder.
    let mut source_list = inventory::walk(&config.source_pgdata)?;
    source_list.sort_by_path();
    transfer::precreate_directories(&config.source_pgdata, &config.dest_pgdata, &source_list, &mapping)?;

    let dest_list = if config.mode.is_incremental() {
        let mut list = inventory::walk(&config.dest_pgdata)?;
        list.sort_by_path();
        Some(list)
    } else {
        None
    };

    wal_streamer::start(replication, &config.dest_pgdata, probe_result.current_timeline, run_state.start_lsn).await?;

    if config.mode == Mode::Ptrack {
        change_map::build(source, dest_redo_lsn, &mut source_list).await?;
    }

    // 9. Transfer Scheduler
    source_list.sort_by_size_desc();
    source_list.remove_path(Utf8Path::new(PG_CONTROL_FILE));
    transfer::warn_if_threads_exceed_files(config.num_threads, source_list.len());
    transfer::run_pool(
        config,
        &config.source_pgdata,
        &config.dest_pgdata,
        &source_list,
        dest_list.as_ref(),
        dest_redo_lsn,
        probe_result.descriptor.checksum_version,
        interrupted,
    )?;

    // 6-stop. Backup-Window Controller, stop side
    let stop_result = backup_window::stop(source, config, &probe_result.descriptor, &mut run_state).await?;

    // 7-wait. WAL Streamer Supervisor waits for the stop LSN, then stops.
    wal_streamer::wait_until_caught_up(replication, run_state.stop_lsn).await?;
    wal_streamer::stop(
        replication,
        &config.dest_pgdata,
        probe_result.current_timeline,
        run_state.start_lsn,
        run_state.stop_lsn,
        probe_result.wal_segment_size,
    )
    .await?;

    // 10. Finalizer. The control file must be the last regular file
    // written (`spec.md` §3, §5), so it is copied only after every other
    // destination mutation — redundant-entry deletion and the backup
    // label — has landed, and before the final fsync pass.
    source_list.sort_by_path();
    if let Some(dest_list) = &dest_list {
        finalize::delete_redundant_entries(&config.dest_pgdata, &source_list, dest_list)?;
    }
    finalize::write_backup_label(&config.dest_pgdata, &stop_result)?;
    finalize::copy_control_file(&config.source_pgdata, &config.dest_pgdata)?;
    finalize::fix_up_minimum_recovery_point(&config.dest_pgdata, probe_result.descriptor.is_replica, run_state.stop_lsn, probe_result.current_timeline)?;
    finalize::fsync_all(config, &config.dest_pgdata, &source_list)?;

    info!(start_lsn = %run_state.start_lsn, stop_lsn = %run_state.stop_lsn, "catchup complete");
    Ok(EngineResult { run_state, source_list })
}

/// Joins the two halves of an absolute destination path split for
/// logging, kept here rather than in `Config` since it is only used to
/// report where WAL landed.
pub fn dest_wal_dir(config: &Config) -> Utf8PathBuf {
    config.dest_pgdata.join(postgres_ffi::pg_constants::PG_WAL_DIR)
}
