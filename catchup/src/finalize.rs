//! Finalizer (`spec.md` §4.9, §4.10): the last phase. Copies the control
//! file last, deletes destination-only entries, writes the backup label,
//! fixes up the minimum recovery point for a replica source, and fsyncs.

use camino::Utf8Path;
use tracing::info;

use postgres_ffi::controlfile::ControlFileData;
use postgres_ffi::pg_constants::{BACKUP_LABEL_FILE, PG_CONTROL_FILE, RELATION_MAP_FILE};

use crate::config::Config;
use crate::error::{CatchupError, CatchupResult};
use crate::inventory::{EntryKind, FileEntry, FileList};
use crate::session::StopBackupResult;
use utils::lsn::Lsn;

/// Step 3: copies the control file, the one file never dispatched to the
/// worker pool. Must run after every other regular file has landed,
/// including the redundant-entry deletion pass and the backup label, so
/// it is the last regular file written.
pub fn copy_control_file(source_pgdata: &Utf8Path, dest_pgdata: &Utf8Path) -> CatchupResult<()> {
    let source_path = source_pgdata.join(PG_CONTROL_FILE);
    let dest_path = dest_pgdata.join(PG_CONTROL_FILE);
    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CatchupError::io(parent, e))?;
    }
    std::fs::copy(source_path.as_std_path(), dest_path.as_std_path()).map_err(|e| CatchupError::io(&dest_path, e))?;
    Ok(())
}

/// Step 1 / §4.10: deletes every destination entry absent from the
/// source, plus the relation-map file unconditionally — the source
/// treats it as "always redundant" regardless of apparent staleness, so
/// it is force-deleted here even when a same-named entry exists in
/// `source_list`. Nothing in this pass re-creates it; the file only
/// survives if the regular Transfer Scheduler copied it earlier in the
/// same run (see `DESIGN.md`, a known quirk preserved rather than fixed).
pub fn delete_redundant_entries(dest_pgdata: &Utf8Path, source_list: &FileList, dest_list: &FileList) -> CatchupResult<()> {
    let mut dest_entries: Vec<&FileEntry> = dest_list.entries().iter().collect();
    dest_entries.sort_by(|a, b| b.rel_path.cmp(&a.rel_path));

    for entry in dest_entries {
        let is_relation_map = entry.rel_path.as_str() == RELATION_MAP_FILE;
        if !is_relation_map && source_list.find_by_path(&entry.rel_path).is_some() {
            continue;
        }

        let path = dest_pgdata.join(&entry.rel_path);
        match entry.kind {
            EntryKind::Directory => {
                match std::fs::remove_dir(path.as_std_path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) if is_dir_not_empty(&e) => {
                        info!(path = %entry.rel_path, "keeping non-empty directory absent from source");
                    }
                    Err(e) => return Err(CatchupError::io(&path, e)),
                }
            }
            EntryKind::Regular | EntryKind::Symlink => match std::fs::remove_file(path.as_std_path()) {
                Ok(()) => info!(path = %entry.rel_path, "deleted, absent from source"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CatchupError::io(&path, e)),
            },
        }
    }
    Ok(())
}

fn is_dir_not_empty(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == libc_enotempty())
}

/// `ENOTEMPTY` is 39 on Linux; avoids pulling in the `libc` crate for one
/// constant.
fn libc_enotempty() -> i32 {
    39
}

/// Step 2: writes `backup_label` with the text from stop-of-backup. The
/// tablespace-map text is intentionally discarded (Open Question,
/// `spec.md` §9): the symlinks are already materialized on disk by the
/// Transfer Scheduler's directory pre-creation pass.
pub fn write_backup_label(dest_pgdata: &Utf8Path, stop_result: &StopBackupResult) -> CatchupResult<()> {
    let path = dest_pgdata.join(BACKUP_LABEL_FILE);
    std::fs::write(path.as_std_path(), &stop_result.backup_label).map_err(|e| CatchupError::io(&path, e))
}

/// Step 4: on a replica source, the destination's minimum recovery point
/// must equal `stop_lsn` so recovery knows where consistency is reached.
pub fn fix_up_minimum_recovery_point(dest_pgdata: &Utf8Path, source_is_replica: bool, stop_lsn: Lsn, dest_timeline: utils::id::TimelineId) -> CatchupResult<()> {
    if !source_is_replica {
        return Ok(());
    }
    let path = dest_pgdata.join(PG_CONTROL_FILE);
    let mut cf = ControlFileData::read_from(path.as_std_path())
        .map_err(|e| CatchupError::PreconditionViolation(format!("reading {path} after copy: {e}")))?;
    cf.min_recovery_point = stop_lsn;
    cf.min_recovery_point_tli = dest_timeline;
    cf.write_to(path.as_std_path()).map_err(|e| CatchupError::PreconditionViolation(format!("writing {path}: {e}")))
}

/// Step 5: unless the operator disabled it, fsyncs every non-directory
/// file in the source list, then the control file, in that order.
pub fn fsync_all(config: &Config, dest_pgdata: &Utf8Path, source_list: &FileList) -> CatchupResult<()> {
    if !config.sync_destination {
        return Ok(());
    }
    for entry in source_list.entries() {
        if entry.kind != EntryKind::Regular {
            continue;
        }
        let path = dest_pgdata.join(&entry.rel_path);
        fsync_path(&path)?;
    }
    fsync_path(&dest_pgdata.join(PG_CONTROL_FILE))
}

fn fsync_path(path: &Utf8Path) -> CatchupResult<()> {
    match std::fs::File::open(path.as_std_path()) {
        Ok(f) => f.sync_all().map_err(|e| CatchupError::io(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CatchupError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::inventory::FileEntry;
    use chrono::Utc;
    use utils::id::TimelineId;

    fn config() -> Config {
        Config {
            source_pgdata: "/src".into(),
            dest_pgdata: "/dst".into(),
            mode: Mode::Delta,
            num_threads: 1,
            sync_destination: true,
            tablespace_mappings: Vec::new(),
            archive_timeout: None,
            connection: postgres_connection::ConnectionOptions::new("localhost", 5432, "postgres", "postgres"),
            remote_source: false,
        }
    }

    #[test]
    fn copies_control_file_from_source_to_destination() {
        let src = camino_tempfile::tempdir().unwrap();
        let dst = camino_tempfile::tempdir().unwrap();
        crate::test_support::build_fake_pgdata(src.path(), 42);

        copy_control_file(src.path(), dst.path()).unwrap();
        let cf = ControlFileData::read_from(dst.path().join(PG_CONTROL_FILE).as_std_path()).unwrap();
        assert_eq!(cf.system_identifier.0, 42);
    }

    #[test]
    fn deletes_destination_only_entries_and_force_deletes_relation_map() {
        let dst = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dst.path().join("base/1")).unwrap();
        std::fs::write(dst.path().join("base/1/99999"), b"stale").unwrap();
        std::fs::create_dir_all(dst.path().join("global")).unwrap();
        std::fs::write(dst.path().join(RELATION_MAP_FILE), b"current").unwrap();

        let source_list = FileList::from_entries(vec![FileEntry::new(RELATION_MAP_FILE.into(), EntryKind::Regular, 7)]);
        let dest_list = FileList::from_entries(vec![
            FileEntry::new("base/1/99999".into(), EntryKind::Regular, 5),
            FileEntry::new(RELATION_MAP_FILE.into(), EntryKind::Regular, 9),
        ]);

        delete_redundant_entries(dst.path(), &source_list, &dest_list).unwrap();
        assert!(!dst.path().join("base/1/99999").as_std_path().exists());
        assert!(!dst.path().join(RELATION_MAP_FILE).as_std_path().exists());
    }

    #[test]
    fn writes_backup_label_verbatim() {
        let dst = camino_tempfile::tempdir().unwrap();
        let stop_result = StopBackupResult {
            backup_label: "START WAL LOCATION: 0/3000028\n".to_string(),
            tablespace_map: "ignored".to_string(),
            snapshot_txid: 1,
            invocation_time: Utc::now(),
            stop_lsn: Lsn(0x3000200),
        };
        write_backup_label(dst.path(), &stop_result).unwrap();
        let contents = std::fs::read_to_string(dst.path().join(BACKUP_LABEL_FILE)).unwrap();
        assert_eq!(contents, stop_result.backup_label);
    }

    #[test]
    fn fixes_up_minimum_recovery_point_only_for_replica_sources() {
        let dst = camino_tempfile::tempdir().unwrap();
        crate::test_support::build_fake_pgdata(dst.path(), 1);

        fix_up_minimum_recovery_point(dst.path(), false, Lsn(0x4000000), TimelineId(1)).unwrap();
        let cf = ControlFileData::read_from(dst.path().join(PG_CONTROL_FILE).as_std_path()).unwrap();
        assert_eq!(cf.min_recovery_point, Lsn::INVALID);

        fix_up_minimum_recovery_point(dst.path(), true, Lsn(0x4000000), TimelineId(1)).unwrap();
        let cf = ControlFileData::read_from(dst.path().join(PG_CONTROL_FILE).as_std_path()).unwrap();
        assert_eq!(cf.min_recovery_point, Lsn(0x4000000));
    }

    #[test]
    fn fsync_pass_skips_when_sync_disabled() {
        let mut cfg = config();
        cfg.sync_destination = false;
        let dst = camino_tempfile::tempdir().unwrap();
        fsync_all(&cfg, dst.path(), &FileList::from_entries(vec![])).unwrap();
    }
}
