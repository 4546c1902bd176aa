//! Transfer Scheduler (`spec.md` §4.8): the parallel copier. A directory
//! pre-creation pass runs single-threaded, then a fixed worker pool
//! drains the shared, size-descending file list under each entry's
//! atomic claim flag.

use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use postgres_ffi::pg_constants::PG_TBLSPC_DIR;

use crate::config::{Config, Mode};
use crate::copier::data_file::DataFileCopier;
use crate::copier::whole_file::WholeFileCopier;
use crate::copier::{copy_file, CopyParams};
use crate::error::{CatchupError, CatchupResult};
use crate::inventory::{EntryKind, FileEntry, FileList, NOT_FOUND, UNCHANGED};
use crate::tablespace::TablespaceMapping;
use utils::lsn::Lsn;

/// Process-wide cancellation flag sampled inside every worker's per-file
/// loop (`spec.md` §5). A `Default`-constructed flag is never set.
#[derive(Default)]
pub struct Interrupted(AtomicBool);

impl Interrupted {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Single-threaded pass preceding the worker fan-out: creates every
/// directory from the source list (path-sorted, so parents precede
/// children) and materializes tablespace symlinks through the mapping.
pub fn precreate_directories(
    source_pgdata: &Utf8Path,
    dest_pgdata: &Utf8Path,
    source_list: &FileList,
    mapping: &TablespaceMapping,
) -> CatchupResult<()> {
    for entry in source_list.entries() {
        match entry.kind {
            EntryKind::Directory => {
                if is_tablespace_root_child(&entry.rel_path) {
                    continue;
                }
                let dest_dir = dest_pgdata.join(&entry.rel_path);
                std::fs::create_dir_all(&dest_dir).map_err(|e| CatchupError::io(&dest_dir, e))?;
            }
            EntryKind::Symlink if is_tablespace_root_child(&entry.rel_path) => {
                precreate_tablespace_symlink(source_pgdata, dest_pgdata, entry, mapping)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn is_tablespace_root_child(rel_path: &Utf8Path) -> bool {
    rel_path.components().count() == 2 && rel_path.starts_with(PG_TBLSPC_DIR)
}

fn precreate_tablespace_symlink(
    source_pgdata: &Utf8Path,
    dest_pgdata: &Utf8Path,
    entry: &FileEntry,
    mapping: &TablespaceMapping,
) -> CatchupResult<()> {
    let source_link = source_pgdata.join(&entry.rel_path);
    let target = std::fs::read_link(source_link.as_std_path()).map_err(|e| CatchupError::io(&source_link, e))?;
    let target = Utf8PathBuf::try_from(target)
        .map_err(|e| CatchupError::PreconditionViolation(format!("non-utf8 tablespace target: {e}")))?;

    let mapped = mapping.lookup(&target);
    if !mapped.is_absolute() {
        return Err(CatchupError::MappingError(format!(
            "mapping for tablespace {} must be an absolute path, got {mapped}",
            entry.rel_path
        )));
    }

    std::fs::create_dir_all(mapped.as_std_path()).map_err(|e| CatchupError::io(mapped, e))?;

    let dest_link = dest_pgdata.join(&entry.rel_path);
    if let Some(parent) = dest_link.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CatchupError::io(parent, e))?;
    }
    match std::os::unix::fs::symlink(mapped.as_std_path(), dest_link.as_std_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(CatchupError::io(&dest_link, e)),
    }
}

/// Runs the worker pool over `source_list`, which must already be sorted
/// size-descending and have had its control-file entry removed by the
/// caller (`spec.md` §4.8 "Ordering guarantees").
pub fn run_pool(
    config: &Config,
    source_pgdata: &Utf8Path,
    dest_pgdata: &Utf8Path,
    source_list: &FileList,
    dest_list: Option<&FileList>,
    dest_redo_lsn: Lsn,
    checksum_version: u32,
    interrupted: &Interrupted,
) -> CatchupResult<()> {
    let data_copier = DataFileCopier;
    let whole_copier = WholeFileCopier;

    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for worker_id in 0..config.num_threads.max(1) {
            let data_copier = &data_copier;
            let whole_copier = &whole_copier;
            handles.push(scope.spawn(move || {
                run_worker(
                    worker_id,
                    config,
                    source_pgdata,
                    dest_pgdata,
                    source_list,
                    dest_list,
                    dest_redo_lsn,
                    checksum_version,
                    interrupted,
                    data_copier,
                    whole_copier,
                )
            }));
        }

        let mut first_error = None;
        for handle in handles {
            let result = handle.join().unwrap_or_else(|_| {
                Err(CatchupError::PreconditionViolation("a transfer worker panicked".into()))
            });
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    worker_id: usize,
    config: &Config,
    source_pgdata: &Utf8Path,
    dest_pgdata: &Utf8Path,
    source_list: &FileList,
    dest_list: Option<&FileList>,
    dest_redo_lsn: Lsn,
    checksum_version: u32,
    interrupted: &Interrupted,
    data_copier: &DataFileCopier,
    whole_copier: &WholeFileCopier,
) -> CatchupResult<()> {
    for entry in source_list.entries() {
        if entry.kind != EntryKind::Regular {
            continue;
        }
        if !entry.try_claim() {
            continue;
        }
        if interrupted.is_set() {
            return Err(CatchupError::Interrupted);
        }

        let source_path = source_pgdata.join(&entry.rel_path);
        let dest_path = dest_pgdata.join(&entry.rel_path);

        let prior_size = if config.mode.is_incremental() {
            dest_list.and_then(|list| list.find_by_path(&entry.rel_path)).map(|e| e.size)
        } else {
            None
        };

        let params = CopyParams {
            source_path: &source_path,
            dest_path: &dest_path,
            mode: config.mode,
            sync_lsn: dest_redo_lsn,
            checksum_version,
            page_bitmap: entry.page_bitmap.as_deref(),
            prior_size,
        };

        let result = if entry.is_data_file && !entry.is_cfs_member {
            copy_file(data_copier, &params)
        } else {
            copy_file(whole_copier, &params)
        }?;

        entry.set_write_size(result);
        entry.set_read_size(if result == NOT_FOUND { NOT_FOUND } else { entry.size as i64 });

        match result {
            NOT_FOUND => debug!(worker = worker_id, path = %entry.rel_path, "source file vanished, skipping"),
            UNCHANGED => debug!(worker = worker_id, path = %entry.rel_path, "unchanged"),
            n => info!(worker = worker_id, path = %entry.rel_path, bytes = n, "copied"),
        }
    }
    Ok(())
}

/// True when `mode` allows the prior-size hint to be consulted at all.
pub fn warn_if_threads_exceed_files(num_threads: usize, file_count: usize) {
    if num_threads > file_count.max(1) {
        warn!(num_threads, file_count, "worker count exceeds file count; extra workers will exit immediately");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::FileEntry;

    fn config(num_threads: usize, mode: Mode) -> Config {
        Config {
            source_pgdata: "/src".into(),
            dest_pgdata: "/dst".into(),
            mode,
            num_threads,
            sync_destination: true,
            tablespace_mappings: Vec::new(),
            archive_timeout: None,
            connection: postgres_connection::ConnectionOptions::new("localhost", 5432, "postgres", "postgres"),
            remote_source: false,
        }
    }

    #[test]
    fn pool_copies_every_regular_file_exactly_once() {
        let src_dir = camino_tempfile::tempdir().unwrap();
        let dst_dir = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src_dir.path().join("base/1")).unwrap();
        std::fs::write(src_dir.path().join("base/1/1259"), vec![1u8; 8192]).unwrap();
        std::fs::write(src_dir.path().join("base/1/2619"), vec![2u8; 8192 * 2]).unwrap();

        let mut list = crate::inventory::walk(src_dir.path()).unwrap();
        list.sort_by_size_desc();

        run_pool(&config(4, Mode::Full), src_dir.path(), dst_dir.path(), &list, None, Lsn::INVALID, 1, &Interrupted::default()).unwrap();

        for entry in list.entries() {
            if entry.kind == EntryKind::Regular {
                assert!(entry.is_claimed());
                assert_eq!(entry.write_size(), entry.size as i64);
            }
        }
        assert_eq!(std::fs::read(dst_dir.path().join("base/1/1259")).unwrap(), vec![1u8; 8192]);
    }

    #[test]
    fn single_thread_matches_multi_thread_end_state() {
        let src_dir = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src_dir.path().join("base/1")).unwrap();
        std::fs::write(src_dir.path().join("base/1/1259"), vec![5u8; 8192]).unwrap();

        for threads in [1, 4] {
            let dst_dir = camino_tempfile::tempdir().unwrap();
            let mut list = crate::inventory::walk(src_dir.path()).unwrap();
            list.sort_by_size_desc();
            run_pool(&config(threads, Mode::Full), src_dir.path(), dst_dir.path(), &list, None, Lsn::INVALID, 1, &Interrupted::default()).unwrap();
            assert_eq!(std::fs::read(dst_dir.path().join("base/1/1259")).unwrap(), vec![5u8; 8192]);
        }
    }

    #[test]
    fn interrupted_flag_aborts_the_run() {
        let src_dir = camino_tempfile::tempdir().unwrap();
        let dst_dir = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src_dir.path().join("base/1")).unwrap();
        std::fs::write(src_dir.path().join("base/1/1259"), vec![1u8; 8192]).unwrap();

        let mut list = crate::inventory::walk(src_dir.path()).unwrap();
        list.sort_by_size_desc();
        let interrupted = Interrupted::default();
        interrupted.set();

        let err = run_pool(&config(1, Mode::Full), src_dir.path(), dst_dir.path(), &list, None, Lsn::INVALID, 1, &interrupted).unwrap_err();
        assert!(matches!(err, CatchupError::Interrupted));
    }

    #[test]
    fn claim_flag_prevents_double_copy_on_reentry() {
        let entry = FileEntry::new("base/1/1259".into(), EntryKind::Regular, 8192);
        assert!(entry.try_claim());
        assert!(!entry.try_claim());
    }
}
