//! File Inventory (`spec.md` §4.4): walks a data directory into a sorted
//! list of classified file entries. Used for both the source and, in
//! incremental mode, the destination.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

use postgres_ffi::pg_constants::{PG_WAL_DIR, PG_XLOG_DIR};
use postgres_ffi::relfile_utils::is_data_file;

use crate::error::{CatchupError, CatchupResult};

/// Sentinel written to [`FileEntry::write_size`] when the file vanished
/// between inventory and copy (`spec.md` §4.8 step 7).
pub const NOT_FOUND: i64 = -1;
/// Sentinel meaning the copier wrote zero bytes because nothing changed.
pub const UNCHANGED: i64 = -2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    Regular,
    Directory,
    /// A tablespace symlink under `pg_tblspc/`; its true destination is
    /// resolved later by `crate::tablespace`.
    Symlink,
}

/// One path in a data directory's tree (`spec.md` §3 "File entry").
#[derive(Debug)]
pub struct FileEntry {
    pub rel_path: Utf8PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub is_data_file: bool,
    /// True for relation files living on a PostgreSQL Pro compressed file
    /// system mount; these are never range-copied, always whole-file.
    pub is_cfs_member: bool,
    /// Identifies which configured external directory this entry belongs
    /// to, if any; `None` for ordinary data-directory members.
    pub external_dir_id: Option<u32>,
    /// Per-block changed mask, populated by `crate::change_map` in PTRACK
    /// mode. `None` until then, and always `None` for non-data files.
    pub page_bitmap: Option<Vec<bool>>,

    claimed: AtomicBool,
    read_size: AtomicI64,
    write_size: AtomicI64,
}

impl FileEntry {
    pub fn new(rel_path: Utf8PathBuf, kind: EntryKind, size: u64) -> Self {
        let is_data_file = kind == EntryKind::Regular && is_data_file(rel_path.as_str());
        FileEntry {
            rel_path,
            kind,
            size,
            is_data_file,
            is_cfs_member: false,
            external_dir_id: None,
            page_bitmap: None,
            claimed: AtomicBool::new(false),
            read_size: AtomicI64::new(0),
            write_size: AtomicI64::new(0),
        }
    }

    /// Atomically transitions the claim flag from unset to set; `true`
    /// only for the single worker that wins the race.
    pub fn try_claim(&self) -> bool {
        self.claimed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    pub fn read_size(&self) -> i64 {
        self.read_size.load(Ordering::SeqCst)
    }

    pub fn set_read_size(&self, n: i64) {
        self.read_size.store(n, Ordering::SeqCst);
    }

    pub fn write_size(&self) -> i64 {
        self.write_size.load(Ordering::SeqCst)
    }

    pub fn set_write_size(&self, n: i64) {
        self.write_size.store(n, Ordering::SeqCst);
    }
}

/// A file list in one of the two sort orders the spec requires at
/// different phases: path-ascending or size-descending.
pub struct FileList {
    entries: Vec<FileEntry>,
}

impl FileList {
    pub fn from_entries(entries: Vec<FileEntry>) -> Self {
        FileList { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [FileEntry] {
        &mut self.entries
    }

    pub fn into_entries(self) -> Vec<FileEntry> {
        self.entries
    }

    /// Ascending by relative path; required before [`FileList::find_by_path`]
    /// and before the Directory Pre-creation pass.
    pub fn sort_by_path(&mut self) {
        self.entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    }

    /// Descending by size, for Transfer Scheduler load balancing.
    pub fn sort_by_size_desc(&mut self) {
        self.entries.sort_by(|a, b| b.size.cmp(&a.size));
    }

    /// Binary search by relative path. Only valid after [`FileList::sort_by_path`].
    pub fn find_by_path(&self, path: &Utf8Path) -> Option<&FileEntry> {
        self.entries
            .binary_search_by(|e| e.rel_path.as_path().cmp(path))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Removes and returns the entry at `path`, if present. Used to excise
    /// the control file from the pool's work list before fan-out.
    pub fn remove_path(&mut self, path: &Utf8Path) -> Option<FileEntry> {
        let idx = self.entries.iter().position(|e| e.rel_path == path)?;
        Some(self.entries.remove(idx))
    }

    #[cfg(test)]
    fn contains_path(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.rel_path == path)
    }
}

fn is_under_wal_dir(rel_path: &Utf8Path) -> bool {
    matches!(rel_path.components().next(), Some(first) if first.as_str() == PG_WAL_DIR || first.as_str() == PG_XLOG_DIR)
}

fn classify(file_type: std::fs::FileType) -> EntryKind {
    if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::Regular
    }
}

fn walk_error(e: walkdir::Error, fallback: &Utf8Path) -> CatchupError {
    let path = e
        .path()
        .and_then(Utf8Path::from_path)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| fallback.to_path_buf());
    let io_err = e.into_io_error().unwrap_or_else(|| std::io::Error::other("directory walk failed"));
    CatchupError::io(path, io_err)
}

fn to_rel_path(base: &Utf8Path, abs: &std::path::Path) -> CatchupResult<Utf8PathBuf> {
    let abs = Utf8PathBuf::try_from(abs.to_path_buf())
        .map_err(|e| CatchupError::PreconditionViolation(format!("non-utf8 path: {e}")))?;
    abs.strip_prefix(base)
        .map(|p| p.to_path_buf())
        .map_err(|_| CatchupError::PreconditionViolation(format!("{abs} is not under {base}")))
}

/// Walks `pgdata` into a [`FileList`]. Tablespace symlinks under
/// `pg_tblspc/` are recorded as directory-shaped entries and their
/// contents are walked through the symlink, keeping the logical relative
/// path rooted at `pgdata` (`spec.md` §4.4). WAL directory contents are
/// excluded; WAL arrives via the streamer, not the transfer scheduler.
pub fn walk(pgdata: &Utf8Path) -> CatchupResult<FileList> {
    let mut entries = Vec::new();

    for item in WalkDir::new(pgdata).follow_links(false).min_depth(1) {
        let item = item.map_err(|e| walk_error(e, pgdata))?;
        let rel_path = to_rel_path(pgdata, item.path())?;

        if is_under_wal_dir(&rel_path) {
            continue;
        }

        let file_type = item.file_type();
        let is_tablespace_link = file_type.is_symlink() && rel_path.components().count() == 2 && rel_path.starts_with("pg_tblspc");

        if is_tablespace_link {
            let target = std::fs::read_link(item.path()).map_err(|e| CatchupError::io(rel_path.clone(), e))?;
            entries.push(FileEntry::new(rel_path.clone(), EntryKind::Symlink, 0));
            if target.exists() {
                walk_through_symlink(&target, &rel_path, &mut entries)?;
            }
            continue;
        }

        let metadata = item
            .metadata()
            .map_err(|e| CatchupError::io(&rel_path, e.into_io_error().unwrap_or_else(|| std::io::Error::other("stat failed"))))?;
        let size = if file_type.is_file() { metadata.len() } else { 0 };
        entries.push(FileEntry::new(rel_path, classify(file_type), size));
    }

    Ok(FileList::from_entries(entries))
}

fn walk_through_symlink(target: &std::path::Path, logical_prefix: &Utf8Path, entries: &mut Vec<FileEntry>) -> CatchupResult<()> {
    let target = Utf8PathBuf::try_from(target.to_path_buf())
        .map_err(|e| CatchupError::PreconditionViolation(format!("non-utf8 tablespace target: {e}")))?;

    for item in WalkDir::new(&target).follow_links(true).min_depth(1) {
        let item = item.map_err(|e| walk_error(e, &target))?;
        let rel_in_target = to_rel_path(&target, item.path())?;
        let logical_path = logical_prefix.join(&rel_in_target);

        let file_type = item.file_type();
        let metadata = item
            .metadata()
            .map_err(|e| CatchupError::io(&logical_path, e.into_io_error().unwrap_or_else(|| std::io::Error::other("stat failed"))))?;
        let size = if file_type.is_file() { metadata.len() } else { 0 };
        entries.push(FileEntry::new(logical_path, classify(file_type), size));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_flag_only_lets_one_winner_through() {
        let entry = FileEntry::new("base/1/1259".into(), EntryKind::Regular, 8192);
        assert!(entry.try_claim());
        assert!(!entry.try_claim());
    }

    #[test]
    fn excludes_wal_directory_contents() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pg_wal")).unwrap();
        std::fs::write(dir.path().join("pg_wal/000000010000000000000001"), b"x").unwrap();
        std::fs::create_dir_all(dir.path().join("base/1")).unwrap();
        std::fs::write(dir.path().join("base/1/1259"), b"data").unwrap();

        let list = walk(dir.path()).unwrap();
        assert!(list.entries().iter().all(|e| !e.rel_path.starts_with("pg_wal")));
        assert!(list.contains_path("base/1/1259"));
    }

    #[test]
    fn sorts_by_path_and_by_size_desc() {
        let mut list = FileList::from_entries(vec![
            FileEntry::new("base/1/200".into(), EntryKind::Regular, 10),
            FileEntry::new("base/1/100".into(), EntryKind::Regular, 1000),
        ]);
        list.sort_by_path();
        assert_eq!(list.entries()[0].rel_path.as_str(), "base/1/100");

        list.sort_by_size_desc();
        assert_eq!(list.entries()[0].size, 1000);
    }

    #[test]
    fn remove_path_excises_entry() {
        let mut list = FileList::from_entries(vec![FileEntry::new("global/pg_control".into(), EntryKind::Regular, 8192)]);
        let removed = list.remove_path(Utf8Path::new("global/pg_control"));
        assert!(removed.is_some());
        assert!(list.is_empty());
    }
}
