//! The copy capability of Design Note §9: "anything copyable exposes
//! (open-source, range-plan, write-destination, finalize)". The Transfer
//! Scheduler is copier-agnostic; it only calls [`copy_file`] with the
//! copier that matches the entry's classification.

pub mod data_file;
pub mod whole_file;

use std::fs::File;

use camino::Utf8Path;

use crate::config::Mode;
use crate::inventory::{NOT_FOUND, UNCHANGED};
use utils::lsn::Lsn;

use crate::error::CatchupResult;

/// Parameters the Transfer Scheduler hands to a copier for one entry
/// (`spec.md` §4.8 step 6): a plain data bag, not a trait, since every
/// copier needs the same shape even though data files use more of it.
pub struct CopyParams<'a> {
    pub source_path: &'a Utf8Path,
    pub dest_path: &'a Utf8Path,
    pub mode: Mode,
    /// Destination redo LSN; unused by the whole-file copier.
    pub sync_lsn: Lsn,
    pub checksum_version: u32,
    pub page_bitmap: Option<&'a [bool]>,
    /// Size of this path in the destination's prior inventory, when the
    /// run is incremental and the path already existed there.
    pub prior_size: Option<u64>,
}

/// A contiguous byte range to copy, `(offset, length)`.
pub type ByteRange = (u64, u64);

pub trait FileCopier: Send + Sync {
    /// Opens the source file; `Ok(None)` means it vanished since
    /// inventory (§4.8 step 7, `NOT_FOUND`).
    fn open_source(&self, params: &CopyParams) -> CatchupResult<Option<File>>;

    /// Decides which byte ranges of `source_len` bytes need writing. Takes
    /// the open source handle because DELTA mode inspects each block's
    /// page header to decide whether it changed since `params.sync_lsn`.
    fn range_plan(&self, params: &CopyParams, source: &mut File, source_len: u64) -> CatchupResult<Vec<ByteRange>>;

    /// Copies the planned ranges; returns the number of bytes written.
    fn write_destination(&self, params: &CopyParams, source: &mut File, source_len: u64, ranges: &[ByteRange]) -> CatchupResult<i64>;

    /// Runs after a non-empty write; a no-op for copiers with nothing
    /// extra to do once the bytes are on disk.
    fn finalize(&self, _params: &CopyParams) -> CatchupResult<()> {
        Ok(())
    }
}

/// Runs one entry through its copier end to end, translating the
/// no-work and not-found cases into the sentinels the scheduler logs
/// (`spec.md` §4.8 step 7).
pub fn copy_file(copier: &dyn FileCopier, params: &CopyParams) -> CatchupResult<i64> {
    let Some(mut source) = copier.open_source(params)? else {
        return Ok(NOT_FOUND);
    };
    let source_len = source
        .metadata()
        .map_err(|e| crate::error::CatchupError::io(params.source_path, e))?
        .len();

    let ranges = copier.range_plan(params, &mut source, source_len)?;
    if ranges.is_empty() {
        return Ok(UNCHANGED);
    }

    let written = copier.write_destination(params, &mut source, source_len, &ranges)?;
    copier.finalize(params)?;
    Ok(written)
}
