//! Block-aware copier for relation data files. Implements the per-file
//! content invariant of `spec.md` §3: changed blocks get the source's
//! current bytes, everything else keeps the destination's prior content.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::config::Mode;
use crate::error::{CatchupError, CatchupResult};
use utils::lsn::Lsn;

use super::{ByteRange, CopyParams, FileCopier};

pub struct DataFileCopier;

impl FileCopier for DataFileCopier {
    fn open_source(&self, params: &CopyParams) -> CatchupResult<Option<File>> {
        match File::open(params.source_path.as_std_path()) {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CatchupError::io(params.source_path, e)),
        }
    }

    fn range_plan(&self, params: &CopyParams, source: &mut File, source_len: u64) -> CatchupResult<Vec<ByteRange>> {
        match params.mode {
            Mode::Full => Ok(vec![(0, source_len)]),
            Mode::Ptrack => Ok(ranges_from_bitmap(params.page_bitmap.unwrap_or(&[]), source_len)),
            Mode::Delta => {
                let bitmap = delta_bitmap(params, source, source_len)?;
                Ok(ranges_from_bitmap(&bitmap, source_len))
            }
        }
    }

    fn write_destination(&self, params: &CopyParams, source: &mut File, source_len: u64, ranges: &[ByteRange]) -> CatchupResult<i64> {
        if let Some(parent) = params.dest_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatchupError::io(parent, e))?;
        }
        let mut dest = OpenOptions::new()
            .create(true)
            .write(true)
            .read(false)
            .open(params.dest_path.as_std_path())
            .map_err(|e| CatchupError::io(params.dest_path, e))?;
        dest.set_len(source_len).map_err(|e| CatchupError::io(params.dest_path, e))?;

        let mut written = 0i64;
        let mut buf = Vec::new();
        for &(offset, len) in ranges {
            buf.resize(len as usize, 0);
            source.seek(SeekFrom::Start(offset)).map_err(|e| CatchupError::io(params.source_path, e))?;
            source.read_exact(&mut buf).map_err(|e| CatchupError::io(params.source_path, e))?;
            dest.seek(SeekFrom::Start(offset)).map_err(|e| CatchupError::io(params.dest_path, e))?;
            dest.write_all(&buf).map_err(|e| CatchupError::io(params.dest_path, e))?;
            written += len as i64;
        }
        Ok(written)
    }
}

/// Merges adjacent changed blocks into contiguous byte ranges, so the
/// copier issues one seek/write pair per run of changed pages rather than
/// one per page.
fn ranges_from_bitmap(bitmap: &[bool], source_len: u64) -> Vec<ByteRange> {
    let block_size = u64::from(postgres_ffi::pg_constants::BLCKSZ);
    let mut ranges = Vec::new();
    let mut run_start: Option<usize> = None;

    for (idx, &changed) in bitmap.iter().enumerate() {
        match (changed, run_start) {
            (true, None) => run_start = Some(idx),
            (false, Some(start)) => {
                ranges.push(block_range(start, idx, block_size, source_len));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        ranges.push(block_range(start, bitmap.len(), block_size, source_len));
    }
    ranges
}

fn block_range(start_block: usize, end_block_exclusive: usize, block_size: u64, source_len: u64) -> ByteRange {
    let offset = start_block as u64 * block_size;
    let end = (end_block_exclusive as u64 * block_size).min(source_len);
    (offset, end.saturating_sub(offset))
}

/// Builds a per-block changed bitmap for DELTA mode: a block is changed
/// if it did not exist in the destination's prior copy of this file, or
/// if its page header's LSN is newer than `params.sync_lsn` (the
/// destination's redo LSN) — the same test `pageserver` uses to decide
/// whether a page needs reconstructing from a newer layer.
fn delta_bitmap(params: &CopyParams, source: &mut File, source_len: u64) -> CatchupResult<Vec<bool>> {
    let block_size = u64::from(postgres_ffi::pg_constants::BLCKSZ);
    let prior_size = params.prior_size.unwrap_or(0);
    let num_blocks = source_len.div_ceil(block_size) as usize;

    let mut bitmap = Vec::with_capacity(num_blocks);
    let mut buf = vec![0u8; block_size as usize];
    for block_no in 0..num_blocks {
        let offset = block_no as u64 * block_size;
        if offset >= prior_size {
            bitmap.push(true);
            continue;
        }
        source.seek(SeekFrom::Start(offset)).map_err(|e| CatchupError::io(params.source_path, e))?;
        let read = read_up_to(source, &mut buf).map_err(|e| CatchupError::io(params.source_path, e))?;
        let changed = match page_lsn(&buf[..read]) {
            Some(lsn) => lsn > params.sync_lsn,
            None => true,
        };
        bitmap.push(changed);
    }
    Ok(bitmap)
}

/// Reads up to `buf.len()` bytes, stopping early at EOF — the final block
/// of a file may be shorter than `BLCKSZ`.
fn read_up_to(source: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = source.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Extracts `pd_lsn` from a page's first 8 bytes: two little-endian
/// `u32`s, `xlogid` then `xrecoff`, combined the way
/// `PageXLogRecPtrGet` does on the PostgreSQL side.
fn page_lsn(block: &[u8]) -> Option<Lsn> {
    if block.len() < 8 {
        return None;
    }
    let mut cur = std::io::Cursor::new(&block[0..8]);
    let xlogid = cur.read_u32::<LittleEndian>().ok()?;
    let xrecoff = cur.read_u32::<LittleEndian>().ok()?;
    Some(Lsn(((xlogid as u64) << 32) | xrecoff as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copier::copy_file;
    use crate::inventory::UNCHANGED;
    use utils::lsn::Lsn;

    fn params<'a>(source: &'a camino::Utf8Path, dest: &'a camino::Utf8Path, mode: Mode, prior_size: Option<u64>, bitmap: Option<&'a [bool]>) -> CopyParams<'a> {
        CopyParams {
            source_path: source,
            dest_path: dest,
            mode,
            sync_lsn: Lsn(0x3000000),
            checksum_version: 1,
            page_bitmap: bitmap,
            prior_size,
        }
    }

    #[test]
    fn full_mode_copies_whole_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let dest = dir.path().join("dst");
        std::fs::write(source.as_std_path(), vec![7u8; 8192 * 2]).unwrap();

        let p = params(&source, &dest, Mode::Full, None, None);
        let n = copy_file(&DataFileCopier, &p).unwrap();
        assert_eq!(n, 8192 * 2);
        assert_eq!(std::fs::read(dest.as_std_path()).unwrap(), vec![7u8; 8192 * 2]);
    }

    /// Builds one `block_size`-byte page stamped with `lsn` in the
    /// `pd_lsn` header field, the rest filled with `fill_byte`.
    fn page_block(lsn: Lsn, block_size: usize, fill_byte: u8) -> Vec<u8> {
        let mut block = vec![fill_byte; block_size];
        let xlogid = (lsn.0 >> 32) as u32;
        let xrecoff = lsn.0 as u32;
        block[0..4].copy_from_slice(&xlogid.to_le_bytes());
        block[4..8].copy_from_slice(&xrecoff.to_le_bytes());
        block
    }

    #[test]
    fn delta_mode_skips_a_block_whose_lsn_is_at_or_below_sync_lsn() {
        let dir = camino_tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let dest = dir.path().join("dst");
        let block_size = 8192usize;
        std::fs::write(source.as_std_path(), page_block(Lsn(0x2000000), block_size, 3)).unwrap();

        let p = params(&source, &dest, Mode::Delta, Some(block_size as u64), None);
        let n = copy_file(&DataFileCopier, &p).unwrap();
        assert_eq!(n, UNCHANGED);
    }

    #[test]
    fn delta_mode_recopies_a_block_whose_lsn_is_above_sync_lsn() {
        let dir = camino_tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let dest = dir.path().join("dst");
        let block_size = 8192usize;
        let source_block = page_block(Lsn(0x3500000), block_size, 7);
        std::fs::write(source.as_std_path(), &source_block).unwrap();
        std::fs::write(dest.as_std_path(), vec![9u8; block_size]).unwrap();

        let p = params(&source, &dest, Mode::Delta, Some(block_size as u64), None);
        let n = copy_file(&DataFileCopier, &p).unwrap();
        assert_eq!(n, block_size as i64);
        assert_eq!(std::fs::read(dest.as_std_path()).unwrap(), source_block);
    }

    #[test]
    fn delta_mode_copies_blocks_appended_since_the_prior_sync_regardless_of_lsn() {
        let dir = camino_tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let dest = dir.path().join("dst");
        let block_size = 8192usize;
        let mut source_bytes = page_block(Lsn(0x2000000), block_size, 1);
        source_bytes.extend(page_block(Lsn(0x1000000), block_size, 2));
        std::fs::write(source.as_std_path(), &source_bytes).unwrap();
        std::fs::write(dest.as_std_path(), vec![9u8; block_size]).unwrap();

        let p = params(&source, &dest, Mode::Delta, Some(block_size as u64), None);
        let n = copy_file(&DataFileCopier, &p).unwrap();
        assert_eq!(n, block_size as i64);

        let result = std::fs::read(dest.as_std_path()).unwrap();
        assert_eq!(&result[0..block_size], &vec![9u8; block_size][..]);
        assert_eq!(&result[block_size..], &source_bytes[block_size..]);
    }

    #[test]
    fn ptrack_mode_only_rewrites_changed_blocks_and_preserves_the_rest() {
        let dir = camino_tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let dest = dir.path().join("dst");
        let block_size = 8192usize;
        let source_bytes = vec![2u8; block_size * 3];
        std::fs::write(source.as_std_path(), &source_bytes).unwrap();
        // Prior destination content: all 9s, distinguishable from the source.
        std::fs::write(dest.as_std_path(), vec![9u8; block_size * 3]).unwrap();

        let bitmap = [false, true, false];
        let p = params(&source, &dest, Mode::Ptrack, None, Some(&bitmap));
        let n = copy_file(&DataFileCopier, &p).unwrap();
        assert_eq!(n, block_size as i64);

        let result = std::fs::read(dest.as_std_path()).unwrap();
        assert_eq!(&result[0..block_size], &vec![9u8; block_size][..]);
        assert_eq!(&result[block_size..block_size * 2], &vec![2u8; block_size][..]);
        assert_eq!(&result[block_size * 2..], &vec![9u8; block_size][..]);
    }

    #[test]
    fn missing_source_file_is_not_found() {
        let dir = camino_tempfile::tempdir().unwrap();
        let source = dir.path().join("gone");
        let dest = dir.path().join("dst");
        let p = params(&source, &dest, Mode::Full, None, None);
        let n = copy_file(&DataFileCopier, &p).unwrap();
        assert_eq!(n, crate::inventory::NOT_FOUND);
    }
}
