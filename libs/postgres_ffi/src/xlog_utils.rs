//! WAL segment file naming, the way `XLogFileName`/`XLogFromFileName` work
//! on the PostgreSQL side: a 24-hex-digit name encoding the timeline and
//! the segment's logical file number.

use utils::id::TimelineId;
use utils::lsn::Lsn;

/// Renders the canonical WAL segment file name for `(timeline, segno)`.
pub fn xlog_file_name(tli: TimelineId, segno: u64, wal_seg_size: u64) -> String {
    let segments_per_xlog = 0x1_0000_0000u64 / wal_seg_size;
    let log = segno / segments_per_xlog;
    let seg = segno % segments_per_xlog;
    format!("{:08X}{:08X}{:08X}", tli.0, log, seg)
}

/// Inverse of [`xlog_file_name`].
pub fn parse_xlog_file_name(name: &str, wal_seg_size: u64) -> Option<(TimelineId, u64)> {
    if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let tli = u32::from_str_radix(&name[0..8], 16).ok()?;
    let log = u64::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&name[16..24], 16).ok()?;
    let segments_per_xlog = 0x1_0000_0000u64 / wal_seg_size;
    Some((TimelineId(tli), log * segments_per_xlog + seg))
}

/// The set of segment numbers that must be present to cover `[start, stop]`
/// inclusive, used by the WAL Streamer Supervisor's completion check and by
/// the test-only invariant checker.
pub fn segments_covering(start: Lsn, stop: Lsn, wal_seg_size: u64) -> Vec<u64> {
    let first = start.segment_number(wal_seg_size);
    let last = stop.segment_number(wal_seg_size);
    (first..=last).collect()
}
