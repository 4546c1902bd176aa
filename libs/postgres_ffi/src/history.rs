//! Parsing of a source server's timeline history and the reachability
//! check the Timeline Reconciler needs: is a destination's `(timeline,
//! LSN)` an ancestor position of the source's current timeline?
//!
//! Each entry is the tuple the spec's data model calls for: the child
//! timeline that was created, the LSN at which it branched off, and the
//! parent timeline it branched from. The wire format used here is three
//! tab-separated columns per line, oldest first — a format of this tool's
//! own choosing, since the spec treats the raw history-file grammar as an
//! external collaborator and only prescribes the parsed tuple shape.

use utils::id::TimelineId;
use utils::lsn::Lsn;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HistoryEntry {
    pub timeline: TimelineId,
    pub switch_lsn: Lsn,
    pub prev_timeline: TimelineId,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("malformed timeline history line {line_no}: {text:?}")]
    Malformed { line_no: usize, text: String },
}

pub fn parse(text: &str) -> Result<Vec<HistoryEntry>, HistoryError> {
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let malformed = || HistoryError::Malformed { line_no: idx + 1, text: line.to_string() };
        if fields.len() != 3 {
            return Err(malformed());
        }
        let timeline = TimelineId(fields[0].parse().map_err(|_| malformed())?);
        let switch_lsn: Lsn = fields[1].parse().map_err(|_| malformed())?;
        let prev_timeline = TimelineId(fields[2].parse().map_err(|_| malformed())?);
        entries.push(HistoryEntry { timeline, switch_lsn, prev_timeline });
    }
    Ok(entries)
}

/// True if `(dest_tli, dest_lsn)` lies on the ancestry of `current_tli`
/// according to `history`: either `dest_tli` *is* the current timeline, or
/// there is a chain of branch points from `dest_tli` up to `current_tli`
/// and `dest_lsn` does not exceed the LSN at which `dest_tli` was
/// superseded.
pub fn is_reachable(
    history: &[HistoryEntry],
    current_tli: TimelineId,
    dest_tli: TimelineId,
    dest_lsn: Lsn,
) -> bool {
    if dest_tli == current_tli {
        return true;
    }

    let mut tli = dest_tli;
    let mut first_hop = true;
    loop {
        let Some(entry) = history.iter().find(|e| e.prev_timeline == tli) else {
            return false;
        };
        if first_hop && dest_lsn > entry.switch_lsn {
            return false;
        }
        first_hop = false;
        if entry.timeline == current_tli {
            return true;
        }
        tli = entry.timeline;
    }
}
