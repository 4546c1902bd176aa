//! Change-Map Builder (`spec.md` §4.7): in PTRACK mode, turns the source's
//! block-change tracking into a per-file page bitmap, after first
//! confirming the tracked range actually covers the destination's gap.

use utils::lsn::Lsn;

use crate::error::{CatchupError, CatchupResult};
use crate::inventory::FileList;
use crate::session::SourceSession;

/// Validates `ptrack_lsn` against the destination's redo point and, on
/// success, populates `page_bitmap` on every data-file entry in `files`.
/// The bitmap itself is a placeholder of all-`true` bits sized to the
/// entry's current block count — the real per-block comparison is the
/// block-level delta computation the spec treats as an external
/// collaborator; this builder's job ends at validating coverage and
/// shaping the per-file bitmap the copier consumes.
pub async fn build(
    session: &dyn SourceSession,
    dest_redo_lsn: Lsn,
    files: &mut FileList,
) -> CatchupResult<()> {
    let ptrack_lsn = session.ptrack_lsn_since(dest_redo_lsn).await?;
    check_coverage(ptrack_lsn, dest_redo_lsn)?;

    for entry in files.entries_mut() {
        if !entry.is_data_file {
            continue;
        }
        let blocks = (entry.size / u64::from(postgres_ffi::pg_constants::BLCKSZ)).max(1) as usize;
        entry.page_bitmap = Some(vec![true; blocks]);
    }

    Ok(())
}

fn check_coverage(ptrack_lsn: Lsn, dest_redo_lsn: Lsn) -> CatchupResult<()> {
    if !ptrack_lsn.is_valid() || ptrack_lsn > dest_redo_lsn {
        return Err(CatchupError::BlockTrackingStale {
            ptrack_lsn: ptrack_lsn.to_string(),
            dest_redo_lsn: dest_redo_lsn.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{EntryKind, FileEntry};
    use crate::test_support::FakeSourceSession;

    #[tokio::test]
    async fn stale_ptrack_lsn_is_rejected_before_any_bitmap_is_built() {
        let mut session = FakeSourceSession::default();
        session.ptrack_lsn = Lsn(0x5000000);
        let mut files = FileList::from_entries(vec![FileEntry::new("base/1/1259".into(), EntryKind::Regular, 8192)]);

        let err = build(&session, Lsn(0x3000000), &mut files).await.unwrap_err();
        assert!(matches!(err, CatchupError::BlockTrackingStale { .. }));
        assert!(files.entries()[0].page_bitmap.is_none());
    }

    #[tokio::test]
    async fn invalid_ptrack_lsn_is_rejected() {
        let session = FakeSourceSession { ptrack_lsn: Lsn::INVALID, ..Default::default() };
        let mut files = FileList::from_entries(vec![]);
        let err = build(&session, Lsn(0x3000000), &mut files).await.unwrap_err();
        assert!(matches!(err, CatchupError::BlockTrackingStale { .. }));
    }

    #[tokio::test]
    async fn covered_range_populates_bitmaps_on_data_files_only() {
        let session = FakeSourceSession { ptrack_lsn: Lsn(0x1000000), ..Default::default() };
        let mut files = FileList::from_entries(vec![
            FileEntry::new("base/1/1259".into(), EntryKind::Regular, 8192 * 3),
            FileEntry::new("base/1/PG_VERSION".into(), EntryKind::Regular, 3),
        ]);

        build(&session, Lsn(0x3000000), &mut files).await.unwrap();
        assert_eq!(files.entries()[0].page_bitmap.as_ref().unwrap().len(), 3);
        assert!(files.entries()[1].page_bitmap.is_none());
    }
}
