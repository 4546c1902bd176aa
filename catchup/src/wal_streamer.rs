//! WAL Streamer Supervisor (`spec.md` §4.6): owns the destination's WAL
//! directory and the replication-protocol session that fills it.

use std::time::Duration;

use camino::Utf8Path;
use tracing::info;
use utils::id::TimelineId;
use utils::lsn::Lsn;

use postgres_ffi::pg_constants::PG_WAL_DIR;
use postgres_ffi::xlog_utils;

use crate::error::{CatchupError, CatchupResult};
use crate::session::ReplicationSession;

/// How often the supervisor polls `flushed_lsn` while waiting for the
/// stream to catch up to `stop_lsn`.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Creates `<dest_pgdata>/pg_wal` and begins streaming from `(timeline,
/// start_lsn)`.
pub async fn start(
    replication: &dyn ReplicationSession,
    dest_pgdata: &Utf8Path,
    timeline: TimelineId,
    start_lsn: Lsn,
) -> CatchupResult<()> {
    let wal_dir = dest_pgdata.join(PG_WAL_DIR);
    std::fs::create_dir_all(&wal_dir).map_err(|e| CatchupError::io(&wal_dir, e))?;
    info!(timeline = %timeline, start_lsn = %start_lsn, "starting wal streaming");
    replication.start_streaming(timeline, start_lsn).await
}

/// Blocks until the stream has durably flushed through `stop_lsn`.
pub async fn wait_until_caught_up(replication: &dyn ReplicationSession, stop_lsn: Lsn) -> CatchupResult<()> {
    loop {
        let flushed = replication.flushed_lsn().await?;
        if flushed >= stop_lsn {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Stops the stream, then checks that every WAL segment covering
/// `[start_lsn, stop_lsn]` landed in the destination's `pg_wal` —
/// `spec.md` §8 Testable Property #4.
pub async fn stop(
    replication: &dyn ReplicationSession,
    dest_pgdata: &Utf8Path,
    timeline: TimelineId,
    start_lsn: Lsn,
    stop_lsn: Lsn,
    wal_seg_size: u64,
) -> CatchupResult<()> {
    replication.stop_streaming().await?;
    verify_segments_present(dest_pgdata, timeline, start_lsn, stop_lsn, wal_seg_size)
}

fn verify_segments_present(dest_pgdata: &Utf8Path, timeline: TimelineId, start_lsn: Lsn, stop_lsn: Lsn, wal_seg_size: u64) -> CatchupResult<()> {
    let wal_dir = dest_pgdata.join(PG_WAL_DIR);
    for segno in xlog_utils::segments_covering(start_lsn, stop_lsn, wal_seg_size) {
        let name = xlog_utils::xlog_file_name(timeline, segno, wal_seg_size);
        if !wal_dir.join(&name).as_std_path().is_file() {
            return Err(CatchupError::StreamingFailure(format!(
                "missing wal segment {name} covering [{start_lsn}, {stop_lsn}]"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeReplicationSession;

    #[tokio::test]
    async fn start_creates_wal_directory() {
        let dir = camino_tempfile::tempdir().unwrap();
        let replication = FakeReplicationSession::default();
        start(&replication, dir.path(), TimelineId(1), Lsn(0x3000028)).await.unwrap();
        assert!(dir.path().join(PG_WAL_DIR).as_std_path().is_dir());
    }

    #[tokio::test]
    async fn wait_returns_once_flushed_reaches_stop_lsn() {
        let replication = FakeReplicationSession::default();
        replication.advance_to(Lsn(0x4000000));
        wait_until_caught_up(&replication, Lsn(0x3000000)).await.unwrap();
    }

    #[tokio::test]
    async fn start_surfaces_streaming_failure() {
        let dir = camino_tempfile::tempdir().unwrap();
        let replication = FakeReplicationSession { fail_stream: true, ..Default::default() };
        let err = start(&replication, dir.path(), TimelineId(1), Lsn(0x3000028)).await.unwrap_err();
        assert!(matches!(err, CatchupError::StreamingFailure(_)));
    }

    #[tokio::test]
    async fn stop_fails_when_a_covering_segment_is_missing() {
        let dir = camino_tempfile::tempdir().unwrap();
        let replication = FakeReplicationSession::default();
        let wal_seg_size = 16 * 1024 * 1024;
        start(&replication, dir.path(), TimelineId(1), Lsn(0x1000028)).await.unwrap();

        let err = stop(&replication, dir.path(), TimelineId(1), Lsn(0x1000028), Lsn(wal_seg_size + 10), wal_seg_size)
            .await
            .unwrap_err();
        assert!(matches!(err, CatchupError::StreamingFailure(_)));
    }

    #[tokio::test]
    async fn stop_succeeds_once_every_covering_segment_exists() {
        let dir = camino_tempfile::tempdir().unwrap();
        let replication = FakeReplicationSession::default();
        let wal_seg_size = 16 * 1024 * 1024;
        let start_lsn = Lsn(0x1000028);
        let stop_lsn = Lsn(wal_seg_size + 10);
        start(&replication, dir.path(), TimelineId(1), start_lsn).await.unwrap();

        let wal_dir = dir.path().join(PG_WAL_DIR);
        for segno in xlog_utils::segments_covering(start_lsn, stop_lsn, wal_seg_size) {
            let name = xlog_utils::xlog_file_name(TimelineId(1), segno, wal_seg_size);
            std::fs::write(wal_dir.join(name), []).unwrap();
        }

        stop(&replication, dir.path(), TimelineId(1), start_lsn, stop_lsn, wal_seg_size).await.unwrap();
    }
}
