//! Timeline Reconciler (`spec.md` §4.3): confirms the destination's last
//! checkpoint lies on the ancestry of the source's current timeline before
//! any transfer begins.

use postgres_ffi::history;
use utils::id::TimelineId;
use utils::lsn::Lsn;

use crate::error::{CatchupError, CatchupResult};
use crate::session::ReplicationSession;

/// Checks containment per §4.3: timeline 1 on the source requires
/// timeline 1 on the destination exactly; otherwise the destination must
/// be reachable within the source's fetched history.
pub async fn check(
    replication: &dyn ReplicationSession,
    source_current_timeline: TimelineId,
    dest_timeline: TimelineId,
    dest_lsn: Lsn,
) -> CatchupResult<()> {
    if source_current_timeline == TimelineId(1) {
        if dest_timeline != TimelineId(1) {
            return Err(CatchupError::TimelineDivergence {
                dest_tli: dest_timeline.0,
                dest_lsn: dest_lsn.to_string(),
            });
        }
        return Ok(());
    }

    let history_text = replication.timeline_history(source_current_timeline).await?;
    let entries = history::parse(&history_text)
        .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("malformed timeline history: {e}")))?;

    if history::is_reachable(&entries, source_current_timeline, dest_timeline, dest_lsn) {
        Ok(())
    } else {
        Err(CatchupError::TimelineDivergence {
            dest_tli: dest_timeline.0,
            dest_lsn: dest_lsn.to_string(),
        })
    }
}
