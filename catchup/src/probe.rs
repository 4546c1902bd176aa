//! Source Probe (`spec.md` §4, component 1): opens a database session and
//! retrieves everything the rest of the pipeline needs to know about the
//! source before touching the destination.

use camino::Utf8Path;
use postgres_ffi::controlfile::ControlFileData;
use postgres_ffi::pg_constants::PG_CONTROL_FILE;
use utils::id::{SystemId, TimelineId};

use crate::context::NodeDescriptor;
use crate::error::{CatchupError, CatchupResult};
use crate::session::SourceSession;

pub struct SourceProbeResult {
    pub descriptor: NodeDescriptor,
    pub current_timeline: TimelineId,
    pub wal_segment_size: u64,
    /// The system identifier as read directly off the source's own data
    /// directory, independent of what the session reports — the
    /// Preflight Validator compares the two.
    pub on_disk_system_identifier: SystemId,
}

pub async fn probe_source(session: &dyn SourceSession, source_pgdata: &Utf8Path) -> CatchupResult<SourceProbeResult> {
    let (server_version_num, server_version_str) = session.server_version().await?;
    let is_replica = session.is_replica().await?;
    let has_elevated_rights = session.has_elevated_rights().await?;
    let system_identifier = session.system_identifier().await?;
    let current_timeline = session.current_timeline().await?;
    let wal_segment_size = session.wal_segment_size().await?;
    let checksum_version = session.checksum_version().await?;
    let ptrack = session.ptrack_info().await?;

    let on_disk_system_identifier = read_on_disk_system_identifier(source_pgdata)?;

    Ok(SourceProbeResult {
        descriptor: NodeDescriptor {
            server_version_num,
            server_version_str,
            is_replica,
            has_elevated_rights,
            ptrack_version: ptrack.version,
            ptrack_enabled: ptrack.enabled,
            checksum_version,
            ptrack_schema: ptrack.schema,
            system_identifier: SystemId(system_identifier),
        },
        current_timeline,
        wal_segment_size,
        on_disk_system_identifier,
    })
}

/// Reads the `system_identifier` out of a data directory's own control
/// file, independent of any live session to that cluster.
pub fn read_on_disk_system_identifier(pgdata: &Utf8Path) -> CatchupResult<SystemId> {
    let path = pgdata.join(PG_CONTROL_FILE);
    let cf = ControlFileData::read_from(path.as_std_path())
        .map_err(|e| CatchupError::PreconditionViolation(format!("reading {path}: {e}")))?;
    Ok(cf.system_identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSourceSession;

    #[tokio::test]
    async fn probe_collects_descriptor_fields() {
        let dir = camino_tempfile::tempdir().unwrap();
        let session = FakeSourceSession::default();
        let cf_path = dir.path().join(PG_CONTROL_FILE);
        std::fs::create_dir_all(cf_path.parent().unwrap()).unwrap();
        crate::test_support::write_control_file(cf_path.as_std_path(), session.system_identifier_value);

        let result = probe_source(&session, dir.path()).await.unwrap();
        assert_eq!(result.current_timeline, TimelineId(1));
        assert_eq!(result.on_disk_system_identifier.0, session.system_identifier_value);
        assert_eq!(result.descriptor.system_identifier.0, session.system_identifier_value);
    }
}
