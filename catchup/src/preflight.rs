//! Preflight Validator (`spec.md` §4.1): every precondition that must hold
//! before the first byte is written to the destination. Checks run in a
//! fixed order and the first failure aborts the run with no on-disk
//! mutation. Tablespace-mapping completeness and timeline containment are
//! checked by their own components (`crate::tablespace`,
//! `crate::timeline_reconcile`) and are not repeated here; `engine` runs
//! all of them before any other phase touches the destination.

use camino::Utf8Path;
use postgres_ffi::controlfile::{ControlFileData, DbState};
use postgres_ffi::pg_constants::{BACKUP_LABEL_FILE, PG_CONTROL_FILE};
use utils::id::SystemId;
use utils::lock_file::{self, PostmasterStatus};

use crate::config::{Config, Mode};
use crate::context::NodeDescriptor;
use crate::error::{CatchupError, CatchupResult};
use crate::probe::SourceProbeResult;

/// Everything the validator needs to know about the destination, read
/// once up front so the checks below are pure.
pub struct DestinationState {
    pub nonempty: bool,
    pub control: Option<ControlFileData>,
    pub has_backup_label: bool,
}

/// Inspects `dest_pgdata` without mutating it. A FULL run passes an empty
/// directory here; the control file and backup label are simply absent.
pub fn inspect_destination(dest_pgdata: &Utf8Path) -> CatchupResult<DestinationState> {
    let nonempty = match std::fs::read_dir(dest_pgdata) {
        Ok(mut entries) => entries.next().is_some(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(CatchupError::io(dest_pgdata, e)),
    };

    let control_path = dest_pgdata.join(PG_CONTROL_FILE);
    let control = match ControlFileData::read_from(control_path.as_std_path()) {
        Ok(cf) => Some(cf),
        Err(_) if !control_path.as_std_path().exists() => None,
        Err(e) => {
            return Err(CatchupError::PreconditionViolation(format!(
                "destination control file {control_path}: {e}"
            )))
        }
    };

    let has_backup_label = dest_pgdata.join(BACKUP_LABEL_FILE).as_std_path().exists();

    Ok(DestinationState { nonempty, control, has_backup_label })
}

/// Runs the ordered checks of §4.1 that do not delegate to another
/// component. `dest` is `None` only meaningful for FULL mode, where an
/// empty destination means there is nothing else to validate.
pub fn validate(
    config: &Config,
    source_descriptor: &NodeDescriptor,
    source: &SourceProbeResult,
    dest_pgdata: &Utf8Path,
    dest: &DestinationState,
) -> CatchupResult<()> {
    check_mode_vs_emptiness(config.mode, dest.nonempty)?;

    if config.mode != Mode::Full {
        check_no_live_postmaster(dest_pgdata)?;
        check_no_residual_backup_label(dest)?;
        check_clean_shutdown(dest)?;
        check_system_identity(source_descriptor, source, dest)?;
    }

    if config.mode == Mode::Ptrack {
        check_ptrack_capability(source_descriptor)?;
    }

    check_replica_backup_support(source_descriptor)?;

    Ok(())
}

fn check_mode_vs_emptiness(mode: Mode, dest_nonempty: bool) -> CatchupResult<()> {
    match (mode, dest_nonempty) {
        (Mode::Full, true) => Err(CatchupError::PreconditionViolation(
            "FULL mode requires an empty destination".into(),
        )),
        (Mode::Delta | Mode::Ptrack, false) => Err(CatchupError::PreconditionViolation(format!(
            "{mode:?} mode requires a non-empty destination"
        ))),
        _ => Ok(()),
    }
}

fn check_no_live_postmaster(dest_pgdata: &Utf8Path) -> CatchupResult<()> {
    match lock_file::check_postmaster(dest_pgdata.as_std_path()) {
        Ok(PostmasterStatus::Running(pid)) => Err(CatchupError::PreconditionViolation(format!(
            "destination postmaster is running (pid {pid})"
        ))),
        Ok(PostmasterStatus::NotRunning | PostmasterStatus::StaleLock) => Ok(()),
        Err(e) => Err(CatchupError::PreconditionViolation(format!("destination lock file: {e}"))),
    }
}

fn check_no_residual_backup_label(dest: &DestinationState) -> CatchupResult<()> {
    if dest.has_backup_label {
        return Err(CatchupError::PreconditionViolation(
            "destination has a residual backup_label from a previous, uncompleted backup".into(),
        ));
    }
    Ok(())
}

fn check_clean_shutdown(dest: &DestinationState) -> CatchupResult<()> {
    let control = dest
        .control
        .as_ref()
        .ok_or_else(|| CatchupError::PreconditionViolation("destination has no control file".into()))?;
    if !control.state.is_clean_shutdown() {
        return Err(CatchupError::PreconditionViolation(format!(
            "destination is not cleanly shut down (state {:?})",
            control.state
        )));
    }
    Ok(())
}

fn check_system_identity(
    source_descriptor: &NodeDescriptor,
    source: &SourceProbeResult,
    dest: &DestinationState,
) -> CatchupResult<()> {
    let dest_id: SystemId = dest
        .control
        .as_ref()
        .map(|cf| cf.system_identifier)
        .ok_or_else(|| CatchupError::PreconditionViolation("destination has no control file".into()))?;

    if source_descriptor.system_identifier != source.on_disk_system_identifier {
        return Err(CatchupError::PreconditionViolation(format!(
            "source session reports system identifier {} but source data directory reads {}",
            source_descriptor.system_identifier, source.on_disk_system_identifier
        )));
    }
    if source_descriptor.system_identifier != dest_id {
        return Err(CatchupError::PreconditionViolation(format!(
            "source system identifier {} does not match destination {}",
            source_descriptor.system_identifier, dest_id
        )));
    }
    Ok(())
}

fn check_ptrack_capability(source_descriptor: &NodeDescriptor) -> CatchupResult<()> {
    if !source_descriptor.ptrack_usable() {
        return Err(CatchupError::PreconditionViolation(
            "PTRACK mode requires the block-change tracking extension, version >= 2.0, enabled on the source".into(),
        ));
    }
    Ok(())
}

fn check_replica_backup_support(source_descriptor: &NodeDescriptor) -> CatchupResult<()> {
    if source_descriptor.is_replica && !source_descriptor.supports_non_exclusive_backup() {
        return Err(CatchupError::PreconditionViolation(
            "a replica source requires non-exclusive backup mode (server >= 9.6)".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeDescriptor;
    use crate::probe;
    use crate::test_support::{build_fake_pgdata, write_control_file_full, DEFAULT_SYSTEM_IDENTIFIER};
    use postgres_ffi::controlfile::ControlFileData;
    use utils::id::TimelineId;
    use utils::lsn::Lsn;

    fn descriptor() -> NodeDescriptor {
        NodeDescriptor {
            server_version_num: 160_000,
            server_version_str: "16.0".into(),
            is_replica: false,
            has_elevated_rights: true,
            ptrack_version: Some((2, 5)),
            ptrack_enabled: true,
            checksum_version: 1,
            ptrack_schema: Some("ptrack".into()),
            system_identifier: SystemId(DEFAULT_SYSTEM_IDENTIFIER),
        }
    }

    fn probe_result() -> SourceProbeResult {
        SourceProbeResult {
            descriptor: descriptor(),
            current_timeline: TimelineId(1),
            wal_segment_size: postgres_ffi::pg_constants::DEFAULT_WAL_SEGMENT_SIZE,
            on_disk_system_identifier: SystemId(DEFAULT_SYSTEM_IDENTIFIER),
        }
    }

    fn config(mode: Mode) -> Config {
        Config {
            source_pgdata: "/src".into(),
            dest_pgdata: "/dst".into(),
            mode,
            num_threads: 1,
            sync_destination: true,
            tablespace_mappings: Vec::new(),
            archive_timeout: None,
            connection: postgres_connection::ConnectionOptions::new("localhost", 5432, "postgres", "postgres"),
            remote_source: false,
        }
    }

    #[test]
    fn full_mode_rejects_nonempty_destination() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("PG_VERSION"), "16\n").unwrap();
        let dest = inspect_destination(dir.path()).unwrap();
        let err = validate(&config(Mode::Full), &descriptor(), &probe_result(), dir.path(), &dest).unwrap_err();
        assert!(matches!(err, CatchupError::PreconditionViolation(_)));
    }

    #[test]
    fn delta_mode_requires_clean_shutdown_and_matching_identity() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_fake_pgdata(dir.path(), DEFAULT_SYSTEM_IDENTIFIER);
        let dest = inspect_destination(dir.path()).unwrap();
        assert!(dest.nonempty);
        validate(&config(Mode::Delta), &descriptor(), &probe_result(), dir.path(), &dest).unwrap();
    }

    #[test]
    fn delta_mode_rejects_identity_mismatch() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_fake_pgdata(dir.path(), 0xdeadbeef);
        let dest = inspect_destination(dir.path()).unwrap();
        let err = validate(&config(Mode::Delta), &descriptor(), &probe_result(), dir.path(), &dest).unwrap_err();
        assert!(matches!(err, CatchupError::PreconditionViolation(_)));
    }

    #[test]
    fn delta_mode_rejects_dirty_shutdown_state() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_fake_pgdata(dir.path(), DEFAULT_SYSTEM_IDENTIFIER);
        let cf_path = dir.path().join(postgres_ffi::pg_constants::PG_CONTROL_FILE);
        let mut cf = ControlFileData::read_from(cf_path.as_std_path()).unwrap();
        cf.state = postgres_ffi::controlfile::DbState::InProduction;
        write_control_file_full(cf_path.as_std_path(), &cf);

        let dest = inspect_destination(dir.path()).unwrap();
        let err = validate(&config(Mode::Delta), &descriptor(), &probe_result(), dir.path(), &dest).unwrap_err();
        assert!(matches!(err, CatchupError::PreconditionViolation(_)));
    }

    #[test]
    fn ptrack_mode_requires_capability() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_fake_pgdata(dir.path(), DEFAULT_SYSTEM_IDENTIFIER);
        let dest = inspect_destination(dir.path()).unwrap();

        let mut descr = descriptor();
        descr.ptrack_enabled = false;
        let mut probe = probe_result();
        probe.descriptor = descr.clone();

        let err = validate(&config(Mode::Ptrack), &descr, &probe, dir.path(), &dest).unwrap_err();
        assert!(matches!(err, CatchupError::PreconditionViolation(_)));
    }

    #[test]
    fn replica_source_requires_non_exclusive_backup_support() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_fake_pgdata(dir.path(), DEFAULT_SYSTEM_IDENTIFIER);
        let dest = inspect_destination(dir.path()).unwrap();

        let mut descr = descriptor();
        descr.is_replica = true;
        descr.server_version_num = 90_400;
        let mut probe = probe_result();
        probe.descriptor = descr.clone();

        let err = validate(&config(Mode::Delta), &descr, &probe, dir.path(), &dest).unwrap_err();
        assert!(matches!(err, CatchupError::PreconditionViolation(_)));
    }

    #[tokio::test]
    async fn probe_then_validate_roundtrip_on_matching_directories() {
        let src_dir = camino_tempfile::tempdir().unwrap();
        let dst_dir = camino_tempfile::tempdir().unwrap();
        build_fake_pgdata(src_dir.path(), DEFAULT_SYSTEM_IDENTIFIER);
        build_fake_pgdata(dst_dir.path(), DEFAULT_SYSTEM_IDENTIFIER);

        let session = crate::test_support::FakeSourceSession {
            system_identifier_value: DEFAULT_SYSTEM_IDENTIFIER,
            ..Default::default()
        };
        let probed = probe::probe_source(&session, src_dir.path()).await.unwrap();
        let dest = inspect_destination(dst_dir.path()).unwrap();
        validate(&config(Mode::Delta), &probed.descriptor.clone(), &probed, dst_dir.path(), &dest).unwrap();
    }
}
