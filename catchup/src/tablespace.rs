//! Tablespace Resolver (`spec.md` §4.2): maps each non-empty source
//! tablespace symlink to an operator-supplied destination path, and
//! enforces the completeness and emptiness rules around that mapping.

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Mode;
use crate::error::{CatchupError, CatchupResult};

/// A set of (source-absolute → destination-absolute) pairs. Lookup by
/// source path returns the input unchanged when no mapping exists
/// (`spec.md` §3) — the resolver itself decides whether that absence is
/// fatal.
#[derive(Clone, Debug, Default)]
pub struct TablespaceMapping {
    pairs: Vec<(Utf8PathBuf, Utf8PathBuf)>,
}

impl TablespaceMapping {
    pub fn new(pairs: Vec<(Utf8PathBuf, Utf8PathBuf)>) -> Self {
        TablespaceMapping { pairs }
    }

    pub fn lookup<'a>(&'a self, source_path: &'a Utf8Path) -> &'a Utf8Path {
        self.pairs
            .iter()
            .find(|(src, _)| src == source_path)
            .map(|(_, dst)| dst.as_path())
            .unwrap_or(source_path)
    }

    fn has_mapping(&self, source_path: &Utf8Path) -> bool {
        self.pairs.iter().any(|(src, _)| src == source_path)
    }
}

/// One tablespace as reported by the source: the symlink's logical path
/// under `pg_tblspc/` and the absolute target it currently points at.
pub struct TablespaceLocation {
    pub target: Utf8PathBuf,
    pub nonempty: bool,
}

/// Reads `pg_tblspc/` directly, independent of the full inventory walk,
/// so the resolver can run ahead of File Inventory (`spec.md` §2 control
/// flow: Tablespace Resolver runs in the 3/4 phase, File Inventory later
/// in the 5/7/8 phase).
pub fn discover(source_pgdata: &Utf8Path) -> CatchupResult<Vec<TablespaceLocation>> {
    let tblspc_dir = source_pgdata.join(postgres_ffi::pg_constants::PG_TBLSPC_DIR);
    let entries = match std::fs::read_dir(tblspc_dir.as_std_path()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CatchupError::io(&tblspc_dir, e)),
    };

    let mut locations = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CatchupError::io(&tblspc_dir, e))?;
        let path = entry.path();
        let target = std::fs::read_link(&path).map_err(|e| CatchupError::io(&tblspc_dir, e))?;
        let target = Utf8PathBuf::try_from(target)
            .map_err(|e| CatchupError::PreconditionViolation(format!("non-utf8 tablespace target: {e}")))?;
        let nonempty = std::fs::read_dir(target.as_std_path())
            .map(|mut it| it.next().is_some())
            .unwrap_or(false);
        locations.push(TablespaceLocation { target, nonempty });
    }
    Ok(locations)
}

/// Validates every tablespace location against the mapping, per the
/// local/remote split of §4.2: a missing mapping is fatal when source and
/// destination share a host, a warning otherwise (returned in the result
/// so the caller can log it — the resolver itself never logs).
pub fn resolve(
    mode: Mode,
    mapping: &TablespaceMapping,
    locations: &[TablespaceLocation],
    remote_source: bool,
) -> CatchupResult<Vec<String>> {
    let mut warnings = Vec::new();

    for loc in locations {
        if !loc.nonempty {
            continue;
        }

        if !mapping.has_mapping(&loc.target) {
            if remote_source {
                warnings.push(format!(
                    "tablespace at {} has no destination mapping; source remains authoritative for the symlink target",
                    loc.target
                ));
                continue;
            }
            return Err(CatchupError::MappingError(format!(
                "tablespace at {} requires a destination mapping",
                loc.target
            )));
        }

        let dest = mapping.lookup(&loc.target);
        if !dest.is_absolute() {
            return Err(CatchupError::MappingError(format!(
                "mapping for {} must be an absolute path, got {dest}",
                loc.target
            )));
        }

        if mode == Mode::Full && dest_nonempty(dest)? {
            return Err(CatchupError::MappingError(format!(
                "FULL mode requires an empty mapped tablespace destination, but {dest} is non-empty"
            )));
        }
    }

    Ok(warnings)
}

fn dest_nonempty(path: &Utf8Path) -> CatchupResult<bool> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CatchupError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tablespaces_requires_no_mapping() {
        let mapping = TablespaceMapping::default();
        let warnings = resolve(Mode::Delta, &mapping, &[], false).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn local_missing_mapping_is_fatal() {
        let mapping = TablespaceMapping::default();
        let locations = vec![TablespaceLocation { target: "/srv/ts/a".into(), nonempty: true }];
        let err = resolve(Mode::Delta, &mapping, &locations, false).unwrap_err();
        assert!(matches!(err, CatchupError::MappingError(_)));
    }

    #[test]
    fn remote_missing_mapping_is_a_warning() {
        let mapping = TablespaceMapping::default();
        let locations = vec![TablespaceLocation { target: "/srv/ts/a".into(), nonempty: true }];
        let warnings = resolve(Mode::Delta, &mapping, &locations, true).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn mapping_must_be_absolute() {
        let mapping = TablespaceMapping::new(vec![("/srv/ts/a".into(), "relative/path".into())]);
        let locations = vec![TablespaceLocation { target: "/srv/ts/a".into(), nonempty: true }];
        let err = resolve(Mode::Delta, &mapping, &locations, false).unwrap_err();
        assert!(matches!(err, CatchupError::MappingError(_)));
    }

    #[test]
    fn full_mode_requires_empty_mapped_destination() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("datafile"), b"x").unwrap();
        let mapping = TablespaceMapping::new(vec![("/srv/ts/a".into(), dir.path().to_path_buf())]);
        let locations = vec![TablespaceLocation { target: "/srv/ts/a".into(), nonempty: true }];
        let err = resolve(Mode::Full, &mapping, &locations, false).unwrap_err();
        assert!(matches!(err, CatchupError::MappingError(_)));
    }

    #[test]
    fn full_mode_accepts_empty_mapped_destination() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mapping = TablespaceMapping::new(vec![("/srv/ts/a".into(), dir.path().to_path_buf())]);
        let locations = vec![TablespaceLocation { target: "/srv/ts/a".into(), nonempty: true }];
        resolve(Mode::Full, &mapping, &locations, false).unwrap();
    }

    #[test]
    fn empty_tablespace_location_is_skipped_even_without_mapping() {
        let mapping = TablespaceMapping::default();
        let locations = vec![TablespaceLocation { target: "/srv/ts/a".into(), nonempty: false }];
        let warnings = resolve(Mode::Delta, &mapping, &locations, false).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn discover_finds_tablespace_symlinks_and_their_emptiness() {
        let source = camino_tempfile::tempdir().unwrap();
        let ts_target = camino_tempfile::tempdir().unwrap();
        std::fs::write(ts_target.path().join("16384"), b"x").unwrap();
        std::fs::create_dir_all(source.path().join("pg_tblspc")).unwrap();
        std::os::unix::fs::symlink(ts_target.path().as_std_path(), source.path().join("pg_tblspc/16400").as_std_path()).unwrap();

        let locations = discover(source.path()).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].target, ts_target.path().to_path_buf());
        assert!(locations[0].nonempty);
    }

    #[test]
    fn discover_returns_empty_when_no_tblspc_dir() {
        let source = camino_tempfile::tempdir().unwrap();
        assert!(discover(source.path()).unwrap().is_empty());
    }
}
