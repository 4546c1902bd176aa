//! Classifies a data-directory-relative path as a relation data file (one
//! the block-aware copier may skip-rewrite by LSN or page bitmap) or not
//! (copied whole). Mirrors the matching `parse_relfilename` does against
//! PostgreSQL's `<relfilenode>[_forkname][.segno]` naming.

const FORK_SUFFIXES: &[&str] = &["_fsm", "_vm", "_init"];

/// True if `rel_path` (POSIX, relative to the data directory) names a
/// relation data file under `base/`, `global/`, or a tablespace's `pg_tblspc`
/// subtree.
pub fn is_data_file(rel_path: &str) -> bool {
    let Some(file_name) = rel_path.rsplit('/').next() else {
        return false;
    };
    let under_relation_dir = rel_path.starts_with("base/")
        || rel_path.starts_with("global/")
        || rel_path.starts_with("pg_tblspc/");
    under_relation_dir && parse_relfilename(file_name).is_some()
}

/// Parsed components of a relation file name: the base relfilenode oid, an
/// optional fork suffix, and an optional segment number for files that have
/// rolled over past `RELSEG_SIZE` blocks.
#[derive(Debug, Eq, PartialEq)]
pub struct RelFileName<'a> {
    pub relnode: u32,
    pub fork_suffix: Option<&'a str>,
    pub segno: u32,
}

pub fn parse_relfilename(name: &str) -> Option<RelFileName<'_>> {
    let (base, segno) = match name.split_once('.') {
        Some((base, seg)) => (base, seg.parse().ok()?),
        None => (name, 0),
    };

    let (digits, fork_suffix) = match FORK_SUFFIXES.iter().find(|suf| base.ends_with(*suf)) {
        Some(suf) => (&base[..base.len() - suf.len()], Some(*suf)),
        None => (base, None),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let relnode = digits.parse().ok()?;

    Some(RelFileName { relnode, fork_suffix, segno })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_main_fork() {
        assert_eq!(
            parse_relfilename("16384"),
            Some(RelFileName { relnode: 16384, fork_suffix: None, segno: 0 })
        );
    }

    #[test]
    fn segmented_file() {
        assert_eq!(
            parse_relfilename("16384.3"),
            Some(RelFileName { relnode: 16384, fork_suffix: None, segno: 3 })
        );
    }

    #[test]
    fn fsm_fork() {
        assert_eq!(
            parse_relfilename("16384_fsm"),
            Some(RelFileName { relnode: 16384, fork_suffix: Some("_fsm"), segno: 0 })
        );
    }

    #[test]
    fn rejects_non_numeric() {
        assert!(parse_relfilename("pg_control").is_none());
    }

    #[test]
    fn classifies_data_files_by_directory() {
        assert!(is_data_file("base/1/1259"));
        assert!(is_data_file("global/2619"));
        assert!(is_data_file("pg_tblspc/16400/PG_16_202307071/1/16385"));
        assert!(!is_data_file("base/1/PG_VERSION"));
        assert!(!is_data_file("pg_xact/0000"));
    }
}
