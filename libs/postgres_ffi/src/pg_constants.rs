//! Constants describing the on-disk layout of a PostgreSQL data directory,
//! mirrored from the values `postgres_ffi::pg_constants` carries for each
//! supported server version. `pg_catchup` only needs the subset relevant to
//! classifying and sizing files, not the full page/heap layout.

/// Default WAL segment size in bytes (`--wal-segsize` default, 16MiB).
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Page size used for the page-level change bitmap; PostgreSQL's `BLCKSZ`.
pub const BLCKSZ: u32 = 8192;

/// Default size of one relation fork's segment file before it rolls over,
/// in blocks (1GiB / BLCKSZ).
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / BLCKSZ;

pub const DEFAULTTABLESPACE_OID: u32 = 1663;
pub const GLOBALTABLESPACE_OID: u32 = 1664;

pub const PG_TBLSPC_DIR: &str = "pg_tblspc";
pub const PG_WAL_DIR: &str = "pg_wal";
pub const PG_XLOG_DIR: &str = "pg_xlog";
pub const BACKUP_LABEL_FILE: &str = "backup_label";
pub const TABLESPACE_MAP_FILE: &str = "tablespace_map";
pub const PG_CONTROL_FILE: &str = "global/pg_control";
pub const RELATION_MAP_FILE: &str = "global/pg_filenode.map";

/// Top-level directories whose full contents get walked (besides the WAL
/// directory, which is excluded from the data transfer per the spec).
pub const PGDATA_SUBDIRS: &[&str] = &[
    "base",
    "global",
    "pg_tblspc",
    "pg_twophase",
    "pg_multixact",
    "pg_multixact/members",
    "pg_multixact/offsets",
    "pg_xact",
    "pg_commit_ts",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_stat",
    "pg_stat_tmp",
    "pg_subtrans",
    "pg_replslot",
];

/// Files that must never be copied verbatim: either because they are
/// produced fresh at every finalize (the control file) or because the
/// backup protocol produces their replacement at the end of the run.
pub const NEVER_COPY_VERBATIM: &[&str] = &[PG_CONTROL_FILE, BACKUP_LABEL_FILE, TABLESPACE_MAP_FILE];
