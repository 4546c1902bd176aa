//! Small, dependency-light primitives shared across the `pg_catchup`
//! workspace: LSNs, cluster/timeline identifiers, lock-file inspection and
//! process-wide logging setup.

pub mod id;
pub mod lock_file;
pub mod logging;
pub mod lsn;
