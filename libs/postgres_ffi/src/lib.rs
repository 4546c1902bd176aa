//! On-disk format knowledge shared by the catchup engine: control file
//! encoding, WAL segment naming, relation file classification, and
//! timeline history parsing. Kept dependency-light and synchronous so it
//! is trivially unit-testable without a running server.

pub mod controlfile;
pub mod history;
pub mod pg_constants;
pub mod relfile_utils;
pub mod xlog_utils;
