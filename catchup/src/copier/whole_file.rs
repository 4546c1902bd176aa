//! Copier for everything that is not a relation data file: config files,
//! two-phase state, `PG_VERSION`, and CFS-member relations that cannot be
//! safely range-copied. Always copies the full file.

use std::fs::File;

use crate::error::CatchupError;

use super::{ByteRange, CopyParams, FileCopier};

pub struct WholeFileCopier;

impl FileCopier for WholeFileCopier {
    fn open_source(&self, params: &CopyParams) -> crate::error::CatchupResult<Option<File>> {
        match File::open(params.source_path.as_std_path()) {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CatchupError::io(params.source_path, e)),
        }
    }

    fn range_plan(&self, _params: &CopyParams, _source: &mut File, source_len: u64) -> crate::error::CatchupResult<Vec<ByteRange>> {
        Ok(vec![(0, source_len)])
    }

    fn write_destination(&self, params: &CopyParams, source: &mut File, _source_len: u64, _ranges: &[ByteRange]) -> crate::error::CatchupResult<i64> {
        if let Some(parent) = params.dest_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatchupError::io(parent, e))?;
        }
        let mut dest = File::create(params.dest_path.as_std_path()).map_err(|e| CatchupError::io(params.dest_path, e))?;
        let n = std::io::copy(source, &mut dest).map_err(|e| CatchupError::io(params.dest_path, e))?;
        Ok(n as i64)
    }
}
