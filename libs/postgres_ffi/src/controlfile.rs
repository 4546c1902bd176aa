//! A minimal, self-consistent encoding of the fields of PostgreSQL's
//! control file (`global/pg_control`) that the catchup engine reads and
//! writes: cluster identity, shutdown state, and the checkpoint/redo LSNs
//! that together make up the "Redo params" of the spec's data model.
//!
//! This is not byte-compatible with a real `pg_control` file — reproducing
//! that binary layout is the server's job, not this tool's — but it is a
//! fixed, checksummed layout that `pg_catchup` reads back exactly as it
//! writes it, which is all the Finalizer and Preflight Validator need.

use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use utils::id::{SystemId, TimelineId};
use utils::lsn::Lsn;

const MAGIC: u32 = 0x5043_4146; // "PCAF"
const FORMAT_VERSION: u32 = 1;
/// Real PostgreSQL pads `pg_control` to a full sector; we do the same so a
/// destination file looks the size a recovering engine expects.
pub const CONTROL_FILE_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DbState {
    Starting,
    InProduction,
    Shutdowning,
    ShutdownedClean,
    ShutdownedInRecovery,
    InCrashRecovery,
    InArchiveRecovery,
}

impl DbState {
    fn to_tag(self) -> u32 {
        match self {
            DbState::Starting => 0,
            DbState::ShutdownedClean => 1,
            DbState::ShutdownedInRecovery => 2,
            DbState::InCrashRecovery => 3,
            DbState::InArchiveRecovery => 4,
            DbState::Shutdowning => 5,
            DbState::InProduction => 6,
        }
    }

    fn from_tag(tag: u32) -> Result<Self, ControlFileError> {
        Ok(match tag {
            0 => DbState::Starting,
            1 => DbState::ShutdownedClean,
            2 => DbState::ShutdownedInRecovery,
            3 => DbState::InCrashRecovery,
            4 => DbState::InArchiveRecovery,
            5 => DbState::Shutdowning,
            6 => DbState::InProduction,
            other => return Err(ControlFileError::Corrupt(format!("unknown db state tag {other}"))),
        })
    }

    /// True for the two states the Preflight Validator accepts on a
    /// non-FULL destination.
    pub fn is_clean_shutdown(self) -> bool {
        matches!(self, DbState::ShutdownedClean | DbState::ShutdownedInRecovery)
    }
}

/// The "Redo params" of the data model: the destination's last durable
/// checkpoint, as read from its control file.
#[derive(Clone, Copy, Debug)]
pub struct RedoParams {
    pub timeline: TimelineId,
    pub redo_lsn: Lsn,
    pub prior_checkpoint: Lsn,
}

#[derive(Clone, Debug)]
pub struct ControlFileData {
    pub system_identifier: SystemId,
    pub state: DbState,
    pub timeline: TimelineId,
    pub redo_lsn: Lsn,
    pub prior_checkpoint: Lsn,
    pub min_recovery_point: Lsn,
    pub min_recovery_point_tli: TimelineId,
}

impl ControlFileData {
    pub fn redo_params(&self) -> RedoParams {
        RedoParams {
            timeline: self.timeline,
            redo_lsn: self.redo_lsn,
            prior_checkpoint: self.prior_checkpoint,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONTROL_FILE_SIZE);
        buf.write_u32::<LittleEndian>(MAGIC).unwrap();
        buf.write_u32::<LittleEndian>(FORMAT_VERSION).unwrap();
        buf.write_u64::<LittleEndian>(self.system_identifier.0).unwrap();
        buf.write_u32::<LittleEndian>(self.state.to_tag()).unwrap();
        buf.write_u32::<LittleEndian>(self.timeline.0).unwrap();
        buf.write_u64::<LittleEndian>(self.redo_lsn.0).unwrap();
        buf.write_u64::<LittleEndian>(self.prior_checkpoint.0).unwrap();
        buf.write_u64::<LittleEndian>(self.min_recovery_point.0).unwrap();
        buf.write_u32::<LittleEndian>(self.min_recovery_point_tli.0).unwrap();

        let crc = crc32c::crc32c(&buf);
        buf.write_u32::<LittleEndian>(crc).unwrap();

        buf.resize(CONTROL_FILE_SIZE, 0);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ControlFileError> {
        if bytes.len() < CONTROL_FILE_SIZE {
            return Err(ControlFileError::Corrupt(format!(
                "control file is {} bytes, expected at least {CONTROL_FILE_SIZE}",
                bytes.len()
            )));
        }
        let mut cur = io::Cursor::new(bytes);
        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(ControlFileError::Corrupt(format!("bad magic {magic:#x}")));
        }
        let version = cur.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(ControlFileError::Corrupt(format!("unsupported version {version}")));
        }
        let system_identifier = SystemId(cur.read_u64::<LittleEndian>()?);
        let state = DbState::from_tag(cur.read_u32::<LittleEndian>()?)?;
        let timeline = TimelineId(cur.read_u32::<LittleEndian>()?);
        let redo_lsn = Lsn(cur.read_u64::<LittleEndian>()?);
        let prior_checkpoint = Lsn(cur.read_u64::<LittleEndian>()?);
        let min_recovery_point = Lsn(cur.read_u64::<LittleEndian>()?);
        let min_recovery_point_tli = TimelineId(cur.read_u32::<LittleEndian>()?);

        let payload_len = cur.position() as usize;
        let stored_crc = cur.read_u32::<LittleEndian>()?;
        let computed_crc = crc32c::crc32c(&bytes[..payload_len]);
        if stored_crc != computed_crc {
            return Err(ControlFileError::ChecksumMismatch);
        }

        Ok(ControlFileData {
            system_identifier,
            state,
            timeline,
            redo_lsn,
            prior_checkpoint,
            min_recovery_point,
            min_recovery_point_tli,
        })
    }

    pub fn read_from(path: &Path) -> Result<Self, ControlFileError> {
        let mut file = std::fs::File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Self::decode(&bytes)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ControlFileError> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.encode())?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlFileError {
    #[error("control file io error: {0}")]
    Io(#[from] io::Error),
    #[error("control file is corrupt: {0}")]
    Corrupt(String),
    #[error("control file checksum mismatch")]
    ChecksumMismatch,
}
