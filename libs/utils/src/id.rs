//! Small newtypes for the identifiers the catchup engine compares across
//! source and destination: a WAL timeline number and a cluster system
//! identifier.

use std::fmt;
use std::str::FromStr;

/// A PostgreSQL timeline id: a small integer, not a Neon-style branch UUID.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct TimelineId(pub u32);

impl TimelineId {
    pub const INITIAL: TimelineId = TimelineId(1);
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TimelineId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(TimelineId)
    }
}

impl From<u32> for TimelineId {
    fn from(n: u32) -> Self {
        TimelineId(n)
    }
}

/// The `system_identifier` field of the control file: a random 64-bit value
/// fixed at `initdb` time that must match between two PostgreSQL data
/// directories for them to be considered the same cluster lineage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct SystemId(pub u64);

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_id_parses() {
        assert_eq!("3".parse::<TimelineId>().unwrap(), TimelineId(3));
    }

    #[test]
    fn system_id_equality() {
        assert_eq!(SystemId(42), SystemId(42));
        assert_ne!(SystemId(42), SystemId(43));
    }
}
