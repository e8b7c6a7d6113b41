//! Stateless repositories. Every method takes `&Connection`.

pub mod machine;
pub mod message;
pub mod session;

pub use machine::MachineRepo;
pub use message::MessageRepo;
pub use session::SessionRepo;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::errors::{Result, StoreError};

/// RFC 3339 with millisecond precision; sorts lexicographically.
pub(crate) fn to_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_db_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

pub(crate) fn seq_to_db(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

pub(crate) fn seq_from_db(seq: i64) -> u64 {
    u64::try_from(seq).unwrap_or(0)
}
