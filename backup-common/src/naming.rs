//! Backup object naming.
//!
//! Every archive is named `{id}_{year}_{month}_{day}` (plus an extension), so
//! the retention pass can recover the owning job and the backup date from the
//! key alone without querying object metadata.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone};
use regex::Regex;

/// Extension appended to generated names for zip archives.
pub const ARCHIVE_EXTENSION: &str = "zip";

const NAME_PATTERN: &str = r"^([a-zA-Z0-9_]+)_(\d{4})_(\d{2})_(\d{2})";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("invalid backup name format: {0}")]
    InvalidFormat(String),
    #[error("invalid month value: {0}")]
    InvalidMonth(u32),
    #[error("invalid day value: {0}")]
    InvalidDay(u32),
}

/// Fields recovered from an encoded backup name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub prefix: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl ParsedName {
    /// Calendar date the name denotes.
    ///
    /// Days past the end of the month roll into the next month, so
    /// `2024_02_30` is 2024-03-01.
    pub fn date(&self) -> Option<NaiveDate> {
        let first = NaiveDate::from_ymd_opt(self.year, self.month, 1)?;
        first.checked_add_signed(Duration::days(i64::from(self.day) - 1))
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.prefix.eq_ignore_ascii_case(owner_id)
    }
}

/// Encoder/decoder for date-stamped backup names.
#[derive(Debug, Clone)]
pub struct NameCodec {
    pattern: Regex,
}

impl Default for NameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl NameCodec {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(NAME_PATTERN).expect("name pattern is valid"),
        }
    }

    /// `{prefix}_{YYYY}_{MM}_{DD}` for the calendar date of `time` in its own zone.
    pub fn generate<Tz: TimeZone>(&self, prefix: &str, time: &DateTime<Tz>) -> String {
        format!(
            "{}_{:04}_{:02}_{:02}",
            prefix,
            time.year(),
            time.month(),
            time.day()
        )
    }

    pub fn archive_name<Tz: TimeZone>(&self, prefix: &str, time: &DateTime<Tz>) -> String {
        format!("{}.{}", self.generate(prefix, time), ARCHIVE_EXTENSION)
    }

    /// Parse a name produced by [`NameCodec::generate`]. Anything after the
    /// day field (time suffixes, extensions) is ignored.
    pub fn parse(&self, name: &str) -> Result<ParsedName, NameError> {
        let caps = self
            .pattern
            .captures(name)
            .ok_or_else(|| NameError::InvalidFormat(name.to_string()))?;

        let year: i32 = caps[2]
            .parse()
            .map_err(|_| NameError::InvalidFormat(name.to_string()))?;
        let month: u32 = caps[3]
            .parse()
            .map_err(|_| NameError::InvalidFormat(name.to_string()))?;
        if !(1..=12).contains(&month) {
            return Err(NameError::InvalidMonth(month));
        }
        let day: u32 = caps[4]
            .parse()
            .map_err(|_| NameError::InvalidFormat(name.to_string()))?;
        if !(1..=31).contains(&day) {
            return Err(NameError::InvalidDay(day));
        }

        Ok(ParsedName {
            prefix: caps[1].to_string(),
            year,
            month,
            day,
        })
    }
}
