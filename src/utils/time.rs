use anyhow::Result;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Source of "now" for scan timestamps and the dedup window.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parses the date of a new session. Accepts RFC 3339, a `datetime-local`
/// style `YYYY-MM-DDTHH:MM` (interpreted in local time), or a bare date.
pub fn parse_session_date(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(datetime) = DateTime::parse_from_rfc3339(input) {
        return Ok(datetime.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return local_to_utc(naive);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return local_to_utc(midnight);
        }
    }

    Err(anyhow::anyhow!(
        "Invalid date format. Use YYYY-MM-DD, YYYY-MM-DDTHH:MM or RFC 3339"
    ))
}

fn local_to_utc(naive: NaiveDateTime) -> Result<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| anyhow::anyhow!("{} does not exist in the local time zone", naive))
}

pub fn format_time_local(datetime: DateTime<Utc>) -> String {
    datetime.with_timezone(&Local).format("%H:%M:%S").to_string()
}

pub fn format_datetime_local(datetime: DateTime<Utc>) -> String {
    datetime
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}
