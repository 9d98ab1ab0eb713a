//! Parser for server console lines of the form `HH:MM:SS [Class] message`.

use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveTime, TimeZone};
use regex::Regex;

use super::models::{LogRecord, ERROR_CLASS, MONITOR_CLASS};

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+:[0-9]+:[0-9]+) \[([a-zA-Z ]+)\] (.*)").expect("valid log line regex")
});

/// Turns raw output lines of one server into log records.
///
/// Lines without a timestamp/class prefix (stack traces, multi-line
/// messages) inherit the class and time of the last line that had one.
#[derive(Debug, Clone)]
pub struct LogLineParser {
    server_id: i64,
    last_class: String,
    last_time: DateTime<Local>,
}

impl LogLineParser {
    pub fn new(server_id: i64, start: DateTime<Local>) -> Self {
        Self {
            server_id,
            last_class: MONITOR_CLASS.to_string(),
            last_time: start,
        }
    }

    /// Parse one line. Returns the record for the line, preceded by an
    /// error record when the timestamp could not be interpreted.
    pub fn parse(&mut self, line: &str, now: DateTime<Local>) -> Vec<LogRecord> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(caps) = LINE_RE.captures(line) else {
            return vec![LogRecord::at(
                self.server_id,
                self.last_time,
                &self.last_class,
                line,
            )];
        };

        let mut records = Vec::with_capacity(1);
        let time = &caps[1];
        let class = caps[2].to_string();
        let message = caps[3].to_string();

        self.last_time = match resolve_time(time, now) {
            Ok(ts) => ts,
            Err(e) => {
                records.push(LogRecord::at(
                    self.server_id,
                    now,
                    ERROR_CLASS,
                    format!("Could not parse log timestamp '{}': {}", time, e),
                ));
                now
            }
        };
        self.last_class = class;
        records.push(LogRecord::at(
            self.server_id,
            self.last_time,
            &self.last_class,
            message,
        ));
        records
    }
}

/// Combine a time of day with the date of `now`.
fn resolve_time(time: &str, now: DateTime<Local>) -> Result<DateTime<Local>, String> {
    let tod = NaiveTime::parse_from_str(time, "%H:%M:%S").map_err(|e| e.to_string())?;
    let naive = now.date_naive().and_time(tod);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| format!("{} does not exist in the local time zone", naive))
}
