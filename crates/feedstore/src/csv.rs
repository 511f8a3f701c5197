//! CSV export helpers and the time formatting collaborator.
//!
//! Timezone localization is owned by the embedding application. The engines
//! only call [`TimeFormatter`]; [`FixedOffsetFormatter`] is the built-in
//! implementation and understands `UTC` and fixed offsets such as `+02:00`.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use std::io::{self, Write};

/// Formats timestamps for CSV output and resolves local day boundaries.
pub trait TimeFormatter: Send + Sync {
    /// Returns the UTC offset of `timezone` at `unix_secs`.
    fn utc_offset(&self, timezone: &str, unix_secs: i64) -> FixedOffset;

    /// Renders `unix_secs` in `timezone`.
    fn format_time(&self, unix_secs: i64, timezone: &str) -> String {
        let offset = self.utc_offset(timezone, unix_secs);
        match DateTime::<Utc>::from_timestamp(unix_secs, 0) {
            Some(utc) => utc
                .with_timezone(&offset)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            None => unix_secs.to_string(),
        }
    }
}

/// Formatter for `UTC` and numeric fixed offsets (`+HH:MM`, `+HHMM`, `+HH`).
///
/// Unknown zone names fall back to UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedOffsetFormatter;

impl FixedOffsetFormatter {
    fn parse_offset(timezone: &str) -> Option<FixedOffset> {
        let tz = timezone.trim();
        if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
            return Some(Utc.fix());
        }

        let (sign, rest) = match tz.as_bytes().first()? {
            b'+' => (1, &tz[1..]),
            b'-' => (-1, &tz[1..]),
            _ => return None,
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        let (hours, minutes) = match digits.len() {
            2 => (digits.parse::<i32>().ok()?, 0),
            4 => (
                digits[..2].parse::<i32>().ok()?,
                digits[2..].parse::<i32>().ok()?,
            ),
            _ => return None,
        };
        if minutes >= 60 {
            return None;
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
    }
}

impl TimeFormatter for FixedOffsetFormatter {
    fn utc_offset(&self, timezone: &str, _unix_secs: i64) -> FixedOffset {
        Self::parse_offset(timezone).unwrap_or_else(|| Utc.fix())
    }
}

/// Number formatting for CSV values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvOptions {
    /// Digits after the decimal separator.
    pub decimal_places: usize,
    /// Decimal separator.
    pub decimal_separator: char,
    /// Field separator between time and value.
    pub field_separator: char,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            decimal_places: 2,
            decimal_separator: '.',
            field_separator: ',',
        }
    }
}

/// A CSV export request. `start`/`end` are unix seconds.
#[derive(Debug, Clone)]
pub struct CsvRequest<'a> {
    /// Range start in unix seconds.
    pub start: i64,
    /// Range end in unix seconds.
    pub end: i64,
    /// Output interval in seconds.
    pub interval: u32,
    /// Timezone passed to the [`TimeFormatter`].
    pub timezone: &'a str,
    /// Number formatting.
    pub options: CsvOptions,
}

impl<'a> CsvRequest<'a> {
    /// Creates a UTC request with default number formatting.
    pub fn new(start: i64, end: i64, interval: u32) -> Self {
        Self {
            start,
            end,
            interval,
            timezone: "UTC",
            options: CsvOptions::default(),
        }
    }

    /// Sets the timezone.
    pub fn timezone(mut self, timezone: &'a str) -> Self {
        self.timezone = timezone;
        self
    }

    /// Sets the number formatting.
    pub fn options(mut self, options: CsvOptions) -> Self {
        self.options = options;
        self
    }
}

/// Writes CSV lines for one request.
pub(crate) struct CsvWriter<'a> {
    out: &'a mut dyn Write,
    formatter: &'a dyn TimeFormatter,
    timezone: &'a str,
    options: &'a CsvOptions,
    lines: u64,
}

impl<'a> CsvWriter<'a> {
    pub(crate) fn new(
        out: &'a mut dyn Write,
        formatter: &'a dyn TimeFormatter,
        request: &'a CsvRequest<'a>,
    ) -> Self {
        Self {
            out,
            formatter,
            timezone: request.timezone,
            options: &request.options,
            lines: 0,
        }
    }

    /// Writes `<time><sep><value>\n`.
    pub(crate) fn write_line(&mut self, unix_secs: i64, value: f64) -> io::Result<()> {
        let time = self.formatter.format_time(unix_secs, self.timezone);
        let value = format_number(value, self.options);
        writeln!(
            self.out,
            "{}{}{}",
            time, self.options.field_separator, value
        )?;
        self.lines += 1;
        Ok(())
    }

    pub(crate) fn finish(self) -> io::Result<u64> {
        self.out.flush()?;
        Ok(self.lines)
    }
}

fn format_number(value: f64, options: &CsvOptions) -> String {
    let text = format!("{:.*}", options.decimal_places, value);
    if options.decimal_separator == '.' {
        text
    } else {
        text.replace('.', &options.decimal_separator.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offsets() {
        let hour = 3600;
        assert_eq!(
            FixedOffsetFormatter::parse_offset("UTC").unwrap().local_minus_utc(),
            0
        );
        assert_eq!(
            FixedOffsetFormatter::parse_offset("+02:00").unwrap().local_minus_utc(),
            2 * hour
        );
        assert_eq!(
            FixedOffsetFormatter::parse_offset("-0530").unwrap().local_minus_utc(),
            -(5 * hour + 30 * 60)
        );
        assert!(FixedOffsetFormatter::parse_offset("Europe/Berlin").is_none());
    }

    #[test]
    fn test_format_time_with_offset() {
        let formatter = FixedOffsetFormatter;
        assert_eq!(formatter.format_time(0, "UTC"), "1970-01-01 00:00:00");
        assert_eq!(formatter.format_time(0, "+01:00"), "1970-01-01 01:00:00");
    }

    #[test]
    fn test_format_number() {
        let options = CsvOptions {
            decimal_places: 3,
            decimal_separator: ',',
            field_separator: ';',
        };
        assert_eq!(format_number(1.5, &options), "1,500");
        assert_eq!(format_number(2.0, &CsvOptions::default()), "2.00");
    }

    #[test]
    fn test_csv_writer_lines() {
        let request = CsvRequest::new(0, 10, 1);
        let formatter = FixedOffsetFormatter;
        let mut buf = Vec::new();
        let mut writer = CsvWriter::new(&mut buf, &formatter, &request);
        writer.write_line(0, 1.25).unwrap();
        writer.write_line(60, 2.0).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "1970-01-01 00:00:00,1.25\n1970-01-01 00:01:00,2.00\n"
        );
    }
}
