// sharewatch/src/ingest/record.rs
//
// Access-log line parser. Only one record shape is recognised:
//
//   2024/05/01 12:00:00.123456 from 1.2.3.4:51234 accepted tcp:example.com:443 [in >> out] email: 42
//
// The source address may carry a transport prefix (`tcp:` / `udp:`) and IPv6
// sources are bracketed (`[2001:db8::1]:443`). Timestamps carry no zone and
// are read in the configured fixed offset.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use regex::Regex;

use crate::events::LogRecord;

const TS_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.f";

const RECORD_PATTERN: &str = concat!(
    r"^(?P<ts>\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?)\s+",
    r"from\s+(?:(?:tcp|udp):)?(?:\[(?P<v6>[0-9A-Fa-f:.]+)\]|(?P<v4>[^\s:]+)):\d+\s+",
    r"accepted\s+.*?email:\s*(?P<account>\S+)\s*$",
);

#[derive(Debug, Clone)]
pub struct RecordParser {
    pattern: Regex,
    offset:  FixedOffset,
}

impl RecordParser {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            // The pattern is a compile-time constant covered by the tests below.
            pattern: Regex::new(RECORD_PATTERN).expect("record pattern is valid"),
            offset,
        }
    }

    /// Parse a full record. None for anything that is not an accepted
    /// connection with an account marker, or whose timestamp is malformed.
    pub fn parse(&self, line: &str) -> Option<LogRecord> {
        let caps = self.pattern.captures(line.trim())?;
        let timestamp = self.parse_timestamp(caps.name("ts")?.as_str())?;
        let source_address = caps.name("v6").or_else(|| caps.name("v4"))?.as_str().to_string();
        let account_id = caps.name("account")?.as_str().to_string();
        Some(LogRecord { timestamp, source_address, account_id })
    }

    /// Timestamp from the first two whitespace-separated fields only; used by
    /// buffer pruning where the rest of the line does not matter.
    pub fn line_timestamp(&self, line: &str) -> Option<DateTime<Utc>> {
        let mut parts = line.split_whitespace();
        let date = parts.next()?;
        let time = parts.next()?;
        self.parse_timestamp(&format!("{} {}", date, time))
    }

    fn parse_timestamp(&self, raw: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(raw, TS_FORMAT).ok()?;
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str =
        "2024/05/01 12:00:00.123456 from 1.2.3.4:51234 accepted tcp:example.com:443 [vless-in >> direct] email: 42";

    #[test]
    fn parses_canonical_line() {
        let p = RecordParser::default();
        let r = p.parse(LINE).unwrap();
        assert_eq!(r.source_address, "1.2.3.4");
        assert_eq!(r.account_id, "42");
        assert_eq!(r.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(123_456));
    }

    #[test]
    fn accepts_transport_prefix_and_ipv6() {
        let p = RecordParser::default();
        let r = p.parse("2024/05/01 12:00:00.000001 from tcp:[2001:db8::7]:443 accepted udp:1.1.1.1:53 email: user@example.com").unwrap();
        assert_eq!(r.source_address, "2001:db8::7");
        assert_eq!(r.account_id, "user@example.com");

        let r = p.parse("2024/05/01 12:00:00 from udp:5.6.7.8:1000 accepted udp:8.8.8.8:53 email: 7").unwrap();
        assert_eq!(r.source_address, "5.6.7.8");
    }

    #[test]
    fn rejects_other_shapes() {
        let p = RecordParser::default();
        assert!(p.parse("").is_none());
        assert!(p.parse("2024/05/01 12:00:00.1 from 1.2.3.4:1 rejected tcp:x:443 email: 42").is_none());
        assert!(p.parse("2024/05/01 12:00:00.1 from 1.2.3.4:1 accepted tcp:x:443").is_none());
        assert!(p.parse("2024/13/45 12:00:00.1 from 1.2.3.4:1 accepted tcp:x:443 email: 42").is_none());
    }

    #[test]
    fn applies_configured_offset() {
        let p = RecordParser::new(FixedOffset::east_opt(3 * 3600).unwrap());
        let r = p.parse(LINE).unwrap();
        assert_eq!(r.timestamp.format("%H").to_string(), "09");
        assert_eq!(p.line_timestamp(LINE), Some(r.timestamp));
        assert!(p.line_timestamp("garbage").is_none());
    }
}
