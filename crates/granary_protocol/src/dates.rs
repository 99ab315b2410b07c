//! Load-date parsing and normalization.
//!
//! Exactly three forms are accepted: `YYYY-MM-DD`, `YYYYMMDD` (string or
//! integer), and `MM/DD/YYYY`. Anything else is an invalid date.

use chrono::NaiveDate;

/// Parse an accepted date form into a canonical date.
///
/// Leading/trailing ASCII whitespace is ignored. Returns `None` for any
/// value outside the accepted set, including calendar-invalid dates.
pub fn parse_load_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim_matches(|c: char| c.is_ascii_whitespace());
    let b = s.as_bytes();
    match b.len() {
        10 if b[4] == b'-' && b[7] == b'-' => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
        10 if b[2] == b'/' && b[5] == b'/' => NaiveDate::parse_from_str(s, "%m/%d/%Y").ok(),
        8 if b.iter().all(u8::is_ascii_digit) => NaiveDate::parse_from_str(s, "%Y%m%d").ok(),
        _ => None,
    }
}

/// Byte-slice front end for the streaming scanner.
pub fn parse_load_date_bytes(raw: &[u8]) -> Option<NaiveDate> {
    std::str::from_utf8(raw).ok().and_then(parse_load_date)
}

/// Canonical `YYYY-MM-DD` rendering.
pub fn canonical(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Integer `YYYYMMDD` rendering, for integer-typed warehouse date columns.
pub fn yyyymmdd_int(date: NaiveDate) -> i64 {
    canonical(date).replace('-', "").parse::<i64>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn accepts_iso() {
        assert_eq!(parse_load_date("2022-09-30"), Some(d(2022, 9, 30)));
        assert_eq!(parse_load_date(" 2022-09-30 "), Some(d(2022, 9, 30)));
    }

    #[test]
    fn accepts_compact() {
        assert_eq!(parse_load_date("20220930"), Some(d(2022, 9, 30)));
    }

    #[test]
    fn accepts_us_slash() {
        assert_eq!(parse_load_date("09/30/2022"), Some(d(2022, 9, 30)));
    }

    #[test]
    fn rejects_other_forms() {
        // DD/MM/YYYY beyond month range, two-digit years, datetimes, junk.
        assert_eq!(parse_load_date("30/09/2022"), None);
        assert_eq!(parse_load_date("22-09-30"), None);
        assert_eq!(parse_load_date("2022-09-30 00:00:00"), None);
        assert_eq!(parse_load_date("2022/09/30"), None);
        assert_eq!(parse_load_date(""), None);
        assert_eq!(parse_load_date("not-a-date"), None);
    }

    #[test]
    fn rejects_calendar_invalid() {
        assert_eq!(parse_load_date("2022-02-30"), None);
        assert_eq!(parse_load_date("20221301"), None);
    }

    #[test]
    fn canonical_round_trip() {
        let date = d(2024, 1, 5);
        assert_eq!(canonical(date), "2024-01-05");
        assert_eq!(yyyymmdd_int(date), 20240105);
        assert_eq!(parse_load_date(&canonical(date)), Some(date));
    }

    #[test]
    fn bytes_front_end() {
        assert_eq!(parse_load_date_bytes(b"20240105"), Some(d(2024, 1, 5)));
        assert_eq!(parse_load_date_bytes(&[0xff, 0xfe]), None);
    }
}
