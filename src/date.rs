//! Julian Day Number conversion for date keys.
//!
//! Dates are compared and indexed as JDN integers (Fliegel–Van Flandern),
//! which keeps date keys in the same non-negative numeric domain as record
//! numbers.

/// Convert a Gregorian date to its Julian Day Number.
#[must_use]
pub fn gregorian_to_jdn(year: i32, month: u32, day: u32) -> i64 {
    let a = (14 - month as i64) / 12;
    let y = year as i64 + 4800 - a;
    let m = month as i64 + 12 * a - 3;
    day as i64 + (153 * m + 2) / 5 + 365 * y + y / 4 - y / 100 + y / 400 - 32045
}

/// Parse a date string in `YYYY-MM-DD` or `YYYYMMDD` form to a JDN.
///
/// Returns `None` for anything else, including out-of-range month/day.
#[must_use]
pub fn parse_to_jdn(text: &str) -> Option<i64> {
    let s = text.trim();
    if !s.is_ascii() {
        return None;
    }
    let (year, month, day) = if s.len() == 10 && s.as_bytes()[4] == b'-' && s.as_bytes()[7] == b'-' {
        (
            s[0..4].parse().ok()?,
            s[5..7].parse().ok()?,
            s[8..10].parse().ok()?,
        )
    } else if s.len() == 8 {
        (
            s[0..4].parse().ok()?,
            s[4..6].parse().ok()?,
            s[6..8].parse().ok()?,
        )
    } else {
        return None;
    };
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(gregorian_to_jdn(year, month, day))
}

/// Convert an 8-digit `YYYYMMDD` table field to a JDN, or 0 when the field
/// is blank or malformed. Used when packing date columns into a heap map.
#[must_use]
pub fn dbf_date_to_jdn(text: &str) -> i64 {
    let s = text.trim();
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    parse_to_jdn(s).unwrap_or(0)
}

#[test]
fn test_known_jdn_values() {
    assert_eq!(2451545, gregorian_to_jdn(2000, 1, 1));
    assert_eq!(2457388, gregorian_to_jdn(2015, 12, 31));
    assert_eq!(2453371, gregorian_to_jdn(2005, 1, 1));
    assert_eq!(2454632, gregorian_to_jdn(2008, 6, 15));
    // consecutive days differ by one
    assert_eq!(
        gregorian_to_jdn(2022, 8, 25) + 1,
        gregorian_to_jdn(2022, 8, 26)
    );
}

#[test]
fn test_parse_formats() {
    assert_eq!(parse_to_jdn("2022-08-25"), parse_to_jdn("20220825"));
    assert_eq!(Some(2451545), parse_to_jdn(" 2000-01-01 "));
    assert_eq!(None, parse_to_jdn("2022/08/25"));
    assert_eq!(None, parse_to_jdn("20221325"));
    assert_eq!(None, parse_to_jdn("2022-13-01"));
    assert_eq!(None, parse_to_jdn(""));
}

#[test]
fn test_dbf_date_field() {
    assert_eq!(gregorian_to_jdn(1984, 6, 1), dbf_date_to_jdn("19840601"));
    assert_eq!(0, dbf_date_to_jdn("        "));
    assert_eq!(0, dbf_date_to_jdn("1984"));
    assert_eq!(0, dbf_date_to_jdn("1984-6-1"));
}
