//! Period codes of the analytics server and time-grain bucketing.
//!
//! Supported codes: `2024` (year), `202403` (month), `20240315` (day),
//! `2024Q1` (quarter), `2024S2` (six-month), `2024W11` (ISO week). ISO dates
//! and datetimes (`2024-03-15`, `2024-03-15T08:00:00.000`) are accepted too.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    #[serde(alias = "P1D")]
    Day,
    #[serde(alias = "P1W")]
    Week,
    #[serde(alias = "P1M")]
    Month,
    #[serde(alias = "P3M")]
    Quarter,
    #[serde(alias = "P6M")]
    SixMonth,
    #[serde(alias = "P1Y")]
    Year,
}

impl TimeGrain {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "P1D" | "DAY" => Some(TimeGrain::Day),
            "P1W" | "WEEK" => Some(TimeGrain::Week),
            "P1M" | "MONTH" => Some(TimeGrain::Month),
            "P3M" | "QUARTER" => Some(TimeGrain::Quarter),
            "P6M" | "SIX_MONTH" => Some(TimeGrain::SixMonth),
            "P1Y" | "YEAR" => Some(TimeGrain::Year),
            _ => None,
        }
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(ConnectorError::InvalidQuery(format!(
                "time range starts after it ends: {} > {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

fn digits(value: &str) -> Option<u32> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        value.parse().ok()
    } else {
        None
    }
}

/// Start date of a period code, or `None` if the code is not recognized.
pub fn parse_period(code: &str) -> Option<NaiveDate> {
    let code = code.trim();
    if code.len() >= 10 && code.as_bytes().get(4) == Some(&b'-') {
        return NaiveDate::parse_from_str(&code[..10], "%Y-%m-%d").ok();
    }
    if code.len() < 4 || !code.is_char_boundary(4) {
        return None;
    }
    let year = digits(&code[..4])? as i32;
    let rest = &code[4..];
    match rest.len() {
        0 => NaiveDate::from_ymd_opt(year, 1, 1),
        2 if digits(rest).is_some() => NaiveDate::from_ymd_opt(year, digits(rest)?, 1),
        4 if digits(rest).is_some() => {
            NaiveDate::from_ymd_opt(year, digits(&rest[..2])?, digits(&rest[2..])?)
        }
        _ => {
            let (kind, number) = rest.split_at(1);
            let number = digits(number)?;
            match kind {
                "Q" if (1..=4).contains(&number) => {
                    NaiveDate::from_ymd_opt(year, (number - 1) * 3 + 1, 1)
                }
                "S" if (1..=2).contains(&number) => {
                    NaiveDate::from_ymd_opt(year, (number - 1) * 6 + 1, 1)
                }
                "W" => NaiveDate::from_isoywd_opt(year, number, Weekday::Mon),
                _ => None,
            }
        }
    }
}

/// First day of the `grain` period that contains `date`.
pub fn truncate(date: NaiveDate, grain: TimeGrain) -> NaiveDate {
    let month_start = |month: u32| NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date);
    match grain {
        TimeGrain::Day => date,
        TimeGrain::Week => date - Duration::days(date.weekday().num_days_from_monday() as i64),
        TimeGrain::Month => month_start(date.month()),
        TimeGrain::Quarter => month_start((date.month() - 1) / 3 * 3 + 1),
        TimeGrain::SixMonth => month_start((date.month() - 1) / 6 * 6 + 1),
        TimeGrain::Year => month_start(1),
    }
}

/// Buckets a period cell to the start date of its `grain` period, formatted
/// `YYYY-MM-DD`. Unrecognized values are returned unchanged.
pub fn bucket(value: &str, grain: TimeGrain) -> String {
    match parse_period(value) {
        Some(date) => truncate(date, grain).format("%Y-%m-%d").to_string(),
        None => value.to_string(),
    }
}

/// The period code of the `grain` period starting at `start`.
pub fn period_code(start: NaiveDate, grain: TimeGrain) -> String {
    match grain {
        TimeGrain::Day => start.format("%Y%m%d").to_string(),
        TimeGrain::Week => {
            let week = start.iso_week();
            format!("{}W{}", week.year(), week.week())
        }
        TimeGrain::Month => start.format("%Y%m").to_string(),
        TimeGrain::Quarter => format!("{}Q{}", start.year(), (start.month() - 1) / 3 + 1),
        TimeGrain::SixMonth => format!("{}S{}", start.year(), (start.month() - 1) / 6 + 1),
        TimeGrain::Year => start.year().to_string(),
    }
}

fn next_start(start: NaiveDate, grain: TimeGrain) -> Option<NaiveDate> {
    let months = match grain {
        TimeGrain::Day => return start.checked_add_signed(Duration::days(1)),
        TimeGrain::Week => return start.checked_add_signed(Duration::days(7)),
        TimeGrain::Month => 1,
        TimeGrain::Quarter => 3,
        TimeGrain::SixMonth => 6,
        TimeGrain::Year => 12,
    };
    start.checked_add_months(chrono::Months::new(months))
}

/// Period codes at `grain` covering every day of `range`.
pub fn period_codes(range: &TimeRange, grain: TimeGrain) -> Vec<String> {
    let mut codes = Vec::new();
    let mut start = truncate(range.start, grain);
    while start <= range.end {
        codes.push(period_code(start, grain));
        match next_start(start, grain) {
            Some(next) => start = next,
            None => break,
        }
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[rstest]
    #[case::year("2024", Some(date(2024, 1, 1)))]
    #[case::month("202403", Some(date(2024, 3, 1)))]
    #[case::day("20240315", Some(date(2024, 3, 15)))]
    #[case::quarter("2024Q3", Some(date(2024, 7, 1)))]
    #[case::six_month("2024S2", Some(date(2024, 7, 1)))]
    #[case::iso_week("2024W1", Some(date(2024, 1, 1)))]
    #[case::iso_week_of_previous_year("2021W1", Some(date(2021, 1, 4)))]
    #[case::iso_date("2024-02-29", Some(date(2024, 2, 29)))]
    #[case::datetime("2024-01-15T00:00:00.000", Some(date(2024, 1, 15)))]
    #[case::bad_quarter("2024Q5", None)]
    #[case::bad_month("202413", None)]
    #[case::relative("LAST_12_MONTHS", None)]
    #[case::empty("", None)]
    fn test_parse_period(#[case] code: &str, #[case] expected: Option<NaiveDate>) {
        assert_eq!(parse_period(code), expected);
    }

    #[rstest]
    #[case("20240315", TimeGrain::Day, "2024-03-15")]
    #[case("20240315", TimeGrain::Week, "2024-03-11")]
    #[case("20240315", TimeGrain::Month, "2024-03-01")]
    #[case("202405", TimeGrain::Quarter, "2024-04-01")]
    #[case("202405", TimeGrain::SixMonth, "2024-01-01")]
    #[case("2024Q4", TimeGrain::Year, "2024-01-01")]
    #[case("LAST_12_MONTHS", TimeGrain::Month, "LAST_12_MONTHS")]
    fn test_bucket(#[case] value: &str, #[case] grain: TimeGrain, #[case] expected: &str) {
        assert_eq!(bucket(value, grain), expected);
    }

    #[rstest]
    #[case(TimeGrain::Month, vec!["202311", "202312", "202401"])]
    #[case(TimeGrain::Quarter, vec!["2023Q4", "2024Q1"])]
    #[case(TimeGrain::Year, vec!["2023", "2024"])]
    #[case(TimeGrain::SixMonth, vec!["2023S2", "2024S1"])]
    fn test_period_codes_cover_range(#[case] grain: TimeGrain, #[case] expected: Vec<&str>) {
        let range = TimeRange::new(date(2023, 11, 20), date(2024, 1, 10)).unwrap();
        assert_eq!(period_codes(&range, grain), expected);
    }

    #[test]
    fn test_weekly_codes_use_iso_years() {
        let range = TimeRange::new(date(2020, 12, 28), date(2021, 1, 11)).unwrap();
        assert_eq!(
            period_codes(&range, TimeGrain::Week),
            vec!["2020W53", "2021W1", "2021W2"]
        );
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        assert!(TimeRange::new(date(2024, 2, 1), date(2024, 1, 1)).is_err());
    }

    #[test]
    fn test_grain_names() {
        assert_eq!(TimeGrain::parse("P1M"), Some(TimeGrain::Month));
        assert_eq!(TimeGrain::parse("quarter"), Some(TimeGrain::Quarter));
        assert_eq!(TimeGrain::parse("fortnight"), None);
        let grain: TimeGrain = serde_json::from_str("\"P1Y\"").unwrap();
        assert_eq!(grain, TimeGrain::Year);
    }
}
