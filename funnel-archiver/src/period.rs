use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ArchiverError;

/// A half-open reporting window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ArchiverError> {
        if end <= start {
            return Err(ArchiverError::InvalidPeriod {
                value: format!("{}/{}", start.to_rfc3339(), end.to_rfc3339()),
                reason: "end must be after start".to_string(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn from_bounds(start: &str, end: &str) -> Result<Self, ArchiverError> {
        Self::new(parse_instant(start)?, parse_instant(end)?)
    }

    pub fn contains(&self, other: &Period) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Parses a comma separated list of `start/end` periods.
    pub fn parse_list(value: &str) -> Result<Vec<Period>, ArchiverError> {
        value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Period::from_str)
            .collect()
    }
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, ArchiverError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|e| ArchiverError::InvalidPeriod {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

impl FromStr for Period {
    type Err = ArchiverError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((start, end)) = value.split_once('/') else {
            return Err(ArchiverError::InvalidPeriod {
                value: value.to_string(),
                reason: "expected start/end".to_string(),
            });
        };
        Self::from_bounds(start, end)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use test_case::test_case;

    #[test]
    fn parses_start_end() {
        let period: Period = "2024-05-01T00:00:00Z/2024-05-02T00:00:00+00:00".parse().unwrap();
        assert_eq!(period.start, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
    }

    #[test_case("2024-05-01T00:00:00Z" ; "no separator")]
    #[test_case("yesterday/today" ; "not rfc3339")]
    #[test_case("2024-05-02T00:00:00Z/2024-05-01T00:00:00Z" ; "reversed")]
    #[test_case("2024-05-01T00:00:00Z/2024-05-01T00:00:00Z" ; "empty")]
    fn rejects_bad_periods(value: &str) {
        assert!(matches!(
            value.parse::<Period>(),
            Err(ArchiverError::InvalidPeriod { .. })
        ));
    }

    #[test]
    fn parses_lists() {
        let periods = Period::parse_list(
            "2024-05-01T00:00:00Z/2024-05-02T00:00:00Z, 2024-05-02T00:00:00Z/2024-05-03T00:00:00Z,",
        )
        .unwrap();
        assert_eq!(periods.len(), 2);

        let week = Period::from_bounds("2024-04-29T00:00:00Z", "2024-05-06T00:00:00Z").unwrap();
        assert!(periods.iter().all(|day| week.contains(day)));
        assert!(Period::parse_list("").unwrap().is_empty());
    }
}
