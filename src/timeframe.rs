use std::fmt;

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WeekStart {
    #[default]
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl WeekStart {
    pub fn weekday(self) -> Weekday {
        match self {
            Self::Monday => Weekday::Mon,
            Self::Tuesday => Weekday::Tue,
            Self::Wednesday => Weekday::Wed,
            Self::Thursday => Weekday::Thu,
            Self::Friday => Weekday::Fri,
            Self::Saturday => Weekday::Sat,
            Self::Sunday => Weekday::Sun,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Day,
    Week,
    Month,
}

impl Period {
    pub fn title(self) -> &'static str {
        match self {
            Self::Day => "Daily",
            Self::Week => "Weekly",
            Self::Month => "Monthly",
        }
    }
}

/// Half-open interval `[start, end)` of local calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeBucket {
    pub period: Period,
    pub start: NaiveDate,
}

impl TimeBucket {
    pub fn containing(date: NaiveDate, period: Period, week_start: WeekStart) -> Self {
        let start = match period {
            Period::Day => date,
            Period::Week => {
                let offset = (7 + date.weekday().num_days_from_monday()
                    - week_start.weekday().num_days_from_monday())
                    % 7;
                date.checked_sub_days(Days::new(u64::from(offset)))
                    .unwrap_or(NaiveDate::MIN)
            }
            Period::Month => date.with_day(1).unwrap_or(date),
        };
        Self { period, start }
    }

    pub fn end(&self) -> NaiveDate {
        let end = match self.period {
            Period::Day => self.start.checked_add_days(Days::new(1)),
            Period::Week => self.start.checked_add_days(Days::new(7)),
            Period::Month => self.start.checked_add_months(Months::new(1)),
        };
        end.unwrap_or(NaiveDate::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end()
    }

    pub fn label(&self) -> String {
        match self.period {
            Period::Day => self.start.format("%Y-%m-%d").to_string(),
            Period::Week => {
                let last = self.end().pred_opt().unwrap_or(self.start);
                format!(
                    "{} to {}",
                    self.start.format("%Y-%m-%d"),
                    last.format("%Y-%m-%d")
                )
            }
            Period::Month => self.start.format("%Y-%m").to_string(),
        }
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn monday_weeks_are_half_open() {
        let first = TimeBucket::containing(date(2024, 1, 1), Period::Week, WeekStart::Monday);
        let second = TimeBucket::containing(date(2024, 1, 3), Period::Week, WeekStart::Monday);
        let third = TimeBucket::containing(date(2024, 1, 8), Period::Week, WeekStart::Monday);

        assert_eq!(first, second);
        assert_eq!(first.start, date(2024, 1, 1));
        assert_eq!(first.end(), date(2024, 1, 8));
        assert_ne!(first, third);
        assert_eq!(third.start, date(2024, 1, 8));
        assert_eq!(third.end(), date(2024, 1, 15));
        assert!(!first.contains(date(2024, 1, 8)));
    }

    #[test]
    fn sunday_week_start_shifts_boundaries() {
        let bucket = TimeBucket::containing(date(2024, 1, 3), Period::Week, WeekStart::Sunday);
        assert_eq!(bucket.start, date(2023, 12, 31));
        assert_eq!(bucket.end(), date(2024, 1, 7));

        let on_start = TimeBucket::containing(date(2024, 1, 7), Period::Week, WeekStart::Sunday);
        assert_eq!(on_start.start, date(2024, 1, 7));
    }

    #[test]
    fn every_week_start_contains_its_date() {
        for week_start in WeekStart::value_variants() {
            for day in 1..=14 {
                let d = date(2024, 2, day);
                let bucket = TimeBucket::containing(d, Period::Week, *week_start);
                assert!(bucket.contains(d));
                assert_eq!(bucket.start.weekday(), week_start.weekday());
            }
        }
    }

    #[test]
    fn month_buckets_roll_over_year_end() {
        let bucket = TimeBucket::containing(date(2023, 12, 19), Period::Month, WeekStart::Monday);
        assert_eq!(bucket.start, date(2023, 12, 1));
        assert_eq!(bucket.end(), date(2024, 1, 1));
        assert_eq!(bucket.label(), "2023-12");
    }

    #[test]
    fn week_label_shows_inclusive_last_day() {
        let bucket = TimeBucket::containing(date(2024, 1, 3), Period::Week, WeekStart::Monday);
        assert_eq!(bucket.label(), "2024-01-01 to 2024-01-07");
    }
}
