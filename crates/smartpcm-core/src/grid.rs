//! Placement of scheduled items onto the columns of the schedule grid.
//!
//! A [`GridConfig`] produces an ordered run of [`TimeBucket`]s (days of a
//! month, days of an ISO week, the 52 weeks or the 12 months of a year) and
//! [`bucket_active`] decides whether an item's calendar span touches a
//! bucket. Month and week comparisons use the bare month-of-year and ISO
//! week-of-year numbers; the year of the item is not part of the test.

use std::str::FromStr;

use anyhow::anyhow;
use chrono::{Datelike, Days, NaiveDate, Weekday};
use chrono_tz::Tz;
use tracing::debug;

use crate::model::ScheduleItem;

pub const WEEK_BUCKET_COUNT: u32 = 52;

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Column layout used when neither a month nor a week is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    Weeks,
    Months,
}

impl FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weeks" | "week" | "w" => Ok(Granularity::Weeks),
            "months" | "month" | "m" => Ok(Granularity::Months),
            other => Err(anyhow!("invalid grid mode: {other} (expected weeks or months)")),
        }
    }
}

/// What a bucket's `value` means, and therefore how activity is tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketMode {
    Days,
    Weeks,
    Months,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBucket {
    pub label: String,
    pub value: u32,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridConfig {
    pub year: i32,
    pub month: Option<u32>,
    pub week: Option<u32>,
    pub mode: Granularity,
}

impl GridConfig {
    pub fn new(year: i32) -> Self {
        Self {
            year,
            month: None,
            week: None,
            mode: Granularity::default(),
        }
    }

    pub fn select_month(&mut self, month: u32) {
        self.month = Some(month);
        self.week = None;
    }

    pub fn select_week(&mut self, week: u32) {
        self.week = Some(week);
        self.month = None;
    }

    pub fn title(&self) -> String {
        if let Some(month) = self.month {
            let name = month_label(month).unwrap_or("?");
            return format!("{name} {}", self.year);
        }
        if let Some(week) = self.week {
            return format!("Week {week} of {}", self.year);
        }
        match self.mode {
            Granularity::Weeks => format!("{} by week", self.year),
            Granularity::Months => format!("{} by month", self.year),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    pub mode: BucketMode,
    pub buckets: Vec<TimeBucket>,
}

#[derive(Debug, Clone)]
pub struct GridRow<'a> {
    pub item: &'a ScheduleItem,
    pub cells: Vec<bool>,
}

impl Grid {
    pub fn is_active(&self, item: &ScheduleItem, bucket: &TimeBucket, tz: &Tz) -> bool {
        bucket_active(item_span(item, tz), bucket, self.mode)
    }

    pub fn rows<'a>(&self, items: &'a [ScheduleItem], tz: &Tz) -> Vec<GridRow<'a>> {
        items
            .iter()
            .map(|item| {
                let span = item_span(item, tz);
                let cells = self
                    .buckets
                    .iter()
                    .map(|bucket| bucket_active(span, bucket, self.mode))
                    .collect();
                GridRow { item, cells }
            })
            .collect()
    }
}

/// Builds the bucket sequence for `config`. A selected month wins over a
/// selected week; with neither, `config.mode` picks weeks or months.
#[tracing::instrument]
pub fn generate_buckets(config: &GridConfig) -> anyhow::Result<Grid> {
    let grid = if let Some(month) = config.month {
        Grid {
            mode: BucketMode::Days,
            buckets: month_day_buckets(config.year, month)?,
        }
    } else if let Some(week) = config.week {
        Grid {
            mode: BucketMode::Days,
            buckets: iso_week_day_buckets(config.year, week)?,
        }
    } else {
        match config.mode {
            Granularity::Weeks => Grid {
                mode: BucketMode::Weeks,
                buckets: week_buckets(),
            },
            Granularity::Months => Grid {
                mode: BucketMode::Months,
                buckets: month_buckets(),
            },
        }
    };

    debug!(mode = ?grid.mode, count = grid.buckets.len(), "generated buckets");
    Ok(grid)
}

/// Local calendar dates of an item's start and end, if both are known.
pub fn item_span(item: &ScheduleItem, tz: &Tz) -> Option<(NaiveDate, NaiveDate)> {
    let start = item.start?.with_timezone(tz).date_naive();
    let end = item.end?.with_timezone(tz).date_naive();
    Some((start, end))
}

pub fn bucket_active(
    span: Option<(NaiveDate, NaiveDate)>,
    bucket: &TimeBucket,
    mode: BucketMode,
) -> bool {
    let Some((start, end)) = span else {
        return false;
    };

    match mode {
        BucketMode::Days => {
            let Some(date) = bucket.date else {
                return false;
            };
            date == start || date == end || (date > start && date < end)
        }
        BucketMode::Months => (start.month()..=end.month()).contains(&bucket.value),
        BucketMode::Weeks => {
            (start.iso_week().week()..=end.iso_week().week()).contains(&bucket.value)
        }
    }
}

fn month_label(month: u32) -> Option<&'static str> {
    let idx = usize::try_from(month).ok()?.checked_sub(1)?;
    MONTH_LABELS.get(idx).copied()
}

/// Month number from `3`, `mar`, `sept` or `March`. A name must be at
/// least three letters and a prefix of the full month name.
pub fn parse_month(raw: &str) -> anyhow::Result<u32> {
    let token = raw.trim();
    if let Ok(month) = token.parse::<u32>() {
        return Ok(month);
    }
    let lower = token.to_ascii_lowercase();
    if lower.len() < 3 {
        return Err(anyhow!("invalid month: {raw}"));
    }
    MONTH_NAMES
        .iter()
        .position(|name| name.starts_with(lower.as_str()))
        .and_then(|idx| u32::try_from(idx + 1).ok())
        .ok_or_else(|| anyhow!("invalid month: {raw}"))
}

fn month_day_buckets(year: i32, month: u32) -> anyhow::Result<Vec<TimeBucket>> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| anyhow!("invalid month {month} for year {year}"))?;

    Ok(first
        .iter_days()
        .take_while(|date| date.month() == month)
        .map(|date| TimeBucket {
            label: date.day().to_string(),
            value: date.day(),
            date: Some(date),
        })
        .collect())
}

fn iso_week_day_buckets(year: i32, week: u32) -> anyhow::Result<Vec<TimeBucket>> {
    let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
        .ok_or_else(|| anyhow!("ISO week {week} does not exist in {year}"))?;

    (0..7u64)
        .map(|offset| {
            let date = monday
                .checked_add_days(Days::new(offset))
                .ok_or_else(|| anyhow!("date out of range after {monday}"))?;
            Ok(TimeBucket {
                label: date.format("%a %d").to_string(),
                value: date.weekday().number_from_monday(),
                date: Some(date),
            })
        })
        .collect()
}

fn week_buckets() -> Vec<TimeBucket> {
    (1..=WEEK_BUCKET_COUNT)
        .map(|week| TimeBucket {
            label: format!("S{week}"),
            value: week,
            date: None,
        })
        .collect()
}

fn month_buckets() -> Vec<TimeBucket> {
    MONTH_LABELS
        .iter()
        .zip(1u32..)
        .map(|(label, month)| TimeBucket {
            label: (*label).to_string(),
            value: month,
            date: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use chrono_tz::America::Sao_Paulo;

    use super::*;
    use crate::model::ItemKind;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn item(start: NaiveDate, end: NaiveDate) -> ScheduleItem {
        let at_noon = |d: NaiveDate| {
            Utc.from_utc_datetime(&d.and_hms_opt(12, 0, 0).expect("valid time"))
        };
        ScheduleItem {
            id: 1,
            name: "Overhaul".to_string(),
            start: Some(at_noon(start)),
            end: Some(at_noon(end)),
            kind: ItemKind::Stop,
            priority: None,
            status: None,
            asset_groups: vec![],
        }
    }

    fn expected_days(year: i32, month: u32) -> usize {
        let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
        match month {
            2 if leap => 29,
            2 => 28,
            4 | 6 | 9 | 11 => 30,
            _ => 31,
        }
    }

    #[test]
    fn month_selection_yields_one_bucket_per_day() {
        for year in [1900, 2000, 2023, 2024, 2025, 2100] {
            for month in 1..=12 {
                let mut config = GridConfig::new(year);
                config.select_month(month);
                let grid = generate_buckets(&config).expect("generate");
                assert_eq!(grid.mode, BucketMode::Days);
                assert_eq!(
                    grid.buckets.len(),
                    expected_days(year, month),
                    "{year}-{month}"
                );
                assert_eq!(grid.buckets[0].date, Some(date(year, month, 1)));
            }
        }
    }

    #[test]
    fn leap_february_has_twenty_nine_days() {
        let mut config = GridConfig::new(2024);
        config.select_month(2);
        let grid = generate_buckets(&config).expect("generate");
        let last = grid.buckets.last().expect("non-empty");
        assert_eq!(last.label, "29");
        assert_eq!(last.date, Some(date(2024, 2, 29)));
    }

    #[test]
    fn default_config_produces_52_week_buckets() {
        let grid = generate_buckets(&GridConfig::new(2025)).expect("generate");
        assert_eq!(grid.mode, BucketMode::Weeks);
        assert_eq!(grid.buckets.len(), 52);
        assert_eq!(grid.buckets[0].label, "S1");
        assert_eq!(grid.buckets[51].label, "S52");
        assert!(grid.buckets.iter().all(|b| b.date.is_none()));
    }

    #[test]
    fn months_mode_produces_twelve_labelled_buckets() {
        let mut config = GridConfig::new(2025);
        config.mode = Granularity::Months;
        let grid = generate_buckets(&config).expect("generate");
        assert_eq!(grid.mode, BucketMode::Months);
        let labels: Vec<&str> = grid.buckets.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, MONTH_LABELS.to_vec());
        assert_eq!(grid.buckets[11].value, 12);
    }

    #[test]
    fn iso_week_selection_is_monday_first() {
        let mut config = GridConfig::new(2025);
        config.select_week(11);
        let grid = generate_buckets(&config).expect("generate");
        assert_eq!(grid.mode, BucketMode::Days);
        assert_eq!(grid.buckets.len(), 7);
        assert_eq!(grid.buckets[0].date, Some(date(2025, 3, 10)));
        assert_eq!(grid.buckets[0].label, "Mon 10");
        assert_eq!(grid.buckets[6].date, Some(date(2025, 3, 16)));
        let values: Vec<u32> = grid.buckets.iter().map(|b| b.value).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn iso_week_can_straddle_the_year_boundary() {
        let mut config = GridConfig::new(2025);
        config.select_week(1);
        let grid = generate_buckets(&config).expect("generate");
        assert_eq!(grid.buckets[0].date, Some(date(2024, 12, 30)));
        assert_eq!(grid.buckets[6].date, Some(date(2025, 1, 5)));
    }

    #[test]
    fn invalid_selections_are_reported() {
        let mut config = GridConfig::new(2025);
        config.select_month(13);
        assert!(generate_buckets(&config).is_err());

        config.select_week(53);
        assert!(generate_buckets(&config).is_err());

        let mut long_year = GridConfig::new(2026);
        long_year.select_week(53);
        assert!(generate_buckets(&long_year).is_ok());
    }

    #[test]
    fn selecting_month_clears_week_and_back() {
        let mut config = GridConfig::new(2025);
        config.select_week(4);
        config.select_month(6);
        assert_eq!(config.week, None);
        assert_eq!(config.month, Some(6));
        config.select_week(9);
        assert_eq!(config.month, None);
        assert_eq!(config.week, Some(9));
    }

    #[test]
    fn month_wins_when_both_are_set_directly() {
        let config = GridConfig {
            year: 2025,
            month: Some(2),
            week: Some(10),
            mode: Granularity::Weeks,
        };
        let grid = generate_buckets(&config).expect("generate");
        assert_eq!(grid.buckets.len(), 28);
    }

    #[test]
    fn day_buckets_include_both_endpoints() {
        let mut config = GridConfig::new(2025);
        config.select_month(3);
        let grid = generate_buckets(&config).expect("generate");
        let stop = item(date(2025, 3, 10), date(2025, 3, 12));

        let active: Vec<u32> = grid
            .buckets
            .iter()
            .filter(|bucket| grid.is_active(&stop, bucket, &chrono_tz::UTC))
            .map(|bucket| bucket.value)
            .collect();
        assert_eq!(active, vec![10, 11, 12]);
    }

    #[test]
    fn month_mode_ignores_the_grid_year() {
        let stop = item(date(2019, 3, 4), date(2019, 5, 20));
        let span = item_span(&stop, &chrono_tz::UTC);
        let mut config = GridConfig::new(2031);
        config.mode = Granularity::Months;
        let grid = generate_buckets(&config).expect("generate");

        for bucket in &grid.buckets {
            let expected = (3..=5).contains(&bucket.value);
            assert_eq!(
                bucket_active(span, bucket, BucketMode::Months),
                expected,
                "month {}",
                bucket.value
            );
        }
    }

    #[test]
    fn week_mode_compares_iso_week_numbers() {
        // 2025-03-10 is ISO week 11, 2025-03-26 is ISO week 13
        let stop = item(date(2025, 3, 10), date(2025, 3, 26));
        let grid = generate_buckets(&GridConfig::new(2025)).expect("generate");
        let rows = grid.rows(std::slice::from_ref(&stop), &chrono_tz::UTC);
        let active: Vec<u32> = grid
            .buckets
            .iter()
            .zip(&rows[0].cells)
            .filter(|(_, on)| **on)
            .map(|(bucket, _)| bucket.value)
            .collect();
        assert_eq!(active, vec![11, 12, 13]);
    }

    #[test]
    fn missing_dates_never_match() {
        let mut stop = item(date(2025, 3, 10), date(2025, 3, 12));
        stop.end = None;
        let grid = generate_buckets(&GridConfig::new(2025)).expect("generate");
        assert!(
            grid.buckets
                .iter()
                .all(|bucket| !grid.is_active(&stop, bucket, &chrono_tz::UTC))
        );
    }

    #[test]
    fn week_bucket_without_date_is_inactive_in_day_mode() {
        let bucket = TimeBucket {
            label: "S1".to_string(),
            value: 1,
            date: None,
        };
        let span = Some((date(2025, 1, 1), date(2025, 12, 31)));
        assert!(!bucket_active(span, &bucket, BucketMode::Days));
    }

    #[test]
    fn activity_uses_local_calendar_dates() {
        // 02:00 UTC on the 10th is still the 9th in Sao Paulo (UTC-3)
        let start = Utc
            .with_ymd_and_hms(2025, 3, 10, 2, 0, 0)
            .single()
            .expect("valid instant");
        let mut stop = item(date(2025, 3, 10), date(2025, 3, 10));
        stop.start = Some(start);
        stop.end = Some(start);

        let mut config = GridConfig::new(2025);
        config.select_month(3);
        let grid = generate_buckets(&config).expect("generate");
        assert!(grid.is_active(&stop, &grid.buckets[8], &Sao_Paulo));
        assert!(!grid.is_active(&stop, &grid.buckets[9], &Sao_Paulo));
        assert!(grid.is_active(&stop, &grid.buckets[9], &chrono_tz::UTC));
    }

    #[test]
    fn titles_describe_the_selection() {
        let mut config = GridConfig::new(2025);
        assert_eq!(config.title(), "2025 by week");
        config.select_month(3);
        assert_eq!(config.title(), "Mar 2025");
        config.select_week(11);
        assert_eq!(config.title(), "Week 11 of 2025");
    }

    #[test]
    fn months_parse_from_numbers_and_names() {
        assert_eq!(parse_month("3").expect("number"), 3);
        assert_eq!(parse_month("March").expect("name"), 3);
        assert_eq!(parse_month("dec").expect("abbrev"), 12);
        assert_eq!(parse_month("Sept").expect("long abbrev"), 9);
        assert!(parse_month("ma").is_err());
        assert!(parse_month("smarch").is_err());
        assert!(parse_month("marbles").is_err());
        assert!(parse_month("decoy").is_err());
    }
}
