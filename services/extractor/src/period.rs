//! Calendar-month periods and the run plan built from them.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid period {0:?}, expected YYYYMM")]
pub struct InvalidPeriod(pub String);

/// A calendar month, written `YYYYMM` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        ((0..=9999).contains(&year) && (1..=12).contains(&month)).then_some(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The following month; December rolls into January of the next year.
    pub fn succ(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// First day of the month as `YYYY-MM-01`, the period column of a pivoted row.
    pub fn stamp(&self) -> String {
        format!("{:04}-{:02}-01", self.year, self.month)
    }

    /// `YYYY-MM`, the partition key used when replacing history.
    pub fn month_prefix(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = InvalidPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidPeriod(s.to_string());
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let year: i32 = s[..4].parse().map_err(|_| invalid())?;
        let month: u32 = s[4..].parse().map_err(|_| invalid())?;
        Period::new(year, month).ok_or_else(invalid)
    }
}

/// How much of the month sequence a run refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunWindow {
    /// Only the most recent N months, current month included.
    Rolling(u32),
    /// Every month from the start period.
    Backfill,
}

impl RunWindow {
    pub fn is_backfill(&self) -> bool {
        matches!(self, RunWindow::Backfill)
    }
}

/// Every month from `start` through `end`, inclusive, in order.
pub fn month_range(start: Period, end: Period) -> Vec<Period> {
    let mut months = Vec::new();
    let mut cur = start;
    while cur <= end {
        months.push(cur);
        cur = cur.succ();
    }
    months
}

/// Periods to process for a run whose current month is `current`.
pub fn plan_periods(start: Period, current: Period, window: RunWindow) -> Vec<Period> {
    let all = month_range(start, current);
    match window {
        RunWindow::Backfill => all,
        RunWindow::Rolling(n) => {
            let keep = (n.max(1) as usize).min(all.len());
            all[all.len() - keep..].to_vec()
        }
    }
}
