//! The calendrical filter attached to every `Job`: four independent bitmaps
//! over months, days-of-month, days-of-week, and minute-of-day, ANDed
//! together at evaluation time. Grounded on the original `ncron`'s
//! `cst_mon_`/`cst_mday_`/`cst_wday_`/`cst_hhmm_` boolean arrays (all
//! `true`/admitted by default, so silence means "any"), reworked here as
//! a small fixed-size-array type instead of raw `memset` blocks.

use chrono::{Datelike, NaiveDate, Timelike};

const MINUTES_PER_DAY: usize = 1440;

/// Which of the four independent filters an `add_range` call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Month,
    MonthDay,
    WeekDay,
    MinuteOfDay,
}

impl Category {
    fn bounds(self) -> (i32, i32) {
        match self {
            Category::Month => (1, 12),
            Category::MonthDay => (1, 31),
            Category::WeekDay => (1, 7),
            Category::MinuteOfDay => (0, 1439),
        }
    }
}

/// A broken-down local time, the unit `ConstraintSet::admit` is evaluated
/// against. Callers build this from `chrono::DateTime<Tz>::with_timezone`.
#[derive(Debug, Clone, Copy)]
pub struct BrokenDownTime {
    pub month: u32,
    pub month_day: u32,
    /// ISO weekday, Monday = 1 ... Sunday = 7.
    pub week_day: u32,
    pub hour: u32,
    pub minute: u32,
    pub year: i32,
}

impl BrokenDownTime {
    pub fn from_datetime<Tz: chrono::TimeZone>(dt: &chrono::DateTime<Tz>) -> Self {
        Self {
            month: dt.month(),
            month_day: dt.day(),
            week_day: dt.weekday().number_from_monday(),
            hour: dt.hour(),
            minute: dt.minute(),
            year: dt.year(),
        }
    }

    pub fn minute_of_day(&self) -> usize {
        (self.hour * 60 + self.minute) as usize
    }
}

/// Per-job immutable calendar filter. Every bitmap starts fully set
/// ("no restriction"); the first `add_range` call against a category
/// clears that bitmap to all-false before setting the range's bits, so
/// "unspecified" means "anything" but "any mention" means "only the
/// mentioned values" (spec.md §3).
#[derive(Debug, Clone)]
pub struct ConstraintSet {
    month: [bool; 12],
    month_day: [bool; 31],
    week_day: [bool; 7],
    minute_of_day: [bool; MINUTES_PER_DAY],
    touched: [bool; 4],
}

impl Default for ConstraintSet {
    fn default() -> Self {
        Self {
            month: [true; 12],
            month_day: [true; 31],
            week_day: [true; 7],
            minute_of_day: [true; MINUTES_PER_DAY],
            touched: [false; 4],
        }
    }
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Four indexed reads, ANDed.
    pub fn admit(&self, tm: &BrokenDownTime) -> bool {
        self.month[(tm.month - 1) as usize]
            && self.month_day_admitted(tm.month_day, tm.month, tm.year)
            && self.week_day[(tm.week_day - 1) as usize]
            && self.minute_of_day[tm.minute_of_day()]
    }

    fn month_day_admitted(&self, day: u32, _month: u32, _year: i32) -> bool {
        // day is always 1..=31 here; validity of the day for the given
        // month/year is handled by the caller normalising via `NaiveDate`.
        self.month_day[(day - 1) as usize]
    }

    /// Sets all bits in `[lo, hi]` inclusive. If `lo > hi`, the range wraps:
    /// `[lo, category_max] ∪ [category_min, hi]`. On the first call for a
    /// category on this job, the bitmap is cleared first. Out-of-range or
    /// doubly-wildcard ranges are rejected and ignored (return `false`).
    pub fn add_range(&mut self, category: Category, lo: i32, hi: i32) -> bool {
        let (min, max) = category.bounds();
        if (lo < min || lo > max) && (hi < min || hi > max) {
            return false;
        }
        let lo = lo.clamp(min, max);
        let hi = hi.clamp(min, max);

        let idx = category_index(category);
        if !self.touched[idx] {
            self.clear(category);
            self.touched[idx] = true;
        }

        if lo <= hi {
            self.set_range_unchecked(category, lo, hi);
        } else {
            self.set_range_unchecked(category, lo, max);
            self.set_range_unchecked(category, min, hi);
        }
        true
    }

    fn clear(&mut self, category: Category) {
        match category {
            Category::Month => self.month = [false; 12],
            Category::MonthDay => self.month_day = [false; 31],
            Category::WeekDay => self.week_day = [false; 7],
            Category::MinuteOfDay => self.minute_of_day = [false; MINUTES_PER_DAY],
        }
    }

    fn set_range_unchecked(&mut self, category: Category, lo: i32, hi: i32) {
        match category {
            Category::Month => {
                for v in lo..=hi {
                    self.month[(v - 1) as usize] = true;
                }
            }
            Category::MonthDay => {
                for v in lo..=hi {
                    self.month_day[(v - 1) as usize] = true;
                }
            }
            Category::WeekDay => {
                for v in lo..=hi {
                    self.week_day[(v - 1) as usize] = true;
                }
            }
            Category::MinuteOfDay => {
                for v in lo..=hi {
                    self.minute_of_day[v as usize] = true;
                }
            }
        }
    }

    /// `add_range` for an hour window, expanded to the minute-of-day bitmap
    /// as `[60*lo .. 60*hi+59]` (spec.md §6's `hour` key).
    pub fn add_hour_range(&mut self, lo: i32, hi: i32) -> bool {
        if !(0..=23).contains(&lo) && !(0..=23).contains(&hi) {
            return false;
        }
        let lo = lo.clamp(0, 23);
        let hi = hi.clamp(0, 23);
        self.add_range(Category::MinuteOfDay, lo * 60, hi * 60 + 59)
    }

    /// A bare `minute` range (no preceding `hour` key) applies across every
    /// hour of the day (spec.md §6).
    pub fn add_minute_range_all_hours(&mut self, lo: i32, hi: i32) -> bool {
        if !(0..=59).contains(&lo) && !(0..=59).contains(&hi) {
            return false;
        }
        let idx = category_index(Category::MinuteOfDay);
        if !self.touched[idx] {
            self.clear(Category::MinuteOfDay);
            self.touched[idx] = true;
        }
        let lo = lo.clamp(0, 59);
        let hi = hi.clamp(0, 59);
        for hour in 0..24 {
            let base = hour * 60;
            if lo <= hi {
                for m in lo..=hi {
                    self.minute_of_day[(base + m) as usize] = true;
                }
            } else {
                for m in lo..=59 {
                    self.minute_of_day[(base + m) as usize] = true;
                }
                for m in 0..=hi {
                    self.minute_of_day[(base + m) as usize] = true;
                }
            }
        }
        true
    }

    /// Refines the minute-of-day bitmap for a single already-admitted hour,
    /// combining with a preceding `hour` key (spec.md §6's `minute` key).
    /// The `hour` key coarsely admits the whole hour (all 60 minutes); this
    /// narrows that back down to just the given sub-range by clearing the
    /// hour's 60 bits before setting them, so `hour=9,10` then
    /// `minute=15,30` admits only 9:15-9:30/10:15-10:30, not all of 9:00-10:59.
    pub fn add_minute_range_within_hour(&mut self, hour: i32, lo: i32, hi: i32) -> bool {
        if !(0..=23).contains(&hour) {
            return false;
        }
        if !(0..=59).contains(&lo) && !(0..=59).contains(&hi) {
            return false;
        }
        let idx = category_index(Category::MinuteOfDay);
        if !self.touched[idx] {
            self.clear(Category::MinuteOfDay);
            self.touched[idx] = true;
        }
        let lo = lo.clamp(0, 59);
        let hi = hi.clamp(0, 59);
        let base = hour * 60;
        for m in base..base + 60 {
            self.minute_of_day[m as usize] = false;
        }
        if lo <= hi {
            for m in lo..=hi {
                self.minute_of_day[(base + m) as usize] = true;
            }
        } else {
            for m in lo..=59 {
                self.minute_of_day[(base + m) as usize] = true;
            }
            for m in 0..=hi {
                self.minute_of_day[(base + m) as usize] = true;
            }
        }
        true
    }

    pub fn is_unrestricted(&self) -> bool {
        self.touched == [false; 4]
    }

    /// Per-category admission checks, used by `Job::constrain_time` to find
    /// which of the four independent filters is blocking a candidate time,
    /// one step at a time, rather than the combined `admit`.
    pub fn is_month_admitted(&self, month: u32) -> bool {
        self.month[(month - 1) as usize]
    }

    pub fn is_month_day_admitted(&self, day: u32) -> bool {
        self.month_day[(day - 1) as usize]
    }

    pub fn is_week_day_admitted(&self, week_day: u32) -> bool {
        self.week_day[(week_day - 1) as usize]
    }

    pub fn is_minute_admitted(&self, minute_of_day: usize) -> bool {
        self.minute_of_day[minute_of_day]
    }

    /// First admitted minute-of-day index strictly after `after`, not
    /// wrapping past the end of the day. `None` means the day has no more
    /// admitted minutes from this point on.
    pub fn next_admitted_minute_of_day(&self, after: usize) -> Option<usize> {
        (after + 1..MINUTES_PER_DAY).find(|&m| self.minute_of_day[m])
    }
}

fn category_index(category: Category) -> usize {
    match category {
        Category::Month => 0,
        Category::MonthDay => 1,
        Category::WeekDay => 2,
        Category::MinuteOfDay => 3,
    }
}

/// Gregorian leap-year rule, used by `Job::constrain_time` to bound the
/// day-of-month step. `(y%4==0 && (y%100!=0 || y%400==0))`.
pub fn is_leap_year(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// Last valid day-of-month for `month` (1-12) in `year`, following the
/// Gregorian leap rule for February and the 30-day months (4, 6, 9, 11).
pub fn days_in_month(month: u32, year: i32) -> u32 {
    match month {
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Convenience used by `Job::constrain_time` to normalise a `(year, month,
/// day, hour, minute)` tuple back into a valid `NaiveDate`, clamping the day
/// if it overflows the month (e.g. advancing past day 31 in a 30-day month).
pub fn clamp_to_valid_date(year: i32, month: u32, day: u32) -> NaiveDate {
    let last_day = days_in_month(month, year);
    NaiveDate::from_ymd_opt(year, month, day.min(last_day))
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, last_day).expect("valid month"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bdt(month: u32, month_day: u32, week_day: u32, hour: u32, minute: u32) -> BrokenDownTime {
        BrokenDownTime {
            month,
            month_day,
            week_day,
            hour,
            minute,
            year: 2024,
        }
    }

    #[test]
    fn default_admits_everything() {
        let cst = ConstraintSet::new();
        assert!(cst.admit(&bdt(1, 1, 1, 0, 0)));
        assert!(cst.admit(&bdt(12, 31, 7, 23, 59)));
    }

    #[test]
    fn first_mention_clears_then_restricts() {
        let mut cst = ConstraintSet::new();
        assert!(cst.add_range(Category::Month, 6, 8));
        assert!(!cst.admit(&bdt(1, 1, 1, 0, 0)));
        assert!(cst.admit(&bdt(7, 1, 1, 0, 0)));
    }

    #[test]
    fn wrap_range_admits_union() {
        let mut cst = ConstraintSet::new();
        assert!(cst.add_range(Category::Month, 11, 2));
        for m in [11, 12, 1, 2] {
            assert!(cst.admit(&bdt(m, 1, 1, 0, 0)), "month {m} should be admitted");
        }
        for m in [3, 4, 5, 6, 7, 8, 9, 10] {
            assert!(!cst.admit(&bdt(m, 1, 1, 0, 0)), "month {m} should not be admitted");
        }
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut cst = ConstraintSet::new();
        assert!(!cst.add_range(Category::Month, 13, 14));
        // Unrestricted, since the rejected call had no effect.
        assert!(cst.admit(&bdt(1, 1, 1, 0, 0)));
    }

    #[test]
    fn doubly_wildcard_range_is_rejected() {
        let mut cst = ConstraintSet::new();
        assert!(!cst.add_range(Category::Month, 0, 13));
    }

    #[test]
    fn hour_window_expands_to_minutes() {
        let mut cst = ConstraintSet::new();
        assert!(cst.add_hour_range(9, 17));
        assert!(cst.admit(&bdt(1, 1, 1, 9, 0)));
        assert!(cst.admit(&bdt(1, 1, 1, 17, 59)));
        assert!(!cst.admit(&bdt(1, 1, 1, 18, 0)));
        assert!(!cst.admit(&bdt(1, 1, 1, 8, 59)));
    }

    #[test]
    fn minute_within_hour_narrows_the_whole_hour_admission() {
        let mut cst = ConstraintSet::new();
        assert!(cst.add_hour_range(9, 10));
        assert!(cst.add_minute_range_within_hour(9, 15, 30));
        assert!(cst.add_minute_range_within_hour(10, 15, 30));
        assert!(cst.admit(&bdt(1, 1, 1, 9, 20)));
        assert!(!cst.admit(&bdt(1, 1, 1, 9, 0)));
        assert!(!cst.admit(&bdt(1, 1, 1, 9, 59)));
        assert!(cst.admit(&bdt(1, 1, 1, 10, 15)));
        assert!(!cst.admit(&bdt(1, 1, 1, 10, 0)));
    }

    #[test]
    fn leap_year_rule() {
        assert!(is_leap_year(2024));
        assert!(!is_leap_year(2023));
        assert!(!is_leap_year(1900));
        assert!(is_leap_year(2000));
        assert_eq!(days_in_month(2, 2024), 29);
        assert_eq!(days_in_month(2, 2023), 28);
        assert_eq!(days_in_month(4, 2024), 30);
    }
}
