//! Expiry guard
//!
//! Same-day expiring contracts get a one-shot warning and are then force
//! closed shortly before the regular session close. The close is computed
//! on the US/Eastern wall clock, so the UTC windows shift with daylight
//! saving time.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};

use crate::config::MarketConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    None,
    Warn,
    ForceClose,
}

/// US daylight saving: second Sunday of March through the first Sunday of November
pub fn is_us_dst(date: NaiveDate) -> bool {
    let year = date.year();
    let start = NaiveDate::from_weekday_of_month_opt(year, 3, Weekday::Sun, 2);
    let end = NaiveDate::from_weekday_of_month_opt(year, 11, Weekday::Sun, 1);
    match (start, end) {
        (Some(start), Some(end)) => date >= start && date < end,
        _ => false,
    }
}

/// Hours between US/Eastern and UTC on a date
pub fn eastern_offset_hours(date: NaiveDate) -> i64 {
    if is_us_dst(date) {
        -4
    } else {
        -5
    }
}

/// Current calendar date in US/Eastern
pub fn eastern_date(now: DateTime<Utc>) -> NaiveDate {
    let utc_date = now.date_naive();
    (now + Duration::hours(eastern_offset_hours(utc_date))).date_naive()
}

/// Midnight US/Eastern of the current Eastern day, expressed in UTC
pub fn eastern_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = eastern_date(now);
    let local = date.and_time(NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default());
    Utc.from_utc_datetime(&(local - Duration::hours(eastern_offset_hours(date))))
}

/// Session close on `date`, expressed in UTC
pub fn market_close_utc(date: NaiveDate, config: &MarketConfig) -> DateTime<Utc> {
    let close = NaiveTime::from_hms_opt(config.close_hour_et, config.close_minute_et, 0)
        .unwrap_or_default();
    let local = date.and_time(close);
    Utc.from_utc_datetime(&(local - Duration::hours(eastern_offset_hours(date))))
}

/// Minutes until the session close on the expiration date (negative once past)
pub fn minutes_to_expiry(expiration: NaiveDate, now: DateTime<Utc>, config: &MarketConfig) -> i64 {
    (market_close_utc(expiration, config) - now).num_minutes()
}

#[derive(Debug, Clone)]
pub struct ExpiryGuard {
    config: MarketConfig,
}

impl ExpiryGuard {
    pub fn new(config: MarketConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, expiration: NaiveDate, now: DateTime<Utc>) -> ExpiryAction {
        let today = eastern_date(now);
        if expiration < today {
            return ExpiryAction::ForceClose;
        }
        if expiration > today {
            return ExpiryAction::None;
        }

        let close = market_close_utc(expiration, &self.config);
        if now >= close - Duration::minutes(self.config.expiry_force_close_minutes) {
            ExpiryAction::ForceClose
        } else if now >= close - Duration::minutes(self.config.expiry_warning_minutes) {
            ExpiryAction::Warn
        } else {
            ExpiryAction::None
        }
    }
}
