// ===============================
// src/schedule.rs
// ===============================
//
// Gate waktu aktif: jam mulai/selesai, hari aktif, dan tanggal mulai opsional.
// Pure logic only: no clock reads, no I/O. Callers pass the wall-clock
// instant they care about (the worker uses local time).
//
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("start time {start} must not be after end time {end}")]
    InvertedWindow { start: NaiveTime, end: NaiveTime },
    #[error("at least one weekday must be active")]
    NoActiveDay,
    #[error("unknown weekday \"{0}\"")]
    UnknownWeekday(String),
}

/// Seven weekday flags, Sunday first (same order the settings use).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveDays([bool; 7]);

impl ActiveDays {
    pub fn from_flags(flags: [bool; 7]) -> Self {
        Self(flags)
    }

    pub fn weekdays() -> Self {
        Self([false, true, true, true, true, true, false])
    }

    pub fn all() -> Self {
        Self([true; 7])
    }

    pub fn with(mut self, day: Weekday) -> Self {
        self.0[day.num_days_from_sunday() as usize] = true;
        self
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0[day.num_days_from_sunday() as usize]
    }

    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|d| *d)
    }

    pub fn flags(&self) -> [bool; 7] {
        self.0
    }
}

/// Parses `mon,tue,fri`, plus the shorthands `all` and `weekdays`.
impl FromStr for ActiveDays {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut days = ActiveDays::default();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "all" => days = ActiveDays::all(),
                "weekdays" => {
                    for (i, on) in ActiveDays::weekdays().0.iter().enumerate() {
                        days.0[i] |= *on;
                    }
                }
                other => {
                    let day = Weekday::from_str(other)
                        .map_err(|_| ScheduleError::UnknownWeekday(token.to_string()))?;
                    days = days.with(day);
                }
            }
        }
        Ok(days)
    }
}

/// When polling is permitted. Validated once at construction, immutable after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleWindow {
    start: NaiveTime,
    end: NaiveTime,
    days: ActiveDays,
    start_date: Option<NaiveDate>,
}

impl ScheduleWindow {
    pub fn new(
        start: NaiveTime,
        end: NaiveTime,
        days: ActiveDays,
        start_date: Option<NaiveDate>,
    ) -> Result<Self, ScheduleError> {
        if start > end {
            return Err(ScheduleError::InvertedWindow { start, end });
        }
        if days.is_empty() {
            return Err(ScheduleError::NoActiveDay);
        }
        Ok(Self { start, end, days, start_date })
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn days(&self) -> ActiveDays {
        self.days
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.start_date
    }

    /// Midnight of the start date, the earliest eligible instant.
    pub fn earliest(&self) -> Option<NaiveDateTime> {
        self.start_date.map(|d| d.and_time(NaiveTime::MIN))
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleGate {
    window: ScheduleWindow,
}

impl ScheduleGate {
    pub fn new(window: ScheduleWindow) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &ScheduleWindow {
        &self.window
    }

    /// Open iff the weekday is active, the time of day lies in
    /// `[start, end]` (inclusive) and the start date, if any, has been reached.
    pub fn is_open(&self, now: NaiveDateTime) -> bool {
        let w = &self.window;
        let tod = now.time();
        w.days.contains(now.weekday())
            && tod >= w.start
            && tod <= w.end
            && w.earliest().map_or(true, |e| now >= e)
    }

    /// Smallest instant `>= now` at which [`is_open`](Self::is_open) holds.
    ///
    /// Returns `None` only for a window without active weekdays, which
    /// [`ScheduleWindow::new`] refuses to build.
    pub fn next_open_instant(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let earliest = match self.window.earliest() {
            Some(e) if e > now => e,
            _ => now,
        };
        if self.is_open(earliest) {
            return Some(earliest);
        }
        // Day 0 plus a full week covers every weekday at least once.
        earliest
            .date()
            .iter_days()
            .take(8)
            .filter(|d| self.window.days.contains(d.weekday()))
            .map(|d| d.and_time(self.window.start))
            .find(|open_at| *open_at >= earliest)
    }

    /// How long to stay idle from `now` until the gate opens.
    pub fn wait_from(&self, now: NaiveDateTime) -> Option<std::time::Duration> {
        self.next_open_instant(now)
            .map(|next| (next - now).to_std().unwrap_or_default())
    }
}
