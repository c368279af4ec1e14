//! Timeslot indexing over the exam period.
//!
//! Slots are numbered `0..T` day by day, `slots_per_day` slots per calendar day, including weekend days. A slot
//! is a night slot iff it is the last slot of its day. Weekend slots are never available, and neither is the
//! night slot of a Friday or of the final exam day.

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

use crate::data::{SemesterConfig, Slot};
use crate::error::DataError;

#[derive(Debug, Clone)]
pub struct ExamCalendar {
    start_date: NaiveDate,
    exam_times: Vec<NaiveTime>,
    num_days: usize,
    available: Vec<bool>,
}

impl ExamCalendar {
    pub fn new(semester: &SemesterConfig) -> Result<Self, DataError> {
        if semester.exam_start_times.is_empty() {
            return Err(DataError::NoExamTimes);
        }
        if semester.end_date < semester.start_date {
            return Err(DataError::BadExamWindow {
                start: semester.start_date.to_string(),
                end: semester.end_date.to_string(),
            });
        }
        let exam_times = semester
            .exam_start_times
            .iter()
            .map(|s| parse_exam_time(s))
            .collect::<Result<Vec<_>, _>>()?;

        let num_days = (semester.end_date - semester.start_date).num_days() as usize + 1;
        let slots_per_day = exam_times.len();
        let mut available = Vec::with_capacity(num_days * slots_per_day);
        for day in 0..num_days {
            let date = semester.start_date + Days::new(day as u64);
            let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
            let no_night = date.weekday() == Weekday::Fri || date == semester.end_date;
            for i in 0..slots_per_day {
                let night = i == slots_per_day - 1;
                available.push(!weekend && !(night && no_night));
            }
        }

        Ok(ExamCalendar {
            start_date: semester.start_date,
            exam_times,
            num_days,
            available,
        })
    }

    pub fn slots_per_day(&self) -> usize {
        self.exam_times.len()
    }

    pub fn num_days(&self) -> usize {
        self.num_days
    }

    /// Total number of slots, valid and invalid.
    pub fn num_slots(&self) -> usize {
        self.available.len()
    }

    pub fn is_available(&self, slot: Slot) -> bool {
        self.available.get(slot).copied().unwrap_or(false)
    }

    pub fn is_night(&self, slot: Slot) -> bool {
        slot % self.slots_per_day() == self.slots_per_day() - 1
    }

    pub fn available_slots(&self) -> impl Iterator<Item = Slot> + '_ {
        (0..self.num_slots()).filter(move |t| self.available[*t])
    }

    pub fn date_of(&self, slot: Slot) -> NaiveDate {
        self.start_date + Days::new((slot / self.slots_per_day()) as u64)
    }

    pub fn start_time(&self, slot: Slot) -> NaiveDateTime {
        self.date_of(slot)
            .and_time(self.exam_times[slot % self.slots_per_day()])
    }

    /// Human readable start of a slot, e.g. `Monday, 12/09, 08:00 AM`.
    pub fn label(&self, slot: Slot) -> String {
        self.start_time(slot).format("%A, %m/%d, %I:%M %p").to_string()
    }

    /// Hours between the starts of two slots.
    pub fn hours_between(&self, from: Slot, to: Slot) -> f64 {
        (self.start_time(to) - self.start_time(from)).num_minutes() as f64 / 60.0
    }

    /// All slots from `start` on whose start time lies less than `hours` after the start of `start`.
    pub fn window_within(&self, start: Slot, hours: f64) -> Vec<Slot> {
        (start..self.num_slots())
            .take_while(|t| self.hours_between(start, *t) < hours)
            .collect()
    }

    /// Slots of the last `days` calendar days of the period.
    pub fn last_days_slots(&self, days: usize) -> Vec<Slot> {
        let first_day = self.num_days.saturating_sub(days);
        (first_day * self.slots_per_day()..self.num_slots()).collect()
    }

    pub fn night_slots(&self) -> Vec<Slot> {
        (0..self.num_slots()).filter(|t| self.is_night(*t)).collect()
    }

    /// Slots falling on any of the given weekdays.
    pub fn weekday_slots(&self, weekdays: &[Weekday]) -> Vec<Slot> {
        (0..self.num_slots())
            .filter(|t| weekdays.contains(&self.date_of(*t).weekday()))
            .collect()
    }
}

fn parse_exam_time(raw: &str) -> Result<NaiveTime, DataError> {
    let s = raw.trim();
    NaiveTime::parse_from_str(s, "%I:%M %p")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| DataError::BadExamTime(raw.to_string()))
}
