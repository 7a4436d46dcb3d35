use chrono::{NaiveTime, Weekday};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("unknown day: {0}")]
    BadDay(String),
    #[error("time must be HH:MM, got {0}")]
    BadTime(String),
    #[error("end time must be after start time")]
    EmptyRange,
}

pub fn parse_day(raw: &str) -> Result<Weekday, SlotError> {
    raw.trim()
        .parse::<Weekday>()
        .map_err(|_| SlotError::BadDay(raw.to_string()))
}

pub fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

pub fn parse_time(raw: &str) -> Result<NaiveTime, SlotError> {
    let t = raw.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .map_err(|_| SlotError::BadTime(raw.to_string()))
}

pub fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// A half-open `[start, end)` period on one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Slot {
    pub fn new(day: Weekday, start: NaiveTime, end: NaiveTime) -> Result<Self, SlotError> {
        if end <= start {
            return Err(SlotError::EmptyRange);
        }
        Ok(Self { day, start, end })
    }

    pub fn parse(day: &str, start: &str, end: &str) -> Result<Self, SlotError> {
        Self::new(parse_day(day)?, parse_time(start)?, parse_time(end)?)
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.day == other.day && self.start < other.end && self.end > other.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub entry_id: String,
    pub class_id: String,
    pub teacher_id: Option<String>,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedBooking {
    pub class_id: String,
    pub teacher_id: Option<String>,
    pub slot: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    Class,
    Teacher,
}

impl ConflictKind {
    pub fn message(self) -> &'static str {
        match self {
            ConflictKind::Class => "time conflict for this class",
            ConflictKind::Teacher => "teacher is already scheduled at that time",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConflict<'a> {
    pub kind: ConflictKind,
    pub existing: &'a Booking,
}

/// First booking of the same class that overlaps the proposal.
pub fn class_clash<'a>(existing: &'a [Booking], proposed: &ProposedBooking) -> Option<&'a Booking> {
    existing
        .iter()
        .find(|b| b.class_id == proposed.class_id && b.slot.overlaps(&proposed.slot))
}

/// First booking of the proposal's teacher, in any class, that overlaps it.
/// A proposal without a teacher never clashes here.
pub fn teacher_clash<'a>(
    existing: &'a [Booking],
    proposed: &ProposedBooking,
) -> Option<&'a Booking> {
    let teacher_id = proposed.teacher_id.as_deref()?;
    existing
        .iter()
        .find(|b| b.teacher_id.as_deref() == Some(teacher_id) && b.slot.overlaps(&proposed.slot))
}

/// Class clashes are reported ahead of teacher clashes.
pub fn find_conflict<'a>(
    existing: &'a [Booking],
    proposed: &ProposedBooking,
) -> Option<SlotConflict<'a>> {
    if let Some(b) = class_clash(existing, proposed) {
        return Some(SlotConflict {
            kind: ConflictKind::Class,
            existing: b,
        });
    }
    teacher_clash(existing, proposed).map(|b| SlotConflict {
        kind: ConflictKind::Teacher,
        existing: b,
    })
}

pub fn has_conflict(existing: &[Booking], proposed: &ProposedBooking) -> bool {
    find_conflict(existing, proposed).is_some()
}
