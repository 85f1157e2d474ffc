// src/engine/calendar.rs

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc, Weekday,
};
use serde::Serialize;

use super::{EngineError, EngineResult};

/// Business hours, weekly closed day and slot granularity.
///
/// Hours are wall-clock times at `utc_offset`; every timestamp leaving this
/// module is UTC.
#[derive(Debug, Clone)]
pub struct CalendarPolicy {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub slot_minutes: u32,
    pub closed_weekday: Option<Weekday>,
    pub utc_offset: FixedOffset,
}

#[derive(Debug, Serialize)]
pub struct CalendarPolicyDto {
    pub open: String,
    pub close: String,
    pub slot_minutes: u32,
    pub closed_weekday: Option<String>,
    pub utc_offset_minutes: i32,
}

impl CalendarPolicy {
    pub fn new(
        open: NaiveTime,
        close: NaiveTime,
        slot_minutes: u32,
        closed_weekday: Option<Weekday>,
        utc_offset: FixedOffset,
    ) -> EngineResult<Self> {
        if close <= open {
            return Err(EngineError::validation("close", "closing time must be after opening time"));
        }
        if slot_minutes == 0 || slot_minutes > 24 * 60 {
            return Err(EngineError::validation(
                "slot_minutes",
                "slot granularity must be 1..=1440 minutes",
            ));
        }
        Ok(Self {
            open,
            close,
            slot_minutes,
            closed_weekday,
            utc_offset,
        })
    }

    pub fn slot_length(&self) -> Duration {
        Duration::minutes(i64::from(self.slot_minutes))
    }

    pub fn is_closed(&self, date: NaiveDate) -> bool {
        use chrono::Datelike;
        self.closed_weekday == Some(date.weekday())
    }

    /// Clinic-local calendar date of an instant.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.utc_offset).date_naive()
    }

    /// UTC instant of a clinic-local wall-clock time on `date`.
    pub fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        // A fixed offset maps every local time to exactly one instant.
        match self.utc_offset.from_local_datetime(&date.and_time(time)).single() {
            Some(local) => local.with_timezone(&Utc),
            None => Utc.from_utc_datetime(&date.and_time(time)),
        }
    }

    /// Whole clinic-local day as a half-open UTC range.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.at(date, NaiveTime::MIN);
        (start, start + Duration::days(1))
    }

    /// Business-hours window for `date`, `None` on the closed weekday.
    pub fn business_window(&self, date: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if self.is_closed(date) {
            return None;
        }
        Some((self.at(date, self.open), self.at(date, self.close)))
    }

    /// Candidate slot starts across business hours; a slot must end by closing time.
    pub fn candidate_slots(&self, date: NaiveDate) -> Vec<DateTime<Utc>> {
        let Some((open, close)) = self.business_window(date) else {
            return vec![];
        };
        let step = self.slot_length();
        let mut out = Vec::new();
        let mut cursor = open;
        while cursor + step <= close {
            out.push(cursor);
            cursor += step;
        }
        out
    }

    pub fn to_dto(&self) -> CalendarPolicyDto {
        CalendarPolicyDto {
            open: self.open.format("%H:%M").to_string(),
            close: self.close.format("%H:%M").to_string(),
            slot_minutes: self.slot_minutes,
            closed_weekday: self.closed_weekday.map(|d| d.to_string()),
            utc_offset_minutes: self.utc_offset.local_minus_utc() / 60,
        }
    }
}

pub fn parse_weekday(raw: &str) -> EngineResult<Option<Weekday>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    raw.parse::<Weekday>()
        .map(Some)
        .map_err(|_| EngineError::validation("closed_weekday", format!("unknown weekday '{raw}'")))
}
