//! Booked time intervals.
//!
//! A [`Session`] is a customer label plus a `[start, start + duration]`
//! interval on the local wall clock. Durations have minute granularity; any
//! seconds are truncated when a duration is set.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Process-wide session ID counter.
///
/// There is exactly one counter per process. IDs are never reused, even after
/// a session is deleted. IDs restored from the archive are reserved through
/// [`SessionId::reserve`] so newly issued IDs stay above them.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Errors from session interval arithmetic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The end of an interval would not be strictly after its start.
    #[error("end time {end} must be after start time {start}")]
    InvalidInterval {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
}

/// Identifier of a session, unique within the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocates the next ID from the process-wide counter.
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw ID, e.g. one read back from storage.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Ensures IDs allocated from now on are greater than this one.
    pub fn reserve(self) {
        NEXT_SESSION_ID.fetch_max(self.0.saturating_add(1), Ordering::Relaxed);
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A single customer's booked time interval.
///
/// `Clone` is the value copy used for edits: it preserves the ID, and the copy
/// is independent of the queue it came from until it is resubmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    customer_name: String,
    start: NaiveDateTime,
    duration: Duration,
}

impl Session {
    /// Creates a session with a freshly allocated ID.
    pub fn new(
        customer_name: impl Into<String>,
        start: NaiveDateTime,
        duration: Duration,
    ) -> Result<Self, SessionError> {
        Self::with_id(SessionId::next(), customer_name, start, duration)
    }

    /// Creates a session that keeps an existing ID.
    pub fn with_id(
        id: SessionId,
        customer_name: impl Into<String>,
        start: NaiveDateTime,
        duration: Duration,
    ) -> Result<Self, SessionError> {
        let duration = validate_duration(start, duration)?;
        Ok(Self {
            id,
            customer_name: customer_name.into(),
            start,
            duration,
        })
    }

    /// Rebuilds a session from its stored form.
    pub fn from_record(record: &SessionRecord) -> Result<Self, SessionError> {
        Self::with_id(
            SessionId::from_raw(record.session_id),
            record.customer_name.clone(),
            record.start_date,
            Duration::minutes(record.duration_minutes),
        )
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn customer_name(&self) -> &str {
        &self.customer_name
    }

    #[must_use]
    pub const fn start(&self) -> NaiveDateTime {
        self.start
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub fn end(&self) -> NaiveDateTime {
        self.start + self.duration
    }

    pub fn set_customer_name(&mut self, customer_name: impl Into<String>) {
        self.customer_name = customer_name.into();
    }

    /// Moves the session; the duration is kept so the end moves with it.
    pub fn set_start(&mut self, start: NaiveDateTime) {
        self.start = start;
    }

    pub fn set_duration(&mut self, duration: Duration) -> Result<(), SessionError> {
        self.duration = validate_duration(self.start, duration)?;
        Ok(())
    }

    /// Sets the end by recomputing the duration.
    ///
    /// Rejected if the new end is not strictly after the start once truncated
    /// to whole minutes; the session is left unchanged in that case.
    pub fn set_end(&mut self, end: NaiveDateTime) -> Result<(), SessionError> {
        self.set_duration(end - self.start)
    }

    /// Whether `instant` lies within the session, inclusive at both ends.
    #[must_use]
    pub fn contains(&self, instant: NaiveDateTime) -> bool {
        self.start <= instant && instant <= self.end()
    }

    /// Open-interval overlap test. Touching endpoints do not conflict.
    #[must_use]
    pub fn conflicts_with(&self, other_start: NaiveDateTime, other_end: NaiveDateTime) -> bool {
        self.start < other_end && other_start < self.end()
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.conflicts_with(other.start, other.end())
    }

    /// Same booking under a new ID.
    #[must_use]
    pub fn reissued(self) -> Self {
        Self {
            id: SessionId::next(),
            ..self
        }
    }

    /// Extracts the stored form of this session.
    #[must_use]
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.id.get(),
            customer_name: self.customer_name.clone(),
            start_date: self.start,
            duration_minutes: self.duration.num_minutes(),
        }
    }
}

/// Flat, serializable form of a [`Session`] used for storage and export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: u64,
    pub customer_name: String,
    pub start_date: NaiveDateTime,
    pub duration_minutes: i64,
}

fn validate_duration(start: NaiveDateTime, duration: Duration) -> Result<Duration, SessionError> {
    let duration = Duration::minutes(duration.num_minutes());
    if duration <= Duration::zero() {
        return Err(SessionError::InvalidInterval {
            start,
            end: start + duration,
        });
    }
    Ok(duration)
}

/// Formats a duration as `HH:MM`, truncating seconds.
///
/// Hours are not wrapped at 24, so long totals read as e.g. `26:30`.
#[must_use]
pub fn format_hours_minutes(duration: Duration) -> String {
    let minutes = duration.num_minutes().max(0);
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}
