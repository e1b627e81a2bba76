//! Archive of completed sessions and the statistics derived from it.

use std::collections::HashSet;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::session::{Session, SessionRecord, format_hours_minutes};

/// Archived sessions for one device.
///
/// Entries stay sorted by start. A newly archived session that conflicts with
/// an archived one supersedes it (last write wins), so a corrected or
/// extended booking replaces the earlier entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTracker {
    sessions: Vec<Session>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores an archive as stored, without applying override semantics.
    pub fn from_sessions(mut sessions: Vec<Session>) -> Self {
        sessions.sort_by_key(Session::start);
        Self { sessions }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Archives a session, dropping every entry it conflicts with.
    ///
    /// Returns the number of superseded entries.
    pub fn add_session_to_history(&mut self, session: Session) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|archived| !archived.overlaps(&session));
        let superseded = before - self.sessions.len();
        if superseded > 0 {
            tracing::debug!(
                session_id = %session.id(),
                superseded,
                "archived session overrides earlier entries"
            );
        }
        let index = self
            .sessions
            .partition_point(|archived| archived.start() <= session.start());
        self.sessions.insert(index, session);
        superseded
    }

    /// Statistics over the entire archive.
    pub fn stats(&self) -> SessionStats {
        SessionStats::calculate(&self.sessions)
    }

    /// Statistics over sessions that started on `day`.
    pub fn stats_on(&self, day: NaiveDate) -> SessionStats {
        let sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|session| session.start().date() == day)
            .cloned()
            .collect();
        SessionStats::calculate(&sessions)
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        self.sessions.iter().map(Session::to_record).collect()
    }
}

/// Aggregate statistics over a set of sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub total_time: Duration,
    pub average_time: Duration,
    pub total_sessions: usize,
    /// Sessions per distinct start date, rounded to one decimal.
    pub average_sessions_per_day: f64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            total_time: Duration::zero(),
            average_time: Duration::zero(),
            total_sessions: 0,
            average_sessions_per_day: 0.0,
        }
    }
}

impl SessionStats {
    pub fn calculate(sessions: &[Session]) -> Self {
        if sessions.is_empty() {
            return Self::default();
        }

        let total_minutes: i64 = sessions
            .iter()
            .map(|session| session.duration().num_minutes())
            .sum();
        let count = i64::try_from(sessions.len()).unwrap_or(i64::MAX);
        let days: HashSet<NaiveDate> = sessions
            .iter()
            .map(|session| session.start().date())
            .collect();

        #[expect(
            clippy::cast_precision_loss,
            reason = "session and day counts are far below f64 precision limits"
        )]
        let per_day = sessions.len() as f64 / days.len() as f64;

        Self {
            total_time: Duration::minutes(total_minutes),
            average_time: Duration::minutes(total_minutes / count),
            total_sessions: sessions.len(),
            average_sessions_per_day: (per_day * 10.0).round() / 10.0,
        }
    }

    /// Pre-formatted form for display.
    pub fn view(&self) -> StatsView {
        StatsView {
            total_time: format_hours_minutes(self.total_time),
            average_time: format_hours_minutes(self.average_time),
            total_sessions: self.total_sessions,
            average_sessions_per_day: format_per_day(self.average_sessions_per_day),
        }
    }
}

/// Read-only, formatted statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsView {
    pub total_time: String,
    pub average_time: String,
    pub total_sessions: usize,
    pub average_sessions_per_day: String,
}

/// Renders as an integer when there is no fractional part.
fn format_per_day(value: f64) -> String {
    if value.fract().abs() < f64::EPSILON {
        format!("{value:.0}")
    } else {
        format!("{value:.1}")
    }
}
