//! A single rental bay: booking queue, derived state and device power.
//!
//! # State derivation
//!
//! A station stores only its activation flag and its queue. Everything the
//! operator sees is derived on [`Station::refresh`]:
//!
//! 1. sort the queue by start
//! 2. archive every session whose end is at or before now
//! 3. recompute the customer label
//! 4. assert the device power state (on while a session runs, off otherwise)
//!
//! The order matters: a session that expires on this tick is archived before
//! the running check, so it is never reported as running.

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;
use thiserror::Error;

use crate::clock::Clock;
use crate::device::{Device, PowerIntent, PowerSink, PowerState};
use crate::session::{Session, SessionError, SessionId, format_hours_minutes};
use crate::tracker::SessionTracker;

/// Granularity of the suggested start time for new bookings.
const SUGGESTION_STEP_SECS: u32 = 30 * 60;

/// Collaborators shared by every station.
#[derive(Clone)]
pub struct Context {
    pub clock: Arc<dyn Clock>,
    pub power: Arc<dyn PowerSink>,
}

impl Context {
    pub fn new(clock: Arc<dyn Clock>, power: Arc<dyn PowerSink>) -> Self {
        Self { clock, power }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// Station operation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StationError {
    /// A session ID did not resolve to a queued session. Indicates a stale
    /// reference held by the caller.
    #[error("no queued session with id {0}")]
    SessionNotFound(SessionId),
    /// Bookings are refused while the station is deactivated.
    #[error("station {0} is deactivated")]
    Deactivated(usize),
    #[error(transparent)]
    InvalidInterval(#[from] SessionError),
}

/// Decides whether conflicting sessions may be removed to make room for a
/// booking.
pub trait ConfirmConflicts {
    fn confirm(&mut self, candidate: &Session, conflicts: &[Session]) -> bool;
}

/// A fixed answer to every conflict prompt.
#[derive(Debug, Clone, Copy)]
pub struct Confirm(pub bool);

impl ConfirmConflicts for Confirm {
    fn confirm(&mut self, _candidate: &Session, _conflicts: &[Session]) -> bool {
        self.0
    }
}

/// Input to [`Station::add_session`].
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub customer_name: String,
    /// `None` chains the booking after the last queued session, or starts it
    /// now when the queue is empty.
    pub start: Option<NaiveDateTime>,
    pub duration: Duration,
    /// Set when resubmitting an edited session; the queued entry with this ID
    /// is replaced.
    pub session_id: Option<SessionId>,
}

impl BookingRequest {
    pub fn new(
        customer_name: impl Into<String>,
        start: Option<NaiveDateTime>,
        duration: Duration,
    ) -> Self {
        Self {
            customer_name: customer_name.into(),
            start,
            duration,
            session_id: None,
        }
    }
}

/// Result of a booking attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingOutcome {
    Added(SessionId),
    /// Conflicts were found and the confirmation was declined. The queue is
    /// unchanged.
    Declined,
}

impl BookingOutcome {
    pub const fn is_added(self) -> bool {
        matches!(self, Self::Added(_))
    }
}

/// How a deleted session is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    /// Archive only if the session is running now, clamping its end to now.
    /// Sessions that never started are discarded.
    Auto,
    Archive,
    Discard,
}

/// What happened to a deleted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Archived,
    Discarded,
}

/// Patch applied to a queued session by [`Station::edit_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionEdit {
    pub customer_name: Option<String>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub duration: Option<Duration>,
}

/// Typed partial update for [`Station::update`]. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct StationUpdate {
    pub device: Option<Device>,
    pub customer_label: Option<String>,
    pub activated: Option<bool>,
    pub sessions: Option<Vec<Session>>,
}

/// Full state detached from a station, used when a device changes slot.
#[derive(Debug, Clone)]
pub struct StationState {
    pub device: Option<Device>,
    pub customer_label: String,
    pub activated: bool,
    pub sessions: Vec<Session>,
    pub tracker: SessionTracker,
}

/// Read-only, formatted snapshot for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StationView {
    pub slot: usize,
    pub device_name: String,
    pub device_id: Option<String>,
    pub customer_label: String,
    pub is_activated: bool,
    pub is_running: bool,
    pub is_hidden: bool,
    pub start_time: String,
    pub end_time: String,
    pub time_left: String,
    pub queued: usize,
}

/// A fixed rental slot.
#[derive(Debug)]
pub struct Station {
    slot: usize,
    device: Option<Device>,
    activated: bool,
    hidden: bool,
    customer_label: String,
    sessions: Vec<Session>,
    tracker: SessionTracker,
    ctx: Context,
}

impl Station {
    /// Creates an empty, deactivated, hidden station.
    pub fn new(slot: usize, ctx: Context) -> Self {
        Self {
            slot,
            device: None,
            activated: false,
            hidden: true,
            customer_label: String::new(),
            sessions: Vec::new(),
            tracker: SessionTracker::new(),
            ctx,
        }
    }

    pub const fn slot(&self) -> usize {
        self.slot
    }

    pub const fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub const fn is_activated(&self) -> bool {
        self.activated
    }

    pub const fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn customer_label(&self) -> &str {
        &self.customer_label
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub const fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// The session whose interval contains now, if the station is active.
    pub fn running_session(&self) -> Option<&Session> {
        self.running_at(self.ctx.now())
    }

    pub fn is_running(&self) -> bool {
        self.running_session().is_some()
    }

    /// Activates or deactivates the station.
    ///
    /// Deactivating drains the queue (each session under [`Track::Auto`]) and
    /// turns the device off.
    pub fn set_activated(&mut self, activated: bool) {
        self.activated = activated;
        if !activated {
            self.drain_queue();
            self.assert_power(PowerState::Off);
        }
        tracing::info!(slot = self.slot, activated, "station activation changed");
        self.refresh();
    }

    /// Books a session.
    ///
    /// Conflicting queued sessions are offered to `confirm`. If it agrees they
    /// are deleted under [`Track::Auto`] and the candidate is added under a
    /// fresh ID; otherwise the queue is left untouched.
    pub fn add_session(
        &mut self,
        request: BookingRequest,
        confirm: &mut dyn ConfirmConflicts,
    ) -> Result<BookingOutcome, StationError> {
        if !self.activated {
            return Err(StationError::Deactivated(self.slot));
        }
        if let Some(id) = request.session_id {
            self.position(id)?;
        }

        let start = request
            .start
            .unwrap_or_else(|| self.sessions.last().map_or_else(|| self.ctx.now(), Session::end));
        let mut candidate = match request.session_id {
            Some(id) => Session::with_id(id, request.customer_name, start, request.duration)?,
            None => Session::new(request.customer_name, start, request.duration)?,
        };

        let conflicts: Vec<Session> = self
            .sessions
            .iter()
            .filter(|queued| Some(queued.id()) != request.session_id && queued.overlaps(&candidate))
            .cloned()
            .collect();

        if !conflicts.is_empty() {
            if !confirm.confirm(&candidate, &conflicts) {
                tracing::info!(
                    slot = self.slot,
                    conflicts = conflicts.len(),
                    "booking declined due to conflicts"
                );
                return Ok(BookingOutcome::Declined);
            }
            for conflict in &conflicts {
                self.delete_session(conflict.id(), Track::Auto)?;
            }
            if let Some(id) = request.session_id {
                self.delete_session(id, Track::Discard)?;
            }
            candidate = candidate.reissued();
        } else if let Some(id) = request.session_id {
            self.delete_session(id, Track::Discard)?;
        }

        let id = candidate.id();
        tracing::info!(
            slot = self.slot,
            session_id = %id,
            customer = candidate.customer_name(),
            start = %candidate.start(),
            end = %candidate.end(),
            "session booked"
        );
        self.sessions.push(candidate);
        self.sessions.sort_by_key(Session::start);
        self.refresh();
        Ok(BookingOutcome::Added(id))
    }

    /// Edits a queued session by copying it, applying `edit` and resubmitting
    /// the copy under the same ID.
    ///
    /// An invalid end time is rejected before anything is resubmitted.
    pub fn edit_session(
        &mut self,
        id: SessionId,
        edit: SessionEdit,
        confirm: &mut dyn ConfirmConflicts,
    ) -> Result<BookingOutcome, StationError> {
        let mut session = self.sessions[self.position(id)?].clone();
        if let Some(name) = edit.customer_name {
            session.set_customer_name(name);
        }
        if let Some(start) = edit.start {
            session.set_start(start);
        }
        if let Some(end) = edit.end {
            session.set_end(end)?;
        }
        if let Some(duration) = edit.duration {
            session.set_duration(duration)?;
        }

        let request = BookingRequest {
            customer_name: session.customer_name().to_string(),
            start: Some(session.start()),
            duration: session.duration(),
            session_id: Some(id),
        };
        self.add_session(request, confirm)
    }

    /// Removes a queued session.
    pub fn delete_session(&mut self, id: SessionId, track: Track) -> Result<Removal, StationError> {
        let index = self.position(id)?;
        let session = self.sessions.remove(index);
        Ok(self.retire(session, track))
    }

    /// Removes several queued sessions under [`Track::Auto`].
    ///
    /// Stops at the first unknown ID; sessions removed before it stay removed.
    pub fn delete_sessions(&mut self, ids: &[SessionId]) -> Result<usize, StationError> {
        for id in ids {
            self.delete_session(*id, Track::Auto)?;
        }
        self.refresh();
        Ok(ids.len())
    }

    /// Periodic tick: sweep, relabel and assert device power.
    pub fn refresh(&mut self) {
        let now = self.ctx.now();
        self.sessions.sort_by_key(Session::start);

        let (expired, queued): (Vec<Session>, Vec<Session>) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|session| session.end() <= now);
        self.sessions = queued;
        for session in expired {
            tracing::info!(
                slot = self.slot,
                session_id = %session.id(),
                customer = session.customer_name(),
                "session completed"
            );
            self.tracker.add_session_to_history(session);
        }

        let running = self.running_at(now).map(|s| s.customer_name().to_string());
        self.customer_label = match (&running, self.sessions.first()) {
            (Some(name), _) => name.clone(),
            (None, Some(next)) if next.start() > now => format!(
                "{} starts at {}",
                next.customer_name(),
                next.start().format("%H:%M")
            ),
            _ => String::new(),
        };

        let state = if running.is_some() {
            PowerState::On
        } else {
            PowerState::Off
        };
        self.assert_power(state);
    }

    /// Applies a partial update, then refreshes.
    ///
    /// A deactivated station never keeps a queue, so sessions patched onto a
    /// deactivated station are drained.
    pub fn update(&mut self, update: StationUpdate) {
        if let Some(device) = update.device {
            self.device = Some(device);
        }
        if let Some(label) = update.customer_label {
            self.customer_label = label;
        }
        if let Some(activated) = update.activated {
            self.activated = activated;
        }
        if let Some(sessions) = update.sessions {
            self.sessions = sessions;
        }
        if !self.activated && !self.sessions.is_empty() {
            self.drain_queue();
        }
        self.refresh();
    }

    /// Detaches all state, leaving the station empty. No power intents are
    /// issued; the state is expected to be applied to another station.
    pub fn take_state(&mut self) -> StationState {
        StationState {
            device: self.device.take(),
            customer_label: std::mem::take(&mut self.customer_label),
            activated: std::mem::replace(&mut self.activated, false),
            sessions: std::mem::take(&mut self.sessions),
            tracker: std::mem::take(&mut self.tracker),
        }
    }

    /// Applies state detached from another station, bound to `device`.
    pub fn apply_state(&mut self, state: StationState, device: Device) {
        self.tracker = state.tracker;
        self.hidden = false;
        self.update(StationUpdate {
            device: Some(device),
            customer_label: Some(state.customer_label),
            activated: Some(state.activated),
            sessions: Some(state.sessions),
        });
    }

    /// Binds a device that has no state on any other station.
    pub fn bind_new(&mut self, device: Device, tracker: SessionTracker) {
        self.tracker = tracker;
        self.hidden = false;
        self.update(StationUpdate {
            device: Some(device),
            customer_label: Some(String::new()),
            activated: Some(false),
            sessions: Some(Vec::new()),
        });
    }

    /// Releases the bound device: drains the queue, turns the device off and
    /// hands back the device together with its archive.
    pub fn release(&mut self) -> Option<(Device, SessionTracker)> {
        self.drain_queue();
        self.assert_power(PowerState::Off);
        self.activated = false;
        self.customer_label.clear();
        let tracker = std::mem::take(&mut self.tracker);
        self.device.take().map(|device| (device, tracker))
    }

    /// Resets to defaults, optionally hiding the station from display.
    ///
    /// Hands back the device that was bound, together with its archive.
    pub fn reset(&mut self, hide: bool) -> Option<(Device, SessionTracker)> {
        let released = self.release();
        if hide {
            self.hidden = true;
        }
        self.refresh();
        released
    }

    /// Start time proposed for the next booking.
    ///
    /// The end of the queue (or now) rounded up to the next half hour. If that
    /// falls on a later day, 23:59 today is proposed instead.
    pub fn suggested_start(&self) -> NaiveDateTime {
        let now = self.ctx.now();
        let base = self.sessions.last().map_or(now, Session::end);
        let rounded = ceil_to_step(base, SUGGESTION_STEP_SECS);
        if rounded.date() > now.date() {
            now.date()
                .and_time(NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN))
        } else {
            rounded
        }
    }

    pub fn view(&self) -> StationView {
        let now = self.ctx.now();
        let running = self.running_at(now);
        let is_running = running.is_some();
        let (start_time, end_time, time_left) = match running {
            Some(session) => (
                session.start().format("%H:%M").to_string(),
                session.end().format("%H:%M").to_string(),
                format_hours_minutes(session.end() - now),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        StationView {
            slot: self.slot,
            device_name: self
                .device
                .as_ref()
                .map(|device| device.name.clone())
                .unwrap_or_default(),
            device_id: self.device.as_ref().map(|device| device.id.to_string()),
            customer_label: self.customer_label.clone(),
            is_activated: self.activated,
            is_running,
            is_hidden: self.hidden,
            start_time,
            end_time,
            time_left,
            queued: self.sessions.len(),
        }
    }

    fn running_at(&self, now: NaiveDateTime) -> Option<&Session> {
        if !self.activated {
            return None;
        }
        self.sessions.iter().find(|session| session.contains(now))
    }

    fn position(&self, id: SessionId) -> Result<usize, StationError> {
        self.sessions
            .iter()
            .position(|session| session.id() == id)
            .ok_or_else(|| {
                tracing::error!(slot = self.slot, session_id = %id, "stale session reference");
                StationError::SessionNotFound(id)
            })
    }

    fn retire(&mut self, mut session: Session, track: Track) -> Removal {
        let archive = match track {
            Track::Archive => true,
            Track::Discard => false,
            Track::Auto => {
                let now = self.ctx.now();
                session.contains(now) && session.set_end(now).is_ok()
            }
        };
        tracing::debug!(
            slot = self.slot,
            session_id = %session.id(),
            archive,
            "session removed from queue"
        );
        if archive {
            self.tracker.add_session_to_history(session);
            Removal::Archived
        } else {
            Removal::Discarded
        }
    }

    fn drain_queue(&mut self) {
        for session in std::mem::take(&mut self.sessions) {
            self.retire(session, Track::Auto);
        }
    }

    fn assert_power(&self, state: PowerState) {
        if let Some(device) = &self.device {
            self.ctx.power.submit(PowerIntent {
                device: device.clone(),
                state,
            });
        }
    }
}

fn ceil_to_step(instant: NaiveDateTime, step_secs: u32) -> NaiveDateTime {
    let secs = instant.time().num_seconds_from_midnight();
    let remainder = secs % step_secs;
    if remainder == 0 && instant.nanosecond() == 0 {
        return instant;
    }
    let floored = instant.date().and_time(NaiveTime::MIN)
        + Duration::seconds(i64::from(secs - remainder));
    floored + Duration::seconds(i64::from(step_secs))
}
