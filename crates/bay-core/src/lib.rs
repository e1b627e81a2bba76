//! Core scheduling logic for golf-simulator bays.
//!
//! This crate contains:
//! - Sessions: booked intervals and their arithmetic
//! - Stations: per-bay booking queue, conflict handling and device power
//! - Session tracking: archive of completed sessions and statistics
//! - Reconciliation: mapping discovered devices onto fixed station slots

mod bank;
pub mod clock;
pub mod device;
pub mod session;
pub mod station;
pub mod tracker;

pub use bank::StationBank;
pub use clock::{Clock, ManualClock, SystemClock};
pub use device::{
    Device, DeviceError, DeviceErrorKind, DeviceId, NullPowerSink, PowerIntent, PowerSink,
    PowerState,
};
pub use session::{Session, SessionError, SessionId, SessionRecord, format_hours_minutes};
pub use station::{
    BookingOutcome, BookingRequest, Confirm, ConfirmConflicts, Context, Removal, SessionEdit,
    Station, StationError, StationState, StationUpdate, StationView, Track,
};
pub use tracker::{SessionStats, SessionTracker, StatsView};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use chrono::{NaiveDate, NaiveDateTime};

    use crate::{Context, ManualClock, PowerIntent, PowerSink, PowerState};

    /// Records every submitted intent.
    #[derive(Debug, Default)]
    pub struct RecordingPower {
        intents: Mutex<Vec<PowerIntent>>,
    }

    impl RecordingPower {
        pub fn take(&self) -> Vec<(String, PowerState)> {
            self.intents
                .lock()
                .unwrap()
                .drain(..)
                .map(|intent| (intent.device.id.to_string(), intent.state))
                .collect()
        }
    }

    impl PowerSink for RecordingPower {
        fn submit(&self, intent: PowerIntent) {
            self.intents.lock().unwrap().push(intent);
        }
    }

    pub fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    pub fn context(now: NaiveDateTime) -> (Context, Arc<ManualClock>, Arc<RecordingPower>) {
        let clock = Arc::new(ManualClock::new(now));
        let power = Arc::new(RecordingPower::default());
        let ctx = Context::new(clock.clone(), power.clone());
        (ctx, clock, power)
    }
}
