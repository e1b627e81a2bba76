//! Device-to-station reconciliation.
//!
//! Discovery returns devices in no particular order, and names can change
//! between calls. [`StationBank::reconcile`] maps them onto the fixed slots
//! by sorted name while keeping state tied to device identity:
//!
//! - a device that keeps its slot only has its name refreshed
//! - a device that moves takes its queue, activation and archive with it
//! - a device seen for the first time starts deactivated, with any archive
//!   stored for its ID restored
//! - slots left without a device are reset and hidden
//!
//! All state is detached before any slot is reassigned, so a pass never reads
//! a station that was already overwritten in the same pass.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;

use crate::device::{Device, DeviceId};
use crate::session::{Session, SessionRecord};
use crate::station::{Context, Station, StationState, StationUpdate, StationView};
use crate::tracker::SessionTracker;

/// The fixed set of stations plus the bookkeeping that survives rebinding.
#[derive(Debug)]
pub struct StationBank {
    ctx: Context,
    stations: Vec<Station>,
    /// Slot each device was last bound to. Updated across passes.
    assignments: HashMap<DeviceId, usize>,
    /// Archives of devices that are not bound to any slot right now.
    archives: HashMap<DeviceId, SessionTracker>,
    /// Last known display name per device, for export.
    names: HashMap<DeviceId, String>,
}

impl StationBank {
    /// Creates `station_count` empty stations and loads stored archives.
    pub fn new(
        station_count: usize,
        ctx: Context,
        archives: HashMap<DeviceId, Vec<Session>>,
    ) -> Self {
        let stations = (0..station_count)
            .map(|slot| Station::new(slot, ctx.clone()))
            .collect();
        let archives = archives
            .into_iter()
            .map(|(device_id, sessions)| {
                for session in &sessions {
                    session.id().reserve();
                }
                (device_id, SessionTracker::from_sessions(sessions))
            })
            .collect();
        Self {
            ctx,
            stations,
            assignments: HashMap::new(),
            archives,
            names: HashMap::new(),
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.ctx.now()
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn station(&self, slot: usize) -> Option<&Station> {
        self.stations.get(slot)
    }

    pub fn station_mut(&mut self, slot: usize) -> Option<&mut Station> {
        self.stations.get_mut(slot)
    }

    /// Slot the device was last assigned to.
    pub fn slot_of(&self, device_id: &DeviceId) -> Option<usize> {
        self.assignments.get(device_id).copied()
    }

    /// Re-maps discovered devices onto the station slots, then refreshes
    /// every station.
    pub fn reconcile(&mut self, mut devices: Vec<Device>) {
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        let mut seen = HashSet::new();
        devices.retain(|device| seen.insert(device.id.clone()));
        if devices.len() > self.stations.len() {
            tracing::warn!(
                discovered = devices.len(),
                slots = self.stations.len(),
                "more devices than station slots; extra devices are ignored"
            );
            devices.truncate(self.stations.len());
        }
        for device in &devices {
            self.names.insert(device.id.clone(), device.name.clone());
        }

        let targets: HashMap<&DeviceId, usize> = devices
            .iter()
            .enumerate()
            .map(|(slot, device)| (&device.id, slot))
            .collect();

        let mut detached: HashMap<DeviceId, StationState> = HashMap::new();
        for station in &mut self.stations {
            let Some(bound) = station.device().map(|device| device.id.clone()) else {
                continue;
            };
            match targets.get(&bound) {
                Some(&slot) if slot == station.slot() => {}
                Some(_) => {
                    detached.insert(bound, station.take_state());
                }
                None => {
                    if let Some((device, tracker)) = station.release() {
                        tracing::info!(
                            slot = station.slot(),
                            device_id = %device.id,
                            "device no longer discovered; station released"
                        );
                        self.assignments.remove(&device.id);
                        self.archives.insert(device.id, tracker);
                    }
                }
            }
        }

        for (slot, station) in self.stations.iter_mut().enumerate() {
            let Some(device) = devices.get(slot).cloned() else {
                if let Some((device, tracker)) = station.reset(true) {
                    self.assignments.remove(&device.id);
                    self.archives.insert(device.id, tracker);
                }
                continue;
            };

            match self.assignments.get(&device.id).copied() {
                Some(previous) if previous == slot => {
                    station.update(StationUpdate {
                        device: Some(device.clone()),
                        ..Default::default()
                    });
                }
                previous => {
                    if let Some(state) = detached.remove(&device.id) {
                        tracing::info!(
                            device_id = %device.id,
                            from = ?previous,
                            to = slot,
                            queued = state.sessions.len(),
                            "device moved; bookings follow it"
                        );
                        station.apply_state(state, device.clone());
                    } else {
                        let tracker = self.archives.remove(&device.id).unwrap_or_default();
                        if !tracker.is_empty() {
                            tracing::info!(
                                device_id = %device.id,
                                slot,
                                archived = tracker.len(),
                                "restored archive for device"
                            );
                        }
                        if let Some((stale, archive)) = station.reset(false) {
                            self.archives.insert(stale.id, archive);
                        }
                        station.bind_new(device.clone(), tracker);
                    }
                }
            }
            self.assignments.insert(device.id, slot);
        }

        for (device_id, state) in detached {
            tracing::warn!(%device_id, "detached state had no target slot");
            self.archives.insert(device_id, state.tracker);
        }

        self.refresh_all();
    }

    /// Runs one refresh tick on every station.
    pub fn refresh_all(&mut self) {
        for station in &mut self.stations {
            station.refresh();
        }
    }

    /// Presentation snapshots for all stations, in slot order.
    pub fn views(&self) -> Vec<StationView> {
        self.stations.iter().map(Station::view).collect()
    }

    /// Devices discovered during this run, bound or not, sorted by name.
    ///
    /// Archives restored for devices that have not been discovered yet are
    /// left out, since their names are unknown here.
    pub fn known_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .names
            .iter()
            .map(|(id, name)| Device::new(id.clone(), name.clone()))
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    /// Archive per device identity, covering bound and unbound devices.
    pub fn archive_records(&self) -> HashMap<DeviceId, Vec<SessionRecord>> {
        let mut records: HashMap<DeviceId, Vec<SessionRecord>> = self
            .archives
            .iter()
            .map(|(id, tracker)| (id.clone(), tracker.records()))
            .collect();
        for station in &self.stations {
            if let Some(device) = station.device() {
                records.insert(device.id.clone(), station.tracker().records());
            }
        }
        records
    }

    /// Deactivates every station so devices are turned off and running
    /// sessions are archived up to now.
    pub fn shutdown(&mut self) {
        tracing::info!(at = %self.ctx.now(), "shutting down stations");
        for station in &mut self.stations {
            station.set_activated(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{BookingRequest, Confirm};
    use crate::testing::{RecordingPower, at, context};
    use crate::{ManualClock, PowerState};
    use chrono::Duration;
    use std::sync::Arc;

    fn device(id: &str, name: &str) -> Device {
        Device::new(id, name)
    }

    fn bank(slots: usize, now: NaiveDateTime) -> (StationBank, Arc<ManualClock>, Arc<RecordingPower>) {
        let (ctx, clock, power) = context(now);
        (StationBank::new(slots, ctx, HashMap::new()), clock, power)
    }

    fn activate_and_book(bank: &mut StationBank, slot: usize, name: &str, start: NaiveDateTime) {
        let station = bank.station_mut(slot).unwrap();
        station.set_activated(true);
        let request = BookingRequest::new(name, Some(start), Duration::minutes(60));
        assert!(station.add_session(request, &mut Confirm(false)).unwrap().is_added());
    }

    fn bound_ids(bank: &StationBank) -> Vec<Option<String>> {
        bank.stations()
            .iter()
            .map(|s| s.device().map(|d| d.id.to_string()))
            .collect()
    }

    #[test]
    fn devices_are_assigned_by_sorted_name() {
        let (mut bank, _clock, _power) = bank(3, at(9, 0));
        bank.reconcile(vec![device("b", "Bay 2"), device("a", "Bay 1")]);

        assert_eq!(
            bound_ids(&bank),
            vec![Some("a".to_string()), Some("b".to_string()), None]
        );
        assert!(!bank.station(0).unwrap().is_hidden());
        assert!(bank.station(2).unwrap().is_hidden());
        assert!(!bank.station(0).unwrap().is_activated());
        assert_eq!(bank.slot_of(&DeviceId::from("b")), Some(1));
    }

    #[test]
    fn name_collisions_fall_back_to_device_id() {
        let (mut bank, _clock, _power) = bank(2, at(9, 0));
        bank.reconcile(vec![device("z", "Plug"), device("m", "Plug")]);
        assert_eq!(
            bound_ids(&bank),
            vec![Some("m".to_string()), Some("z".to_string())]
        );
    }

    #[test]
    fn identical_discovery_leaves_stations_untouched() {
        let (mut bank, _clock, _power) = bank(2, at(9, 0));
        let devices = vec![device("a", "Bay 1"), device("b", "Bay 2")];
        bank.reconcile(devices.clone());
        activate_and_book(&mut bank, 0, "Alice", at(10, 0));
        let before: Vec<_> = bank.stations().iter().map(|s| s.sessions().to_vec()).collect();

        bank.reconcile(devices);

        let after: Vec<_> = bank.stations().iter().map(|s| s.sessions().to_vec()).collect();
        assert_eq!(before, after);
        assert!(bank.station(0).unwrap().is_activated());
        assert!(!bank.station(1).unwrap().is_activated());
    }

    #[test]
    fn rename_in_place_refreshes_device_name() {
        let (mut bank, _clock, _power) = bank(1, at(9, 0));
        bank.reconcile(vec![device("a", "Bay 1")]);
        activate_and_book(&mut bank, 0, "Alice", at(10, 0));

        bank.reconcile(vec![device("a", "Front Bay")]);

        let station = bank.station(0).unwrap();
        assert_eq!(station.device().unwrap().name, "Front Bay");
        assert_eq!(station.sessions().len(), 1);
    }

    #[test]
    fn bookings_follow_a_device_that_changes_slot() {
        let (mut bank, _clock, _power) = bank(2, at(9, 0));
        bank.reconcile(vec![device("a", "Bay A")]);
        activate_and_book(&mut bank, 0, "Alice", at(10, 0));
        let queue = bank.station(0).unwrap().sessions().to_vec();

        // "Bay 0" sorts before "Bay A", pushing device a to slot 1.
        bank.reconcile(vec![device("a", "Bay A"), device("b", "Bay 0")]);

        let slot0 = bank.station(0).unwrap();
        assert_eq!(slot0.device().unwrap().id, DeviceId::from("b"));
        assert!(slot0.sessions().is_empty());
        assert!(!slot0.is_activated());

        let slot1 = bank.station(1).unwrap();
        assert_eq!(slot1.device().unwrap().id, DeviceId::from("a"));
        assert_eq!(slot1.sessions(), queue.as_slice());
        assert!(slot1.is_activated());
        assert_eq!(slot1.customer_label(), "Alice starts at 10:00");
        assert_eq!(bank.slot_of(&DeviceId::from("a")), Some(1));
    }

    #[test]
    fn swapped_devices_exchange_state() {
        let (mut bank, _clock, _power) = bank(2, at(9, 0));
        bank.reconcile(vec![device("a", "A"), device("b", "B")]);
        activate_and_book(&mut bank, 0, "Alice", at(10, 0));
        activate_and_book(&mut bank, 1, "Bob", at(12, 0));

        bank.reconcile(vec![device("a", "Z"), device("b", "B")]);

        let slot0 = bank.station(0).unwrap();
        assert_eq!(slot0.device().unwrap().id, DeviceId::from("b"));
        assert_eq!(slot0.sessions()[0].customer_name(), "Bob");
        let slot1 = bank.station(1).unwrap();
        assert_eq!(slot1.device().unwrap().id, DeviceId::from("a"));
        assert_eq!(slot1.sessions()[0].customer_name(), "Alice");
    }

    #[test]
    fn archive_travels_with_device() {
        let (mut bank, clock, _power) = bank(2, at(10, 0));
        bank.reconcile(vec![device("a", "B-side")]);
        activate_and_book(&mut bank, 0, "Alice", at(10, 0));
        clock.set(at(11, 0));
        bank.refresh_all();
        assert_eq!(bank.station(0).unwrap().tracker().len(), 1);

        bank.reconcile(vec![device("a", "B-side"), device("n", "A-side")]);

        assert!(bank.station(0).unwrap().tracker().is_empty());
        assert_eq!(bank.station(1).unwrap().tracker().len(), 1);
    }

    #[test]
    fn vanished_device_slot_is_reset_and_hidden() {
        let (mut bank, _clock, power) = bank(2, at(10, 30));
        bank.reconcile(vec![device("a", "A"), device("b", "B")]);
        activate_and_book(&mut bank, 1, "Bob", at(10, 0));
        power.take();

        bank.reconcile(vec![device("a", "A")]);

        let slot1 = bank.station(1).unwrap();
        assert!(slot1.is_hidden());
        assert!(slot1.device().is_none());
        assert!(slot1.sessions().is_empty());
        assert!(power.take().contains(&("b".to_string(), PowerState::Off)));
        assert_eq!(bank.slot_of(&DeviceId::from("b")), None);
    }

    #[test]
    fn returning_device_gets_its_archive_back_but_starts_deactivated() {
        let (mut bank, _clock, _power) = bank(2, at(10, 30));
        bank.reconcile(vec![device("a", "A"), device("b", "B")]);
        activate_and_book(&mut bank, 1, "Bob", at(10, 0));

        bank.reconcile(vec![device("a", "A")]);
        bank.reconcile(vec![device("a", "A"), device("b", "B")]);

        let slot1 = bank.station(1).unwrap();
        assert!(!slot1.is_activated());
        assert!(slot1.sessions().is_empty());
        let archived = slot1.tracker().sessions();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].customer_name(), "Bob");
        assert_eq!(archived[0].end(), at(10, 30));
    }

    #[test]
    fn stored_archive_is_restored_for_new_device() {
        let (ctx, _clock, _power) = context(at(9, 0));
        let stored = Session::new("Earlier", at(8, 0), Duration::minutes(30)).unwrap();
        let mut archives = HashMap::new();
        archives.insert(DeviceId::from("a"), vec![stored.clone()]);
        let mut bank = StationBank::new(2, ctx, archives);

        bank.reconcile(vec![device("x", "0"), device("a", "1")]);

        assert!(bank.station(0).unwrap().tracker().is_empty());
        assert_eq!(
            bank.station(1).unwrap().tracker().sessions(),
            std::slice::from_ref(&stored)
        );
    }

    #[test]
    fn extra_devices_beyond_slot_count_are_ignored() {
        let (mut bank, _clock, _power) = bank(1, at(9, 0));
        bank.reconcile(vec![device("a", "A"), device("b", "B")]);
        assert_eq!(bound_ids(&bank), vec![Some("a".to_string())]);
    }

    #[test]
    fn duplicate_device_ids_are_bound_once() {
        let (mut bank, _clock, _power) = bank(2, at(9, 0));
        bank.reconcile(vec![device("a", "A"), device("a", "A")]);
        assert_eq!(bound_ids(&bank), vec![Some("a".to_string()), None]);
    }

    #[test]
    fn archive_records_cover_bound_and_unbound_devices() {
        let (mut bank, clock, _power) = bank(2, at(10, 0));
        bank.reconcile(vec![device("a", "A"), device("b", "B")]);
        activate_and_book(&mut bank, 0, "Alice", at(10, 0));
        activate_and_book(&mut bank, 1, "Bob", at(10, 0));
        clock.set(at(11, 0));
        bank.refresh_all();

        bank.reconcile(vec![device("a", "A")]);

        let records = bank.archive_records();
        assert_eq!(records[&DeviceId::from("a")][0].customer_name, "Alice");
        assert_eq!(records[&DeviceId::from("b")][0].customer_name, "Bob");
        let known: Vec<String> = bank.known_devices().into_iter().map(|d| d.name).collect();
        assert_eq!(known, vec!["A", "B"]);
    }

    #[test]
    fn shutdown_archives_running_sessions_and_turns_everything_off() {
        let (mut bank, _clock, power) = bank(2, at(10, 45));
        bank.reconcile(vec![device("a", "A"), device("b", "B")]);
        activate_and_book(&mut bank, 0, "Alice", at(10, 0));
        power.take();

        bank.shutdown();

        assert!(power.take().iter().all(|(_, state)| *state == PowerState::Off));
        let records = bank.archive_records();
        assert_eq!(records[&DeviceId::from("a")][0].duration_minutes, 45);
        assert!(records[&DeviceId::from("b")].is_empty());
    }

    #[test]
    fn undiscovered_archive_owner_is_not_a_known_device() {
        let (ctx, _clock, _power) = context(at(9, 0));
        let stored = Session::new("Earlier", at(8, 0), Duration::minutes(30)).unwrap();
        let mut archives = HashMap::new();
        archives.insert(DeviceId::from("offline"), vec![stored]);
        let mut bank = StationBank::new(2, ctx, archives);

        bank.reconcile(vec![device("a", "A")]);

        let known: Vec<String> = bank
            .known_devices()
            .into_iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(known, vec!["a"]);
        assert_eq!(bank.archive_records()[&DeviceId::from("offline")].len(), 1);
    }

    #[test]
    fn shrinking_discovery_keeps_every_archive() {
        let (mut bank, clock, _power) = bank(2, at(10, 0));
        bank.reconcile(vec![device("a", "A"), device("b", "B")]);
        activate_and_book(&mut bank, 0, "Alice", at(10, 0));
        activate_and_book(&mut bank, 1, "Bob", at(10, 0));
        clock.set(at(11, 0));
        bank.refresh_all();

        // b moves to slot 0 and slot 1 is left without a device.
        bank.reconcile(vec![device("b", "B")]);

        let slot0 = bank.station(0).unwrap();
        assert_eq!(slot0.device().unwrap().id, DeviceId::from("b"));
        assert_eq!(slot0.tracker().sessions()[0].customer_name(), "Bob");
        assert!(bank.station(1).unwrap().is_hidden());
        let records = bank.archive_records();
        assert_eq!(records[&DeviceId::from("a")][0].customer_name, "Alice");
        assert_eq!(records[&DeviceId::from("b")][0].customer_name, "Bob");
    }
}
