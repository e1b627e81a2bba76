//! Storage layer for tracked sessions.
//!
//! Archives are keyed by device identity, never by station slot, so history
//! follows a plug wherever it is discovered next.
//!
//! # Thread Safety
//!
//! [`Database`] wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! Open it on the task that loads and saves archives.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Session start dates are local wall-clock times stored as TEXT in the form
//! `2025-03-14T10:30:00` (no offset). Lexicographic order matches
//! chronological order.

use std::collections::HashMap;
use std::path::Path;

use bay_core::{Device, DeviceId, Session, SessionRecord};
use chrono::{Local, NaiveDateTime, SecondsFormat};
use rusqlite::{Connection, params};
use serde::Serialize;
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored start date.
    #[error("invalid start date for session {session_id} of {device_id}: {timestamp}")]
    TimestampParse {
        device_id: String,
        session_id: i64,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored row does not describe a valid session.
    #[error("invalid session {session_id} of {device_id}: {message}")]
    InvalidSession {
        device_id: String,
        session_id: i64,
        message: String,
    },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// Archive of one device, shaped for spreadsheet export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceHistory {
    pub device_name: String,
    pub device_id: String,
    /// Sorted by start date.
    pub sessions: Vec<SessionRecord>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Archived sessions, keyed by device identity
            -- start_date: local wall clock, e.g. '2025-03-14T10:30:00'
            CREATE TABLE IF NOT EXISTS tracked_sessions (
                device_id TEXT NOT NULL,
                session_id INTEGER NOT NULL,
                customer_name TEXT NOT NULL,
                start_date TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                PRIMARY KEY (device_id, session_id)
            );

            CREATE INDEX IF NOT EXISTS idx_tracked_sessions_start
                ON tracked_sessions(device_id, start_date);
            ",
        )?;
        Ok(())
    }

    /// Replaces the stored archive of every device present in `archives`.
    ///
    /// Devices absent from the map keep whatever is stored for them.
    pub fn save_archives(
        &mut self,
        archives: &HashMap<DeviceId, Vec<SessionRecord>>,
    ) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        let mut written = 0;
        {
            let mut clear = tx.prepare("DELETE FROM tracked_sessions WHERE device_id = ?")?;
            let mut insert = tx.prepare(
                "
                INSERT OR REPLACE INTO tracked_sessions
                (device_id, session_id, customer_name, start_date, duration_minutes)
                VALUES (?, ?, ?, ?, ?)
                ",
            )?;
            for (device_id, records) in archives {
                clear.execute([device_id.as_str()])?;
                for record in records {
                    let session_id = i64::try_from(record.session_id).map_err(|_| {
                        DbError::InvalidSession {
                            device_id: device_id.to_string(),
                            session_id: i64::MAX,
                            message: format!("session id {} out of range", record.session_id),
                        }
                    })?;
                    written += insert.execute(params![
                        device_id.as_str(),
                        session_id,
                        record.customer_name,
                        format_timestamp(record.start_date),
                        record.duration_minutes,
                    ])?;
                }
            }
        }
        tx.commit()?;
        tracing::debug!(devices = archives.len(), written, "saved archives");
        Ok(written)
    }

    /// Loads every stored archive record, grouped by device and sorted by
    /// start date.
    pub fn load_archives(&self) -> Result<HashMap<DeviceId, Vec<SessionRecord>>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT device_id, session_id, customer_name, start_date, duration_minutes
            FROM tracked_sessions
            ORDER BY device_id ASC, start_date ASC, session_id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut archives: HashMap<DeviceId, Vec<SessionRecord>> = HashMap::new();
        for row in rows {
            let (device_id, session_id, customer_name, start_date, duration_minutes) = row?;
            let start_date = parse_timestamp(&start_date).map_err(|source| {
                DbError::TimestampParse {
                    device_id: device_id.clone(),
                    session_id,
                    timestamp: start_date.clone(),
                    source,
                }
            })?;
            let session_id =
                u64::try_from(session_id).map_err(|_| DbError::InvalidSession {
                    device_id: device_id.clone(),
                    session_id,
                    message: "negative session id".to_string(),
                })?;
            archives
                .entry(DeviceId::new(device_id))
                .or_default()
                .push(SessionRecord {
                    session_id,
                    customer_name,
                    start_date,
                    duration_minutes,
                });
        }
        Ok(archives)
    }

    /// Loads archives as validated sessions.
    pub fn load_archive_sessions(&self) -> Result<HashMap<DeviceId, Vec<Session>>, DbError> {
        self.load_archives()?
            .into_iter()
            .map(|(device_id, records)| {
                let sessions = records
                    .iter()
                    .map(|record| {
                        Session::from_record(record).map_err(|err| DbError::InvalidSession {
                            device_id: device_id.to_string(),
                            session_id: i64::try_from(record.session_id).unwrap_or(i64::MAX),
                            message: err.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((device_id, sessions))
            })
            .collect()
    }

    /// Records the current display name of each device.
    pub fn upsert_devices(&mut self, devices: &[Device]) -> Result<usize, DbError> {
        if devices.is_empty() {
            return Ok(0);
        }
        let now = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        let tx = self.conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO devices (id, name, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at
                ",
            )?;
            for device in devices {
                written += stmt.execute(params![device.id.as_str(), device.name, now])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Lists known devices ordered by name then ID.
    pub fn list_devices(&self) -> Result<Vec<Device>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM devices ORDER BY name ASC, id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Device::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    /// Archive of every device that has either a stored name or stored
    /// sessions, ordered by device name then ID.
    pub fn device_histories(&self) -> Result<Vec<DeviceHistory>, DbError> {
        let mut archives = self.load_archives()?;
        let mut histories: Vec<DeviceHistory> = self
            .list_devices()?
            .into_iter()
            .map(|device| DeviceHistory {
                sessions: archives.remove(&device.id).unwrap_or_default(),
                device_id: device.id.to_string(),
                device_name: device.name,
            })
            .collect();
        let mut orphans: Vec<DeviceHistory> = archives
            .into_iter()
            .map(|(device_id, sessions)| DeviceHistory {
                device_name: String::new(),
                device_id: device_id.to_string(),
                sessions,
            })
            .collect();
        orphans.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        histories.extend(orphans);
        Ok(histories)
    }
}

fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn record(id: u64, name: &str, start: NaiveDateTime, minutes: i64) -> SessionRecord {
        SessionRecord {
            session_id: id,
            customer_name: name.to_string(),
            start_date: start,
            duration_minutes: minutes,
        }
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    #[test]
    fn open_in_memory_database() {
        assert!(Database::open_in_memory().is_ok());
    }

    #[test]
    fn schema_matches_data_model() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(
            table_columns(&db.conn, "tracked_sessions"),
            vec![
                "device_id",
                "session_id",
                "customer_name",
                "start_date",
                "duration_minutes",
            ]
        );
        assert_eq!(
            table_columns(&db.conn, "devices"),
            vec!["id", "name", "updated_at"]
        );
    }

    #[test]
    fn archives_round_trip_sorted_by_start() {
        let mut db = Database::open_in_memory().unwrap();
        let mut archives = HashMap::new();
        archives.insert(
            DeviceId::from("plug-a"),
            vec![
                record(2, "Late", at(14, 12, 0), 30),
                record(1, "Early", at(14, 9, 0), 60),
            ],
        );
        archives.insert(DeviceId::from("plug-b"), vec![record(3, "Other", at(13, 8, 15), 90)]);

        assert_eq!(db.save_archives(&archives).unwrap(), 3);
        let loaded = db.load_archives().unwrap();

        let a = &loaded[&DeviceId::from("plug-a")];
        assert_eq!(a[0], record(1, "Early", at(14, 9, 0), 60));
        assert_eq!(a[1], record(2, "Late", at(14, 12, 0), 30));
        assert_eq!(loaded[&DeviceId::from("plug-b")].len(), 1);
    }

    #[test]
    fn saving_replaces_previous_archive_of_device() {
        let mut db = Database::open_in_memory().unwrap();
        let mut archives = HashMap::new();
        archives.insert(DeviceId::from("plug-a"), vec![record(1, "Old", at(14, 9, 0), 60)]);
        db.save_archives(&archives).unwrap();

        archives.insert(DeviceId::from("plug-a"), vec![record(5, "New", at(14, 9, 30), 60)]);
        db.save_archives(&archives).unwrap();

        let loaded = db.load_archives().unwrap();
        assert_eq!(
            loaded[&DeviceId::from("plug-a")],
            vec![record(5, "New", at(14, 9, 30), 60)]
        );
    }

    #[test]
    fn saving_leaves_other_devices_alone() {
        let mut db = Database::open_in_memory().unwrap();
        let mut first = HashMap::new();
        first.insert(DeviceId::from("plug-a"), vec![record(1, "A", at(14, 9, 0), 60)]);
        db.save_archives(&first).unwrap();

        let mut second = HashMap::new();
        second.insert(DeviceId::from("plug-b"), vec![record(2, "B", at(14, 9, 0), 60)]);
        db.save_archives(&second).unwrap();

        assert_eq!(db.load_archives().unwrap().len(), 2);
    }

    #[test]
    fn invalid_duration_is_reported_on_session_load() {
        let mut db = Database::open_in_memory().unwrap();
        let mut archives = HashMap::new();
        archives.insert(DeviceId::from("plug-a"), vec![record(1, "Broken", at(14, 9, 0), 0)]);
        db.save_archives(&archives).unwrap();

        let err = db.load_archive_sessions().unwrap_err();
        assert!(matches!(err, DbError::InvalidSession { .. }));
    }

    #[test]
    fn malformed_start_date_is_reported() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "INSERT INTO tracked_sessions VALUES ('plug-a', 1, 'X', 'yesterday', 30)",
                [],
            )
            .unwrap();
        let err = db.load_archives().unwrap_err();
        assert!(matches!(err, DbError::TimestampParse { .. }));
    }

    #[test]
    fn device_names_are_upserted() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_devices(&[Device::new("plug-b", "Bay 2"), Device::new("plug-a", "Bay 1")])
            .unwrap();
        db.upsert_devices(&[Device::new("plug-b", "Back Bay")]).unwrap();

        let names: Vec<String> = db.list_devices().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Back Bay", "Bay 1"]);
    }

    #[test]
    fn device_histories_include_orphaned_archives() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_devices(&[Device::new("plug-a", "Bay 1")]).unwrap();
        let mut archives = HashMap::new();
        archives.insert(DeviceId::from("plug-a"), vec![record(1, "A", at(14, 9, 0), 60)]);
        archives.insert(DeviceId::from("plug-z"), vec![record(2, "Z", at(14, 9, 0), 30)]);
        db.save_archives(&archives).unwrap();

        let histories = db.device_histories().unwrap();

        assert_eq!(histories.len(), 2);
        assert_eq!(histories[0].device_name, "Bay 1");
        assert_eq!(histories[0].sessions.len(), 1);
        assert_eq!(histories[1].device_id, "plug-z");
        assert_eq!(histories[1].device_name, "");
    }

    #[test]
    fn database_persists_across_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bay.db");
        {
            let mut db = Database::open(&path).unwrap();
            let mut archives = HashMap::new();
            archives.insert(DeviceId::from("plug-a"), vec![record(7, "A", at(14, 9, 0), 45)]);
            db.save_archives(&archives).unwrap();
        }
        let db = Database::open(&path).unwrap();
        let sessions = db.load_archive_sessions().unwrap();
        assert_eq!(sessions[&DeviceId::from("plug-a")][0].customer_name(), "A");
    }
}
