//! Stats command for archive statistics per device.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use bay_core::{DeviceId, Session, SessionStats, StatsView};
use bay_db::Database;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct DeviceStats {
    device_id: String,
    device_name: String,
    #[serde(flatten)]
    stats: StatsView,
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    device: Option<&str>,
    json: bool,
) -> Result<()> {
    let mut archives = db.load_archive_sessions()?;
    let names: HashMap<DeviceId, String> = db
        .list_devices()?
        .into_iter()
        .map(|device| (device.id, device.name))
        .collect();

    if let Some(device) = device {
        let id = DeviceId::new(device);
        archives.retain(|archived, _| *archived == id);
        archives.entry(id).or_default();
    }

    let mut rows: Vec<(DeviceId, Vec<Session>)> = archives.into_iter().collect();
    rows.sort_by(|(a, _), (b, _)| {
        let name_a = names.get(a).map_or("", String::as_str);
        let name_b = names.get(b).map_or("", String::as_str);
        name_a.cmp(name_b).then_with(|| a.cmp(b))
    });

    let stats: Vec<DeviceStats> = rows
        .iter()
        .map(|(id, sessions)| DeviceStats {
            device_id: id.to_string(),
            device_name: names.get(id).cloned().unwrap_or_default(),
            stats: SessionStats::calculate(sessions).view(),
        })
        .collect();

    if json {
        serde_json::to_writer_pretty(&mut *writer, &stats)?;
        writeln!(writer)?;
        return Ok(());
    }

    if stats.is_empty() {
        writeln!(writer, "No sessions archived yet.")?;
        return Ok(());
    }

    writeln!(
        writer,
        "{:<16} {:<16} {:>8} {:>8} {:>9} {:>8}",
        "DEVICE ID", "NAME", "TOTAL", "AVERAGE", "SESSIONS", "PER DAY"
    )?;
    for row in &stats {
        writeln!(
            writer,
            "{:<16} {:<16} {:>8} {:>8} {:>9} {:>8}",
            row.device_id,
            row.device_name,
            row.stats.total_time,
            row.stats.average_time,
            row.stats.total_sessions,
            row.stats.average_sessions_per_day
        )?;
    }

    if device.is_none() && stats.len() > 1 {
        let all: Vec<Session> = rows.into_iter().flat_map(|(_, sessions)| sessions).collect();
        let total = SessionStats::calculate(&all).view();
        writeln!(
            writer,
            "{:<16} {:<16} {:>8} {:>8} {:>9} {:>8}",
            "all",
            "",
            total.total_time,
            total.average_time,
            total.total_sessions,
            total.average_sessions_per_day
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bay_core::{Device, SessionRecord};
    use chrono::NaiveDate;
    use insta::assert_snapshot;

    use super::*;

    fn record(id: u64, day: u32, hour: u32, minutes: i64) -> SessionRecord {
        SessionRecord {
            session_id: id,
            customer_name: format!("Customer {id}"),
            start_date: NaiveDate::from_ymd_opt(2025, 3, day)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
            duration_minutes: minutes,
        }
    }

    fn seeded() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_devices(&[Device::new("plug-a", "Bay 1"), Device::new("plug-b", "Bay 2")])
            .unwrap();
        let mut archives = HashMap::new();
        archives.insert(
            DeviceId::from("plug-a"),
            vec![record(1, 10, 9, 60), record(2, 10, 11, 90), record(3, 11, 9, 30)],
        );
        archives.insert(DeviceId::from("plug-b"), vec![record(4, 10, 9, 120)]);
        db.save_archives(&archives).unwrap();
        db
    }

    #[test]
    fn stats_table_lists_devices_and_total() {
        let db = seeded();
        let mut output = Vec::new();
        run(&mut output, &db, None, false).unwrap();

        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        DEVICE ID        NAME                TOTAL  AVERAGE  SESSIONS  PER DAY
        plug-a           Bay 1               03:00    01:00         3      1.5
        plug-b           Bay 2               02:00    02:00         1        1
        all                                  05:00    01:15         4        2
        ");
    }

    #[test]
    fn stats_json_for_one_device() {
        let db = seeded();
        let mut output = Vec::new();
        run(&mut output, &db, Some("plug-b"), true).unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(parsed[0]["device_id"], "plug-b");
        assert_eq!(parsed[0]["device_name"], "Bay 2");
        assert_eq!(parsed[0]["total_time"], "02:00");
        assert_eq!(parsed[0]["total_sessions"], 1);
        assert_eq!(parsed.as_array().unwrap().len(), 1);
    }

    #[test]
    fn unknown_device_reports_zero_sessions() {
        let db = seeded();
        let mut output = Vec::new();
        run(&mut output, &db, Some("plug-z"), true).unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(parsed[0]["total_sessions"], 0);
    }

    #[test]
    fn empty_archive_says_so() {
        let db = Database::open_in_memory().unwrap();
        let mut output = Vec::new();
        run(&mut output, &db, None, false).unwrap();
        assert_snapshot!(String::from_utf8(output).unwrap(), @"No sessions archived yet.");
    }
}
