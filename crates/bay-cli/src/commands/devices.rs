//! Devices command for listing known plugs.

use std::io::Write;

use anyhow::Result;
use bay_db::Database;

/// Runs the devices command.
pub fn run<W: Write>(writer: &mut W, db: &Database) -> Result<()> {
    let devices = db.list_devices()?;

    if devices.is_empty() {
        writeln!(
            writer,
            "No devices known yet. Run 'bay run' to discover devices."
        )?;
        return Ok(());
    }

    writeln!(writer, "{:<24} NAME", "DEVICE ID")?;
    for device in &devices {
        writeln!(writer, "{:<24} {}", device.id.as_str(), device.name)?;
    }

    Ok(())
}
