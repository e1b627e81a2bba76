//! Export command: every device's archive as JSON.

use std::io::Write;

use anyhow::Result;
use bay_db::Database;

pub fn run<W: Write>(writer: &mut W, db: &Database) -> Result<()> {
    let histories = db.device_histories()?;
    serde_json::to_writer_pretty(&mut *writer, &histories)?;
    writeln!(writer)?;
    Ok(())
}
