//! Run command: the booking engine's control loop.
//!
//! One task owns the [`StationBank`]. Everything that touches it (ticks,
//! discovery results, console lines) is multiplexed through a single
//! `select!`, so a reconciliation pass never interleaves with a refresh.
//! Power commands leave through the worker pool in [`crate::power`].

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bay_core::{Context, Device, DeviceError, StationBank, SystemClock};
use bay_db::Database;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::Config;
use crate::backend::DeviceBackend;
use crate::console::{self, Action};
use crate::power;

/// Upper bound on waiting for queued power commands at shutdown.
const POWER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

type Discovery = Result<Vec<Device>, DeviceError>;

pub async fn run<B, R, W>(
    config: &Config,
    backend: Arc<B>,
    db: &mut Database,
    input: R,
    out: &mut W,
) -> Result<()>
where
    B: DeviceBackend + 'static,
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let archives = db
        .load_archive_sessions()
        .context("failed to load session archive")?;
    tracing::info!(devices = archives.len(), "loaded session archive");

    let (queue, jobs) = power::channel(config.power_workers, config.power_reassert());
    let workers = power::spawn_workers(backend.clone(), jobs);
    let ctx = Context::new(Arc::new(SystemClock), Arc::new(queue));
    let mut bank = StationBank::new(config.station_count, ctx, archives);

    writeln!(out, "Searching for devices...")?;
    let found = backend.discover().await;
    apply_discovery(&mut bank, db, found, out)?;
    writeln!(
        out,
        "{} station(s) ready. Type `help` for commands.",
        config.station_count
    )?;
    out.flush()?;

    let (found_tx, mut found_rx) = mpsc::channel::<Discovery>(1);
    let mut discovering = false;

    let mut tick = tokio::time::interval(config.tick_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let period = config.discovery_interval();
    let mut discovery = tokio::time::interval_at(Instant::now() + period, period);
    discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut lines = input.lines();

    loop {
        tokio::select! {
            _ = tick.tick() => bank.refresh_all(),
            _ = discovery.tick() => spawn_discovery(&backend, &found_tx, &mut discovering),
            Some(found) = found_rx.recv() => {
                discovering = false;
                apply_discovery(&mut bank, db, found, out)?;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read console input")? else {
                    tracing::debug!("console input closed");
                    break;
                };
                match console::handle_line(&mut bank, &line, out)? {
                    Action::Continue => {}
                    Action::Discover => spawn_discovery(&backend, &found_tx, &mut discovering),
                    Action::Quit => break,
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!("interrupted");
                break;
            }
        }
        out.flush()?;
    }

    shutdown(bank, db, workers, out).await
}

fn spawn_discovery<B: DeviceBackend + 'static>(
    backend: &Arc<B>,
    tx: &mpsc::Sender<Discovery>,
    in_flight: &mut bool,
) {
    if *in_flight {
        tracing::debug!("discovery already running");
        return;
    }
    *in_flight = true;
    let backend = backend.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let found = discover(backend).await;
        let _ = tx.send(found).await;
    });
}

/// Runs discovery on its own task so a panicking backend still produces a
/// result, which clears the in-flight flag.
async fn discover<B: DeviceBackend + 'static>(backend: Arc<B>) -> Discovery {
    match tokio::spawn(async move { backend.discover().await }).await {
        Ok(found) => found,
        Err(err) => {
            tracing::error!(error = %err, "discovery task failed");
            Err(DeviceError::connection(format!("discovery task failed: {err}")))
        }
    }
}

/// Reconciles a discovery result, or reports the failure without touching
/// any station.
fn apply_discovery<W: Write>(
    bank: &mut StationBank,
    db: &mut Database,
    found: Discovery,
    out: &mut W,
) -> Result<()> {
    match found {
        Ok(devices) => {
            tracing::info!(count = devices.len(), "devices discovered");
            bank.reconcile(devices);
            if let Err(err) = db.upsert_devices(&bank.known_devices()) {
                tracing::warn!(error = %err, "failed to record device names");
            }
        }
        Err(err) => {
            tracing::warn!(kind = ?err.kind, error = %err.message, "device discovery failed");
            writeln!(out, "{}: {}", err.kind.title(), err.message)?;
        }
    }
    Ok(())
}

async fn shutdown<W: Write>(
    mut bank: StationBank,
    db: &mut Database,
    workers: Vec<tokio::task::JoinHandle<()>>,
    out: &mut W,
) -> Result<()> {
    tracing::info!("shutting down");
    bank.shutdown();
    let records = bank.archive_records();
    let devices = bank.known_devices();
    // Dropping the bank closes the power queue once the last intent is sent.
    drop(bank);

    let saved = db
        .save_archives(&records)
        .context("failed to save session archive")?;
    db.upsert_devices(&devices)
        .context("failed to record device names")?;
    writeln!(out, "Saved {saved} archived session(s).")?;
    out.flush()?;

    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
    };
    if tokio::time::timeout(POWER_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("power commands still pending at exit");
    }
    Ok(())
}
