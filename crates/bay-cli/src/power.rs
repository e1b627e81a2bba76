//! Power intent queue and its worker pool.
//!
//! Stations re-assert their desired power state on every refresh. The queue
//! forwards an intent when it differs from the last state sent for that
//! device, or when that state was sent longer than `reassert_after` ago. A
//! failed command clears the remembered state, so the next refresh retries it.
//!
//! Each device is routed to one fixed worker, so commands for a device run
//! one at a time and in submission order.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bay_core::{DeviceId, PowerIntent, PowerSink, PowerState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::DeviceBackend;

type Applied = Arc<Mutex<HashMap<DeviceId, (PowerState, Instant)>>>;

/// Sender half handed to the stations.
#[derive(Debug, Clone)]
pub struct PowerQueue {
    lanes: Vec<mpsc::UnboundedSender<PowerIntent>>,
    applied: Applied,
    reassert_after: Duration,
}

/// Receiver halves consumed by [`spawn_workers`], one per worker.
#[derive(Debug)]
pub struct PowerJobs {
    lanes: Vec<mpsc::UnboundedReceiver<PowerIntent>>,
    applied: Applied,
}

/// Creates a queue feeding `workers` lanes (at least one).
pub fn channel(workers: usize, reassert_after: Duration) -> (PowerQueue, PowerJobs) {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..workers.max(1))
        .map(|_| mpsc::unbounded_channel())
        .unzip();
    let applied = Applied::default();
    (
        PowerQueue {
            lanes: senders,
            applied: applied.clone(),
            reassert_after,
        },
        PowerJobs {
            lanes: receivers,
            applied,
        },
    )
}

fn lock(applied: &Applied) -> MutexGuard<'_, HashMap<DeviceId, (PowerState, Instant)>> {
    applied.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PowerQueue {
    fn lane_for(&self, device: &DeviceId) -> &mpsc::UnboundedSender<PowerIntent> {
        let mut hasher = DefaultHasher::new();
        device.hash(&mut hasher);
        #[expect(
            clippy::cast_possible_truncation,
            reason = "only the remainder modulo the lane count matters"
        )]
        let index = hasher.finish() as usize % self.lanes.len();
        &self.lanes[index]
    }
}

impl PowerSink for PowerQueue {
    fn submit(&self, intent: PowerIntent) {
        {
            let mut applied = lock(&self.applied);
            let now = Instant::now();
            if let Some((state, sent)) = applied.get(&intent.device.id) {
                if *state == intent.state && now.duration_since(*sent) < self.reassert_after {
                    return;
                }
            }
            applied.insert(intent.device.id.clone(), (intent.state, now));
        }
        tracing::debug!(device = %intent.device.id, state = %intent.state, "queueing power change");
        if self.lane_for(&intent.device.id).send(intent).is_err() {
            tracing::debug!("power workers stopped, dropping intent");
        }
    }
}

/// Spawns one task per lane that executes intents against `backend` until
/// every [`PowerQueue`] is dropped.
pub fn spawn_workers<B: DeviceBackend + 'static>(
    backend: Arc<B>,
    jobs: PowerJobs,
) -> Vec<JoinHandle<()>> {
    let PowerJobs { lanes, applied } = jobs;
    lanes
        .into_iter()
        .enumerate()
        .map(|(worker, mut rx)| {
            let backend = backend.clone();
            let applied = applied.clone();
            tokio::spawn(async move {
                while let Some(PowerIntent { device, state }) = rx.recv().await {
                    if let Err(err) = backend.set_power(&device.id, state).await {
                        tracing::warn!(
                            worker,
                            device = %device.id,
                            %state,
                            error = %err,
                            "power command failed"
                        );
                        let mut applied = lock(&applied);
                        if applied.get(&device.id).is_some_and(|(sent, _)| *sent == state) {
                            applied.remove(&device.id);
                        }
                    }
                }
            })
        })
        .collect()
}
