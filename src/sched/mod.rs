// Copyright the vpn-broker contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The background scheduler fleet.
//!
//! Cooperative tasks started at boot, each with its own cadence. A
//! shutdown signal lets every task finish its current iteration before
//! exiting; nothing is killed mid-transaction. Tasks share the store pool
//! and the panel client and always re-read state inside their own
//! transactions.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use time::{OffsetDateTime, Time, UtcOffset};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Error;

pub mod autopay;
pub mod expiry;
pub mod log_rotation;
pub mod maintenance;
pub mod receipts;
pub mod reports;
pub mod trial_cleanup;

/// The shutdown signal handed to every scheduler task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is requested.
    pub async fn requested(&mut self) {
        // An error means the sender is gone, which also means shut down.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Creates the shutdown signal pair.
pub fn shutdown_channel() -> (watch::Sender<bool>, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (tx, Shutdown { rx })
}

/// A running scheduler task.
#[derive(Debug)]
pub struct TaskHandle {
    /// The task's name, for logs and status listings.
    pub name: &'static str,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    /// Waits for the task to observe shutdown and exit.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(task = self.name, error = %e, "scheduler task panicked");
        }
    }
}

/// Spawns a task that runs `tick` every `interval` until shutdown.
///
/// The first tick is delayed by a random fraction of the interval so the
/// fleet does not thundering-herd the pool at boot. Tick errors are
/// logged, never fatal to the loop.
pub(crate) fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: Shutdown,
    mut tick: F,
) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let initial = interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        tokio::select! {
            _ = tokio::time::sleep(initial) => {}
            _ = shutdown.requested() => return,
        }
        tracing::info!(task = name, interval_secs = interval.as_secs(), "scheduler started");
        let mut ticks: u64 = 0;
        loop {
            match tick().await {
                Ok(()) => {
                    ticks += 1;
                    tracing::debug!(task = name, ticks, "scheduler tick complete");
                }
                Err(e) => {
                    tracing::error!(task = name, error = %e, "scheduler tick failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.requested() => break,
            }
        }
        tracing::info!(task = name, ticks, "scheduler stopped");
    });
    TaskHandle { name, handle }
}

/// Spawns a task that runs `tick` once a day at `at` local time.
pub(crate) fn spawn_daily<F, Fut>(
    name: &'static str,
    at: Time,
    offset: UtcOffset,
    mut shutdown: Shutdown,
    mut tick: F,
) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        tracing::info!(task = name, at = %at, "daily scheduler started");
        loop {
            let now = OffsetDateTime::now_utc();
            let wait = until_next_occurrence(now, at, offset);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.requested() => break,
            }
            if let Err(e) = tick().await {
                tracing::error!(task = name, error = %e, "daily task failed");
            }
        }
        tracing::info!(task = name, "daily scheduler stopped");
    });
    TaskHandle { name, handle }
}

/// How long until the next local-time occurrence of `at`.
pub(crate) fn until_next_occurrence(now: OffsetDateTime, at: Time, offset: UtcOffset) -> Duration {
    let local_now = now.to_offset(offset);
    let mut next = local_now.replace_time(at);
    if next <= local_now {
        next += time::Duration::days(1);
    }
    let wait = next - local_now;
    // Clamp against clock skew; a zero sleep busy-loops.
    Duration::from_secs_f64(wait.as_seconds_f64().max(1.0))
}

#[cfg(test)]
mod tests {
    use time::macros::{datetime, offset, time};

    use super::*;

    #[test]
    fn next_occurrence_is_later_today_or_tomorrow() {
        let offset = offset!(+3);
        // 09:00 UTC = 12:00 local; a 14:00 run is two hours away.
        let now = datetime!(2026-03-01 09:00 UTC);
        let wait = until_next_occurrence(now, time!(14:00), offset);
        assert_eq!(wait.as_secs(), 2 * 60 * 60);

        // A 10:00 local run already passed; next is tomorrow.
        let wait = until_next_occurrence(now, time!(10:00), offset);
        assert_eq!(wait.as_secs(), 22 * 60 * 60);
    }

    #[test]
    fn exact_boundary_rolls_to_the_next_day() {
        let wait = until_next_occurrence(
            datetime!(2026-03-01 12:00 UTC),
            time!(12:00),
            UtcOffset::UTC,
        );
        assert_eq!(wait.as_secs(), 24 * 60 * 60);
    }

    #[tokio::test]
    async fn shutdown_signal_reaches_clones() {
        let (tx, shutdown) = shutdown_channel();
        let mut clone = shutdown.clone();
        assert!(!clone.is_requested());
        tx.send(true).unwrap();
        clone.requested().await;
        assert!(clone.is_requested());
    }
}
