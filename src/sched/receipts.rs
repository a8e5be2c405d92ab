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

//! The fiscal receipt queue drainer.
//!
//! Retries queued receipts FIFO with capped attempts, alerts admins when
//! the queue backs up or items are dropped, and celebrates when a
//! previously backed-up queue drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use time::OffsetDateTime;

use crate::config::Settings;
use crate::error::Error;
use crate::notify::{AdminNotice, NotificationBus};
use crate::sched::{spawn_periodic, Shutdown, TaskHandle};
use crate::store::receipts::FiscalReceipt;
use crate::store::{receipts, Store};

const DRAIN_BATCH: i64 = 20;
const BACKLOG_ALERT_THRESHOLD: i64 = 10;

/// Submits one receipt to the tax service.
///
/// The broker only needs the outcome: transient failures keep the item
/// queued, success removes it.
pub trait SubmitReceipt: Clone + Send + Sync + 'static {
    fn submit(
        &self,
        receipt: &FiscalReceipt,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send;
}

#[derive(Clone)]
pub struct ReceiptDrainer<S: SubmitReceipt> {
    settings: Arc<Settings>,
    store: Store,
    bus: NotificationBus,
    submitter: S,
    had_backlog: Arc<AtomicBool>,
}

impl<S: SubmitReceipt> ReceiptDrainer<S> {
    pub fn new(
        settings: Arc<Settings>,
        store: Store,
        bus: NotificationBus,
        submitter: S,
    ) -> ReceiptDrainer<S> {
        ReceiptDrainer {
            settings,
            store,
            bus,
            submitter,
            had_backlog: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn spawn(self, shutdown: Shutdown) -> TaskHandle {
        let interval = self.settings.receipt_drain_interval;
        spawn_periodic("receipt_drainer", interval, shutdown, move || {
            let drainer = self.clone();
            async move { drainer.tick().await }
        })
    }

    pub async fn tick(&self) -> Result<(), Error> {
        let pool = self.store.pool();
        let now = OffsetDateTime::now_utc();

        // Age out what will never submit, before retrying the rest.
        let retention =
            time::Duration::seconds(self.settings.receipt_retention.as_secs() as i64);
        let dropped = receipts::drop_exhausted(
            pool,
            self.settings.receipt_max_attempts as i32,
            now - retention,
        )
        .await?;
        for receipt in &dropped {
            tracing::error!(
                payment_id = receipt.payment_id,
                attempts = receipt.attempts,
                "fiscal receipt dropped after exhausting retries"
            );
            self.bus.notify_admins(AdminNotice::ReceiptDropped {
                payment_id: receipt.payment_id,
                attempts: receipt.attempts,
            });
        }

        let batch = receipts::next_batch(pool, DRAIN_BATCH).await?;
        if batch.is_empty() {
            if self.had_backlog.swap(false, Ordering::Relaxed) {
                self.bus.notify_admins(AdminNotice::ReceiptQueueDrained);
                tracing::info!("fiscal receipt queue drained");
            }
            return Ok(());
        }

        for receipt in &batch {
            match self.submitter.submit(receipt).await {
                Ok(()) => {
                    receipts::remove(pool, receipt.id).await?;
                    tracing::info!(payment_id = receipt.payment_id, "fiscal receipt submitted");
                }
                Err(e) => {
                    let attempts = receipts::bump_attempts(pool, receipt.id).await?;
                    tracing::warn!(
                        payment_id = receipt.payment_id,
                        attempts,
                        error = %e,
                        "fiscal receipt submission failed; kept in queue"
                    );
                    if !e.is_transient() {
                        // Permanent rejections still retry up to the cap:
                        // the tax service has been seen returning 4xx
                        // during outages.
                        self.bus.notify_admins(AdminNotice::PanelError {
                            context: format!("receipt submission for payment {}", receipt.payment_id),
                            detail: e.to_string(),
                        });
                    }
                }
            }
            tokio::time::sleep(self.settings.receipt_submit_delay).await;
        }

        let remaining = receipts::len(pool).await?;
        if remaining >= BACKLOG_ALERT_THRESHOLD && !self.had_backlog.swap(true, Ordering::Relaxed) {
            self.bus
                .notify_admins(AdminNotice::ReceiptQueueBacklog { queued: remaining });
            tracing::warn!(queued = remaining, "fiscal receipt queue backing up");
        }
        Ok(())
    }
}
