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

//! The autopay runner.
//!
//! Selects subscriptions inside their user-configured renewal window and
//! attempts a monthly-configuration extension for each. Insufficient
//! funds notify the user at most once per 24 hours per subscription and
//! change nothing; hard errors alert admins.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::config::Settings;
use crate::error::Error;
use crate::notify::{AdminNotice, NotificationBus, UserNotice};
use crate::sched::{spawn_periodic, Shutdown, TaskHandle};
use crate::service::SubscriptionService;
use crate::store::events::EventType;
use crate::store::notices::bucket;
use crate::store::{events, notices, subscriptions, users, Store};

const INSUFFICIENT_NOTICE_COOLDOWN_SECS: f64 = 24.0 * 60.0 * 60.0;

/// Outcome counters for one autopay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AutopayStats {
    pub processed: u64,
    pub successful: u64,
    pub insufficient_balance: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct AutopayRunner {
    settings: Arc<Settings>,
    store: Store,
    service: SubscriptionService,
    bus: NotificationBus,
}

impl AutopayRunner {
    pub fn new(
        settings: Arc<Settings>,
        store: Store,
        service: SubscriptionService,
        bus: NotificationBus,
    ) -> AutopayRunner {
        AutopayRunner {
            settings,
            store,
            service,
            bus,
        }
    }

    pub fn spawn(self, shutdown: Shutdown) -> TaskHandle {
        let interval = self.settings.autopay_check_interval;
        spawn_periodic("autopay_runner", interval, shutdown, move || {
            let runner = self.clone();
            async move {
                runner.run_once().await?;
                Ok(())
            }
        })
    }

    /// One full pass over every due subscription.
    pub async fn run_once(&self) -> Result<AutopayStats, Error> {
        let now = OffsetDateTime::now_utc();
        let due = subscriptions::due_for_autopay(self.store.pool(), now).await?;
        if due.is_empty() {
            return Ok(AutopayStats::default());
        }
        tracing::info!(due = due.len(), "autopay pass started");

        let mut stats = AutopayStats::default();
        for sub in due {
            stats.processed += 1;
            match self.service.autopay_extend(sub.user_id).await {
                Ok(outcome) => {
                    stats.successful += 1;
                    tracing::info!(
                        user_id = sub.user_id,
                        total_kopeks = outcome.quote.total_kopeks,
                        "autopay renewal charged"
                    );
                }
                Err(Error::InsufficientFunds { missing_kopeks }) => {
                    stats.insufficient_balance += 1;
                    self.handle_insufficient(&sub, missing_kopeks, now).await?;
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::error!(user_id = sub.user_id, error = %e, "autopay renewal failed");
                    self.bus.notify_admins(AdminNotice::PanelError {
                        context: format!("autopay renewal for user {}", sub.user_id),
                        detail: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            processed = stats.processed,
            successful = stats.successful,
            insufficient = stats.insufficient_balance,
            failed = stats.failed,
            "autopay pass complete"
        );
        self.bus.notify_admins(AdminNotice::AutopayRun {
            processed: stats.processed,
            successful: stats.successful,
            insufficient_balance: stats.insufficient_balance,
            failed: stats.failed,
        });
        Ok(stats)
    }

    async fn handle_insufficient(
        &self,
        sub: &subscriptions::Subscription,
        missing_kopeks: i64,
        now: OffsetDateTime,
    ) -> Result<(), Error> {
        let pool = self.store.pool();
        let should_notify = notices::record_with_cooldown(
            pool,
            sub.id,
            bucket::AUTOPAY_INSUFFICIENT,
            sub.end_date,
            now,
            INSUFFICIENT_NOTICE_COOLDOWN_SECS,
        )
        .await?;
        if !should_notify {
            tracing::debug!(user_id = sub.user_id, "insufficient-balance notice still cooling down");
            return Ok(());
        }

        let user = users::get(pool, sub.user_id).await?;
        self.bus.notify_user(
            user.telegram_id,
            &user.language,
            UserNotice::AutopayInsufficient {
                missing_kopeks,
                end_date: sub.end_date,
            },
        );
        if let Err(e) = events::append(
            pool,
            EventType::AutopayFailed,
            sub.user_id,
            Some(sub.id),
            None,
            Some(missing_kopeks),
            serde_json::json!({ "reason": "insufficient_funds" }),
        )
        .await
        {
            tracing::error!(error = %e, "failed to append autopay_failed event");
        }
        Ok(())
    }
}
