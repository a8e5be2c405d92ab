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

//! The trial cleanup task.
//!
//! The single owner of the "trial expired" notice: marks trials that
//! lapsed past the grace window, notifies each user exactly once, and
//! optionally removes the remote identity from the panel. Also sweeps
//! stale checkout drafts and old notice-ledger rows.

use std::sync::Arc;

use time::ext::NumericalDuration;
use time::OffsetDateTime;

use crate::config::Settings;
use crate::error::Error;
use crate::notify::{AdminNotice, NotificationBus, UserNotice};
use crate::panel::PanelClient;
use crate::sched::{spawn_periodic, Shutdown, TaskHandle};
use crate::store::events::EventType;
use crate::store::notices::bucket;
use crate::store::subscriptions::SubscriptionStatus;
use crate::store::{drafts, events, notices, subscriptions, users, Store};

#[derive(Clone)]
pub struct TrialCleanup {
    settings: Arc<Settings>,
    store: Store,
    panel: PanelClient,
    bus: NotificationBus,
}

impl TrialCleanup {
    pub fn new(
        settings: Arc<Settings>,
        store: Store,
        panel: PanelClient,
        bus: NotificationBus,
    ) -> TrialCleanup {
        TrialCleanup {
            settings,
            store,
            panel,
            bus,
        }
    }

    pub fn spawn(self, shutdown: Shutdown) -> TaskHandle {
        let interval = self.settings.trial_cleanup_interval;
        spawn_periodic("trial_cleanup", interval, shutdown, move || {
            let cleanup = self.clone();
            async move { cleanup.tick().await }
        })
    }

    pub async fn tick(&self) -> Result<(), Error> {
        let now = OffsetDateTime::now_utc();
        let pool = self.store.pool();
        let grace = i64::from(self.settings.trial.cleanup_after_hours).hours();

        let lapsed = subscriptions::lapsed_trials(pool, now, grace).await?;
        let mut expired = 0u64;
        let mut deleted_from_panel = 0u64;

        for sub in lapsed {
            subscriptions::set_status(pool, sub.id, SubscriptionStatus::Expired).await?;
            expired += 1;

            if !notices::record_once(pool, sub.id, bucket::TRIAL_EXPIRED, sub.end_date).await? {
                continue;
            }
            let user = users::get(pool, sub.user_id).await?;
            self.bus
                .notify_user(user.telegram_id, &user.language, UserNotice::TrialExpired);
            if let Err(e) = events::append(
                pool,
                EventType::TrialExpired,
                sub.user_id,
                Some(sub.id),
                None,
                None,
                serde_json::json!({}),
            )
            .await
            {
                tracing::error!(error = %e, "failed to append trial_expired event");
            }

            if self.settings.trial.delete_from_panel {
                if let Some(panel_uuid) = user.panel_uuid {
                    match self.panel.delete_remote_user(panel_uuid).await {
                        Ok(()) => deleted_from_panel += 1,
                        Err(e) => {
                            tracing::warn!(
                                user_id = sub.user_id,
                                error = %e,
                                "failed to delete expired trial from panel"
                            );
                        }
                    }
                }
            }
        }

        let draft_cutoff = now - time::Duration::seconds(self.settings.draft_ttl.as_secs() as i64);
        let dropped_drafts = drafts::delete_stale(pool, draft_cutoff).await?;
        if dropped_drafts > 0 {
            tracing::debug!(dropped_drafts, "stale checkout drafts dropped");
        }
        notices::prune_older_than(pool, now - 90.days()).await?;

        if expired > 0 {
            tracing::info!(expired, deleted_from_panel, "trial cleanup pass complete");
            self.bus.notify_admins(AdminNotice::TrialsCleaned {
                expired,
                deleted_from_panel,
            });
        }
        Ok(())
    }
}
