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

//! The expiry notifier.
//!
//! Wakes periodically, flips lapsed subscriptions to `expired`, and sends
//! one reminder per configured warning bucket per end date. Trial
//! subscriptions are not handled here; the trial-cleanup task owns their
//! single post-expiry notice.

use std::sync::Arc;

use time::ext::NumericalDuration;
use time::OffsetDateTime;

use crate::config::Settings;
use crate::error::Error;
use crate::notify::{NotificationBus, UserNotice};
use crate::sched::{spawn_periodic, Shutdown, TaskHandle};
use crate::store::notices::bucket;
use crate::store::{notices, subscriptions, users, Store};

#[derive(Clone)]
pub struct ExpiryNotifier {
    settings: Arc<Settings>,
    store: Store,
    bus: NotificationBus,
}

impl ExpiryNotifier {
    pub fn new(settings: Arc<Settings>, store: Store, bus: NotificationBus) -> ExpiryNotifier {
        ExpiryNotifier {
            settings,
            store,
            bus,
        }
    }

    pub fn spawn(self, shutdown: Shutdown) -> TaskHandle {
        let interval = self.settings.expiry_check_interval;
        spawn_periodic("expiry_notifier", interval, shutdown, move || {
            let notifier = self.clone();
            async move { notifier.tick().await }
        })
    }

    pub async fn tick(&self) -> Result<(), Error> {
        let now = OffsetDateTime::now_utc();
        let pool = self.store.pool();

        let lapsed = subscriptions::mark_lapsed_expired(pool, now).await?;
        if lapsed > 0 {
            tracing::info!(lapsed, "subscriptions marked expired");
        }

        let max_days = self
            .settings
            .autopay_warning_days
            .iter()
            .copied()
            .max()
            .unwrap_or(0);
        let window = i64::from(max_days).days();
        let expiring = subscriptions::expiring_within(pool, now, window).await?;

        for sub in expiring {
            let Some(bucket_name) = self.bucket_for(&sub, now) else {
                continue;
            };
            if !notices::record_once(pool, sub.id, &bucket_name, sub.end_date).await? {
                continue;
            }
            let user = users::get(pool, sub.user_id).await?;
            let days_left = (sub.end_date - now).whole_days();
            self.bus.notify_user(
                user.telegram_id,
                &user.language,
                UserNotice::ExpiresSoon {
                    end_date: sub.end_date,
                    days_left,
                },
            );
            tracing::debug!(
                user_id = sub.user_id,
                bucket = %bucket_name,
                days_left,
                "expiry reminder sent"
            );
        }
        Ok(())
    }

    /// The tightest warning bucket this subscription currently falls in,
    /// or `None` while it is outside every bucket.
    fn bucket_for(
        &self,
        sub: &crate::store::subscriptions::Subscription,
        now: OffsetDateTime,
    ) -> Option<String> {
        let left = sub.end_date - now;
        if left <= i64::from(self.settings.expiry_warning_hours).hours() {
            return Some(bucket::EXPIRES_HOURS.to_owned());
        }
        self.settings
            .autopay_warning_days
            .iter()
            .copied()
            .filter(|days| left <= i64::from(*days).days())
            .min()
            .map(bucket::expires_in_days)
    }
}

#[cfg(test)]
mod tests {
    use time::ext::NumericalDuration;
    use uuid::Uuid;

    use crate::store::subscriptions::{Subscription, SubscriptionStatus};

    use super::*;

    fn notifier() -> ExpiryNotifier {
        let settings = Arc::new(Settings::with_trial_squad(Uuid::nil()));
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool construction does not connect");
        let (bus, _receivers) = NotificationBus::new();
        ExpiryNotifier::new(settings, Store::new(pool), bus)
    }

    fn sub(end_in: time::Duration) -> Subscription {
        let now = OffsetDateTime::now_utc();
        Subscription {
            id: 1,
            user_id: 1,
            status: SubscriptionStatus::Active,
            is_trial: false,
            start_date: now - 27.days(),
            end_date: now + end_in,
            traffic_limit_gb: 100,
            purchased_traffic_gb: 0,
            traffic_used_gb: 0.0,
            device_limit: 1,
            connected_squads: vec![],
            modem_enabled: false,
            autopay_enabled: false,
            autopay_days_before: 3,
            subscription_url: None,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn tightest_bucket_wins() {
        let n = notifier();
        let now = OffsetDateTime::now_utc();
        // 2.5 days out: inside the 3-day bucket, outside the 1-day one.
        assert_eq!(n.bucket_for(&sub(60.hours()), now), Some("expires_3d".into()));
        // 20 hours out: inside the 1-day bucket.
        assert_eq!(n.bucket_for(&sub(20.hours()), now), Some("expires_1d".into()));
        // 90 minutes out: the final few-hours bucket.
        assert_eq!(n.bucket_for(&sub(90.minutes()), now), Some("expires_hours".into()));
        // Five days out: outside every bucket.
        assert_eq!(n.bucket_for(&sub(5.days()), now), None);
    }
}
