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

//! The report dispatcher.
//!
//! Sends a daily stats digest to the admin channel at a configured local
//! time; weekly and monthly digests are produced on demand through
//! [`ReportDispatcher::generate`].

use std::sync::Arc;

use time::ext::NumericalDuration;
use time::OffsetDateTime;

use crate::config::Settings;
use crate::error::Error;
use crate::notify::{AdminNotice, NotificationBus};
use crate::sched::{spawn_daily, Shutdown, TaskHandle};
use crate::store::{subscriptions, transactions, Store};

/// The period a report covers, ending now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl ReportPeriod {
    fn title(&self) -> &'static str {
        match self {
            ReportPeriod::Daily => "Daily report",
            ReportPeriod::Weekly => "Weekly report",
            ReportPeriod::Monthly => "Monthly report",
        }
    }

    fn span(&self) -> time::Duration {
        match self {
            ReportPeriod::Daily => 1.days(),
            ReportPeriod::Weekly => 7.days(),
            ReportPeriod::Monthly => 30.days(),
        }
    }
}

/// The numbers behind one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportStats {
    pub new_trials: i64,
    pub new_paid: i64,
    pub active_subscriptions: i64,
    pub deposits_count: i64,
    pub deposits_sum_kopeks: i64,
}

impl ReportStats {
    fn render(&self) -> String {
        format!(
            "New trials: {}\nNew paid subscriptions: {}\nActive subscriptions: {}\n\
             Deposits: {} totalling {:.2} RUB",
            self.new_trials,
            self.new_paid,
            self.active_subscriptions,
            self.deposits_count,
            self.deposits_sum_kopeks as f64 / 100.0,
        )
    }
}

#[derive(Clone)]
pub struct ReportDispatcher {
    settings: Arc<Settings>,
    store: Store,
    bus: NotificationBus,
}

impl ReportDispatcher {
    pub fn new(settings: Arc<Settings>, store: Store, bus: NotificationBus) -> ReportDispatcher {
        ReportDispatcher {
            settings,
            store,
            bus,
        }
    }

    pub fn spawn(self, shutdown: Shutdown) -> TaskHandle {
        let at = self.settings.report_time;
        let offset = self.settings.local_offset;
        spawn_daily("report_dispatcher", at, offset, shutdown, move || {
            let dispatcher = self.clone();
            async move { dispatcher.send(ReportPeriod::Daily).await }
        })
    }

    /// Computes the stats for `period`, ending now.
    pub async fn generate(&self, period: ReportPeriod) -> Result<ReportStats, Error> {
        let pool = self.store.pool();
        let until = OffsetDateTime::now_utc();
        let since = until - period.span();

        let new_trials = subscriptions::count_new_since(pool, since, until, true).await?;
        let new_paid = subscriptions::count_new_since(pool, since, until, false).await?;
        let active_subscriptions = subscriptions::count_active(pool, until).await?;
        let (deposits_count, deposits_sum_kopeks) =
            transactions::deposits_summary(pool, since, until).await?;

        Ok(ReportStats {
            new_trials,
            new_paid,
            active_subscriptions,
            deposits_count,
            deposits_sum_kopeks,
        })
    }

    /// Generates and dispatches one report to the admin channel.
    pub async fn send(&self, period: ReportPeriod) -> Result<(), Error> {
        let stats = self.generate(period).await?;
        tracing::info!(?period, ?stats, "report generated");
        self.bus.notify_admins(AdminNotice::Report {
            title: period.title().to_owned(),
            body: stats.render(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_renders_kopeks_as_rubles() {
        let stats = ReportStats {
            new_trials: 4,
            new_paid: 2,
            active_subscriptions: 120,
            deposits_count: 3,
            deposits_sum_kopeks: 124_050,
        };
        let body = stats.render();
        assert!(body.contains("New trials: 4"));
        assert!(body.contains("1240.50 RUB"));
    }

    #[test]
    fn period_spans_cover_their_windows() {
        assert_eq!(ReportPeriod::Daily.span(), 1.days());
        assert_eq!(ReportPeriod::Weekly.span(), 7.days());
        assert_eq!(ReportPeriod::Monthly.span(), 30.days());
    }
}
