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

//! The maintenance flag watcher.
//!
//! Polls the panel's health endpoint and flips the broker into
//! maintenance mode while the panel is down. The front-end consults the
//! flag and rejects non-admin operations with a standard notice; the
//! core never checks it on its own paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::TryStreamExt;

use crate::config::Settings;
use crate::error::Error;
use crate::notify::{AdminNotice, NotificationBus};
use crate::panel::squads::SquadListParams;
use crate::panel::PanelClient;
use crate::sched::{spawn_periodic, Shutdown, TaskHandle};
use crate::store::{servers, Store};

/// The global maintenance-mode flag. Cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceFlag {
    enabled: Arc<AtomicBool>,
}

impl MaintenanceFlag {
    pub fn new() -> MaintenanceFlag {
        MaintenanceFlag::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Sets the flag; returns whether the value changed.
    pub fn set(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::Relaxed) != enabled
    }
}

#[derive(Clone)]
pub struct MaintenanceWatcher {
    settings: Arc<Settings>,
    panel: PanelClient,
    store: Store,
    flag: MaintenanceFlag,
    bus: NotificationBus,
}

impl MaintenanceWatcher {
    pub fn new(
        settings: Arc<Settings>,
        panel: PanelClient,
        store: Store,
        flag: MaintenanceFlag,
        bus: NotificationBus,
    ) -> MaintenanceWatcher {
        MaintenanceWatcher {
            settings,
            panel,
            store,
            flag,
            bus,
        }
    }

    pub fn spawn(self, shutdown: Shutdown) -> TaskHandle {
        let interval = self.settings.maintenance_poll_interval;
        spawn_periodic("maintenance_watcher", interval, shutdown, move || {
            let watcher = self.clone();
            async move { watcher.tick().await }
        })
    }

    pub async fn tick(&self) -> Result<(), Error> {
        let healthy = match self.panel.health().await {
            Ok(health) => health.healthy,
            Err(e) => {
                tracing::warn!(error = %e, "panel health probe failed");
                false
            }
        };
        if self.flag.set(!healthy) {
            if healthy {
                tracing::info!("panel healthy again; maintenance mode off");
            } else {
                tracing::warn!("panel unhealthy; maintenance mode on");
            }
            self.bus
                .notify_admins(AdminNotice::MaintenanceChanged { enabled: !healthy });
        }
        if healthy {
            self.refresh_squad_catalog().await?;
        }
        Ok(())
    }

    /// Mirrors the panel's squad names and fullness into the server
    /// catalog. Prices and availability stay broker-owned.
    async fn refresh_squad_catalog(&self) -> Result<(), Error> {
        let squads: Vec<_> = self
            .panel
            .list_squads(&SquadListParams::default())
            .try_collect()
            .await?;
        if squads.is_empty() {
            return Ok(());
        }
        let rows: Vec<(uuid::Uuid, String, bool)> = squads
            .iter()
            .map(|s| (s.uuid, s.name.clone(), s.is_full()))
            .collect();
        let mut tx = self.store.begin().await?;
        servers::sync_from_panel(&mut tx, &rows).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_transitions_only() {
        let flag = MaintenanceFlag::new();
        assert!(!flag.is_enabled());
        assert!(flag.set(true));
        assert!(!flag.set(true));
        assert!(flag.is_enabled());
        assert!(flag.set(false));
        assert!(!flag.is_enabled());
    }
}
