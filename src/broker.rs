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

//! The broker aggregate.
//!
//! Owns every long-lived resource (settings, store pool, panel client,
//! notification bus, maintenance flag, scheduler handles) and hands out
//! the service facades. Nothing in the crate reaches for globals; the
//! embedder builds one `Broker` at boot and injects it where needed.

use std::sync::Arc;

use sqlx::postgres::PgPool;
use tokio::sync::watch;

use crate::checkout::CheckoutOrchestrator;
use crate::config::Settings;
use crate::error::Error;
use crate::notify::{NotificationBus, NotificationReceivers};
use crate::panel::{PanelClient, PanelConfig};
use crate::payments::nalogo::NalogoClient;
use crate::payments::PaymentIngress;
use crate::sched::autopay::AutopayRunner;
use crate::sched::expiry::ExpiryNotifier;
use crate::sched::log_rotation::{self, LogRotator};
use crate::sched::maintenance::{MaintenanceFlag, MaintenanceWatcher};
use crate::sched::receipts::{ReceiptDrainer, SubmitReceipt};
use crate::sched::reports::ReportDispatcher;
use crate::sched::trial_cleanup::TrialCleanup;
use crate::sched::{shutdown_channel, Shutdown, TaskHandle};
use crate::service::SubscriptionService;
use crate::store::Store;

/// The root of the running broker.
pub struct Broker {
    settings: Arc<Settings>,
    store: Store,
    panel: PanelClient,
    bus: NotificationBus,
    maintenance: MaintenanceFlag,
    shutdown_tx: watch::Sender<bool>,
    shutdown: Shutdown,
    handles: Vec<TaskHandle>,
}

impl Broker {
    /// Assembles the broker from its injected resources.
    ///
    /// Returns the notification receivers the chat front-end must drain.
    pub fn new(
        settings: Settings,
        pool: PgPool,
        panel_config: PanelConfig,
    ) -> Result<(Broker, NotificationReceivers), Error> {
        settings.validate()?;
        log_rotation::prepare_log_dirs(&settings.log_dir)?;

        let settings = Arc::new(settings);
        let (bus, receivers) = NotificationBus::new();
        let (shutdown_tx, shutdown) = shutdown_channel();
        let broker = Broker {
            settings,
            store: Store::new(pool),
            panel: PanelClient::new(panel_config),
            bus,
            maintenance: MaintenanceFlag::new(),
            shutdown_tx,
            shutdown,
            handles: Vec::new(),
        };
        Ok((broker, receivers))
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn panel(&self) -> &PanelClient {
        &self.panel
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// The maintenance flag the front-end consults before handling
    /// non-admin commands.
    pub fn maintenance(&self) -> &MaintenanceFlag {
        &self.maintenance
    }

    /// The subscription lifecycle facade.
    pub fn service(&self) -> SubscriptionService {
        SubscriptionService::new(
            Arc::clone(&self.settings),
            self.store.clone(),
            self.panel.clone(),
            self.bus.clone(),
        )
    }

    /// The checkout wizard facade.
    pub fn checkout(&self) -> CheckoutOrchestrator {
        CheckoutOrchestrator::new(self.service())
    }

    /// The webhook commit path shared by every provider endpoint.
    pub fn payment_ingress(&self) -> PaymentIngress {
        PaymentIngress::new(
            Arc::clone(&self.settings),
            self.store.clone(),
            self.bus.clone(),
        )
    }

    /// Starts the scheduler fleet with the configured tax service client
    /// (or no receipt drainer when receipts are disabled).
    pub fn start_schedulers(&mut self) {
        match self.settings.nalogo.clone() {
            Some(nalogo) => {
                let submitter = NalogoClient::new(nalogo);
                self.start_schedulers_with(submitter);
            }
            None => self.start_schedulers_without_receipts(),
        }
    }

    /// Starts the fleet with a custom receipt submitter.
    pub fn start_schedulers_with<S: SubmitReceipt>(&mut self, submitter: S) {
        self.start_schedulers_without_receipts();
        let drainer = ReceiptDrainer::new(
            Arc::clone(&self.settings),
            self.store.clone(),
            self.bus.clone(),
            submitter,
        );
        self.handles.push(drainer.spawn(self.shutdown.clone()));
    }

    fn start_schedulers_without_receipts(&mut self) {
        let settings = Arc::clone(&self.settings);

        let expiry = ExpiryNotifier::new(
            Arc::clone(&settings),
            self.store.clone(),
            self.bus.clone(),
        );
        self.handles.push(expiry.spawn(self.shutdown.clone()));

        let autopay = AutopayRunner::new(
            Arc::clone(&settings),
            self.store.clone(),
            self.service(),
            self.bus.clone(),
        );
        self.handles.push(autopay.spawn(self.shutdown.clone()));

        let trials = TrialCleanup::new(
            Arc::clone(&settings),
            self.store.clone(),
            self.panel.clone(),
            self.bus.clone(),
        );
        self.handles.push(trials.spawn(self.shutdown.clone()));

        let reports = ReportDispatcher::new(
            Arc::clone(&settings),
            self.store.clone(),
            self.bus.clone(),
        );
        self.handles.push(reports.spawn(self.shutdown.clone()));

        let rotation = LogRotator::new(Arc::clone(&settings), self.bus.clone());
        self.handles.push(rotation.spawn(self.shutdown.clone()));

        let watcher = MaintenanceWatcher::new(
            Arc::clone(&settings),
            self.panel.clone(),
            self.store.clone(),
            self.maintenance.clone(),
            self.bus.clone(),
        );
        self.handles.push(watcher.spawn(self.shutdown.clone()));

        tracing::info!(tasks = self.handles.len(), "scheduler fleet started");
    }

    /// Requests shutdown and waits for every task to finish its current
    /// iteration.
    pub async fn shutdown(mut self) {
        tracing::info!("broker shutting down");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            handle.join().await;
        }
        tracing::info!("broker stopped");
    }
}
