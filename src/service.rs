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

//! The subscription service.
//!
//! Every lifecycle operation follows the same shape: quote with the
//! pricing engine, mutate inside one store transaction (re-reading the
//! user and subscription with row locks so concurrent mutations
//! serialize), commit, then sync the panel, append the audit event, and
//! fan out notifications. The panel call is deliberately outside the
//! critical section: committed DB state is authoritative and the panel
//! is reconciled on the next write if a sync fails.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::ext::NumericalDuration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Error, Resource};
use crate::notify::{AdminNotice, NotificationBus, UserNotice};
use crate::panel::users::{RemoteUser, RemoteUserStatus, RemoteUserWrite};
use crate::panel::PanelClient;
use crate::pricing::{self, PriceRequest, Quote};
use crate::store::events::EventType;
use crate::store::subscriptions::{Subscription, SubscriptionStatus, SubscriptionWrite};
use crate::store::users::User;
use crate::store::{
    drafts, events, promo_groups, servers, subscriptions, transactions, users, Store,
};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// The configuration a purchase commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseConfig {
    pub period_days: u32,
    /// Traffic package in gigabytes; 0 is the unlimited package.
    pub traffic_gb: u32,
    pub device_limit: u32,
    /// Selected servers, in selection order.
    pub server_uuids: Vec<Uuid>,
}

/// What a committed purchase or extension produced.
#[derive(Debug, Clone)]
pub struct PurchaseOutcome {
    pub subscription: Subscription,
    pub quote: Quote,
    pub transaction_id: i64,
    /// Absent when the panel sync failed; the link will appear on the
    /// next successful sync.
    pub subscription_url: Option<String>,
}

/// What a trial activation produced. Trials are free, so there is no
/// quote and no ledger entry.
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub subscription: Subscription,
    pub subscription_url: Option<String>,
}

/// Orchestrates pricing, the store, the panel, and notifications for
/// every subscription lifecycle operation.
#[derive(Clone)]
pub struct SubscriptionService {
    settings: Arc<Settings>,
    store: Store,
    panel: PanelClient,
    bus: NotificationBus,
}

impl SubscriptionService {
    pub fn new(
        settings: Arc<Settings>,
        store: Store,
        panel: PanelClient,
        bus: NotificationBus,
    ) -> SubscriptionService {
        SubscriptionService {
            settings,
            store,
            panel,
            bus,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Activates the free trial for a user who has never had one.
    pub async fn create_trial(&self, user_id: i64) -> Result<TrialOutcome, Error> {
        let trial = &self.settings.trial;
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        if user.has_had_paid_subscription {
            return Err(Error::TrialAlreadyUsed);
        }
        if subscriptions::get_by_user_for_update(&mut *tx, user_id)
            .await?
            .is_some()
        {
            return Err(Error::TrialAlreadyUsed);
        }
        if let Some(squad) = servers::get_by_squad_uuid(&mut *tx, trial.squad_uuid).await? {
            if squad.is_full {
                return Err(Error::ResourceUnavailable(Resource::TrialSquad));
            }
        }

        let write = SubscriptionWrite {
            is_trial: true,
            start_date: now,
            end_date: now + i64::from(trial.duration_days).days(),
            traffic_limit_gb: trial.traffic_limit_gb as i32,
            device_limit: trial.device_limit as i32,
            connected_squads: vec![trial.squad_uuid],
            autopay_days_before: self.settings.default_autopay_days_before as i32,
        };
        let subscription = subscriptions::upsert(&mut *tx, user_id, &write).await?;
        tx.commit().await?;

        tracing::info!(user_id, end_date = %subscription.end_date, "trial activated");

        let remote = self.sync_to_panel(&user, &subscription).await;
        let subscription_url = remote.and_then(|r| r.subscription_url);

        self.append_event(EventType::TrialActivated, &user, Some(subscription.id), None, None)
            .await;
        self.bus.notify_user(
            user.telegram_id,
            &user.language,
            UserNotice::TrialActivated {
                end_date: subscription.end_date,
                subscription_url: subscription_url.clone(),
            },
        );

        Ok(TrialOutcome {
            subscription,
            subscription_url,
        })
    }

    /// Quotes `config` for `user_id` without committing anything.
    ///
    /// The checkout orchestrator calls this on every wizard transition.
    pub async fn quote_purchase(&self, user_id: i64, config: &PurchaseConfig) -> Result<Quote, Error> {
        let pool = self.store.pool();
        let user = users::get(pool, user_id).await?;
        let group = promo_groups::for_user(pool, user.promo_group_id).await?;
        let selected = servers::resolve_squads(pool, &config.server_uuids).await?;
        let request = PriceRequest {
            period_days: config.period_days,
            traffic_gb: config.traffic_gb,
            device_limit: config.device_limit,
            servers: selected.iter().map(|s| s.price()).collect(),
            discounts: group.discounts(config.period_days),
        };
        pricing::quote_new(&request, &self.settings.prices)
    }

    /// Commits a purchase: debit, subscription mutation, ledger entry,
    /// then the panel sync and notifications.
    pub async fn purchase(
        &self,
        user_id: i64,
        config: &PurchaseConfig,
    ) -> Result<PurchaseOutcome, Error> {
        if !self.settings.available_periods.contains(&config.period_days) {
            return Err(Error::validation(
                "period_days",
                format!("{} is not an offered period", config.period_days),
            ));
        }
        if config.server_uuids.is_empty() {
            return Err(Error::validation("server_uuids", "select at least one server"));
        }
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let group = promo_groups::for_user(&mut *tx, user.promo_group_id).await?;
        // Availability re-checked inside the transaction: a server sold
        // out since the quote fails the purchase, not the commit.
        let selected = servers::resolve_squads(&mut *tx, &config.server_uuids).await?;

        let request = PriceRequest {
            period_days: config.period_days,
            traffic_gb: config.traffic_gb,
            device_limit: config.device_limit,
            servers: selected.iter().map(|s| s.price()).collect(),
            discounts: group.discounts(config.period_days),
        };
        let quote = pricing::quote_new(&request, &self.settings.prices)?;

        users::debit_balance(&mut *tx, user_id, quote.total_kopeks).await?;

        let existing = subscriptions::get_by_user_for_update(&mut *tx, user_id).await?;
        let was_trial_conversion = existing.as_ref().is_some_and(|s| s.is_trial);

        let write = SubscriptionWrite {
            is_trial: false,
            start_date: now,
            end_date: now + i64::from(config.period_days).days(),
            traffic_limit_gb: config.traffic_gb as i32,
            device_limit: config.device_limit as i32,
            connected_squads: config.server_uuids.clone(),
            autopay_days_before: existing
                .as_ref()
                .map(|s| s.autopay_days_before)
                .unwrap_or(self.settings.default_autopay_days_before as i32),
        };
        let subscription = subscriptions::upsert(&mut *tx, user_id, &write).await?;

        let links: Vec<(i64, i64)> = selected
            .iter()
            .map(|server| {
                let paid = quote.server_paid_price(server.squad_uuid).unwrap_or(0);
                (server.id, paid)
            })
            .collect();
        subscriptions::replace_server_links(&mut *tx, subscription.id, &links).await?;

        let tx_row = transactions::insert(
            &mut *tx,
            user_id,
            transactions::TransactionType::SubscriptionPayment,
            quote.total_kopeks,
            &format!(
                "Subscription purchase: {} days, {} GB, {} devices, {} servers",
                config.period_days,
                config.traffic_gb,
                config.device_limit,
                config.server_uuids.len()
            ),
            serde_json::json!({
                "period_days": config.period_days,
                "traffic_gb": config.traffic_gb,
                "device_limit": config.device_limit,
                "server_uuids": config.server_uuids,
                "trial_conversion": was_trial_conversion,
            }),
        )
        .await?;
        tx.commit().await?;

        users::mark_had_paid_subscription(self.store.pool(), user_id).await?;
        let _ = drafts::delete(self.store.pool(), user_id).await;

        tracing::info!(
            user_id,
            total_kopeks = quote.total_kopeks,
            period_days = config.period_days,
            was_trial_conversion,
            "subscription purchased"
        );

        let remote = self.sync_to_panel(&user, &subscription).await;
        let subscription_url = remote.and_then(|r| r.subscription_url);

        self.append_event(
            EventType::SubscriptionPurchased,
            &user,
            Some(subscription.id),
            Some(tx_row.id),
            Some(quote.total_kopeks),
        )
        .await;
        self.bus.notify_user(
            user.telegram_id,
            &user.language,
            UserNotice::PurchaseCompleted {
                total_kopeks: quote.total_kopeks,
                end_date: subscription.end_date,
                subscription_url: subscription_url.clone(),
            },
        );
        self.bus.notify_admins(AdminNotice::SubscriptionPurchased {
            user_id,
            telegram_id: user.telegram_id,
            total_kopeks: quote.total_kopeks,
            period_days: config.period_days,
            was_trial_conversion,
        });

        Ok(PurchaseOutcome {
            subscription,
            quote,
            transaction_id: tx_row.id,
            subscription_url,
        })
    }

    /// Extends the current configuration by `period_days`.
    pub async fn extend(&self, user_id: i64, period_days: u32) -> Result<PurchaseOutcome, Error> {
        self.extend_inner(user_id, period_days, false).await
    }

    /// The autopay runner's monthly-configuration renewal.
    pub async fn autopay_extend(&self, user_id: i64) -> Result<PurchaseOutcome, Error> {
        self.extend_inner(user_id, 30, true).await
    }

    async fn extend_inner(
        &self,
        user_id: i64,
        period_days: u32,
        via_autopay: bool,
    ) -> Result<PurchaseOutcome, Error> {
        if !via_autopay && !self.settings.renewal_periods.contains(&period_days) {
            return Err(Error::validation(
                "period_days",
                format!("{period_days} is not an offered renewal period"),
            ));
        }
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let subscription = subscriptions::get_by_user_for_update(&mut *tx, user_id)
            .await?
            .ok_or(Error::TrialIneligible)?;
        if subscription.is_trial {
            return Err(Error::TrialIneligible);
        }

        let group = promo_groups::for_user(&mut *tx, user.promo_group_id).await?;
        // Extensions price what is already connected, at current catalog
        // prices, whether or not the servers are still on sale.
        let connected =
            servers::resolve_squads_any(&mut *tx, &subscription.connected_squads).await?;
        let request = PriceRequest {
            period_days,
            traffic_gb: subscription.traffic_limit_gb as u32,
            device_limit: subscription.device_limit as u32,
            servers: connected.iter().map(|s| s.price()).collect(),
            discounts: group.discounts(period_days),
        };
        let quote = pricing::quote_new(&request, &self.settings.prices)?;

        users::debit_balance(&mut *tx, user_id, quote.total_kopeks).await?;

        let base = if subscription.end_date > now {
            subscription.end_date
        } else {
            now
        };
        let new_end = base + i64::from(period_days).days();
        subscriptions::set_end_date(&mut *tx, subscription.id, new_end).await?;

        let links: Vec<(i64, i64)> = connected
            .iter()
            .map(|server| {
                let paid = quote.server_paid_price(server.squad_uuid).unwrap_or(0);
                (server.id, paid)
            })
            .collect();
        subscriptions::replace_server_links(&mut *tx, subscription.id, &links).await?;

        let description = if via_autopay {
            format!("Automatic renewal: {period_days} days")
        } else {
            format!("Subscription extension: {period_days} days")
        };
        let tx_row = transactions::insert(
            &mut *tx,
            user_id,
            transactions::TransactionType::SubscriptionPayment,
            quote.total_kopeks,
            &description,
            serde_json::json!({
                "period_days": period_days,
                "via_autopay": via_autopay,
                "previous_end_date": subscription.end_date.to_string(),
            }),
        )
        .await?;
        tx.commit().await?;

        let subscription = subscriptions::get_by_user(self.store.pool(), user_id)
            .await?
            .ok_or_else(|| Error::Internal("subscription vanished after extension".into()))?;

        tracing::info!(
            user_id,
            total_kopeks = quote.total_kopeks,
            new_end = %new_end,
            via_autopay,
            "subscription extended"
        );

        let remote = self.sync_to_panel(&user, &subscription).await;
        let subscription_url = remote.and_then(|r| r.subscription_url);

        let event_type = if via_autopay {
            EventType::AutopayCharged
        } else {
            EventType::SubscriptionExtended
        };
        self.append_event(
            event_type,
            &user,
            Some(subscription.id),
            Some(tx_row.id),
            Some(quote.total_kopeks),
        )
        .await;

        if via_autopay {
            let balance = users::get(self.store.pool(), user_id)
                .await
                .map(|u| u.balance_kopeks)
                .unwrap_or(0);
            self.bus.notify_user(
                user.telegram_id,
                &user.language,
                UserNotice::AutopayCharged {
                    total_kopeks: quote.total_kopeks,
                    end_date: new_end,
                    balance_kopeks: balance,
                },
            );
        } else {
            self.bus.notify_user(
                user.telegram_id,
                &user.language,
                UserNotice::SubscriptionExtended {
                    total_kopeks: quote.total_kopeks,
                    end_date: new_end,
                },
            );
            self.bus.notify_admins(AdminNotice::SubscriptionExtended {
                user_id,
                total_kopeks: quote.total_kopeks,
                period_days,
            });
        }

        Ok(PurchaseOutcome {
            subscription,
            quote,
            transaction_id: tx_row.id,
            subscription_url,
        })
    }

    /// Switches to a different traffic package, charging the prorated
    /// monthly delta. Downgrades are free and never refund.
    pub async fn switch_traffic(&self, user_id: i64, new_gb: u32) -> Result<i64, Error> {
        let prices = &self.settings.prices;
        let new_monthly = prices.traffic_price(new_gb).ok_or_else(|| {
            Error::validation("traffic_gb", format!("{new_gb} GB is not a configured package"))
        })?;
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let subscription = self.paid_subscription(&mut tx, user_id).await?;
        if subscription.traffic_limit_gb as u32 == new_gb {
            return Err(Error::validation("traffic_gb", "already on this package"));
        }
        let current_monthly = prices
            .traffic_price(subscription.traffic_limit_gb as u32)
            .unwrap_or(0);
        let group = promo_groups::for_user(&mut *tx, user.promo_group_id).await?;
        let addon = pricing::quote_addon(
            new_monthly - current_monthly,
            group.discounts(0).traffic_percent,
            subscription.end_date,
            now,
        );

        let tx_id = self
            .charge_addon(
                &mut tx,
                &user,
                addon.total_kopeks,
                &format!("Traffic package switch to {new_gb} GB"),
                serde_json::json!({
                    "from_gb": subscription.traffic_limit_gb,
                    "to_gb": new_gb,
                    "months": addon.months,
                }),
            )
            .await?;
        subscriptions::set_traffic_limit(&mut *tx, subscription.id, new_gb as i32).await?;
        tx.commit().await?;

        self.finish_addon(
            &user,
            subscription.id,
            tx_id,
            addon.total_kopeks,
            EventType::TrafficSwitched,
            format!("Traffic package: {new_gb} GB"),
        )
        .await;
        Ok(addon.total_kopeks)
    }

    /// Adds a traffic package on top of the current limit, prorated.
    pub async fn add_traffic(&self, user_id: i64, package_gb: u32) -> Result<i64, Error> {
        if package_gb == 0 {
            return Err(Error::validation(
                "traffic_gb",
                "use switch_traffic to move to the unlimited package",
            ));
        }
        let monthly = self.settings.prices.traffic_price(package_gb).ok_or_else(|| {
            Error::validation("traffic_gb", format!("{package_gb} GB is not a configured package"))
        })?;
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let subscription = self.paid_subscription(&mut tx, user_id).await?;
        if subscription.is_unlimited_traffic() {
            return Err(Error::validation(
                "traffic_gb",
                "the unlimited package cannot be topped up",
            ));
        }
        let group = promo_groups::for_user(&mut *tx, user.promo_group_id).await?;
        let addon = pricing::quote_addon(
            monthly,
            group.discounts(0).traffic_percent,
            subscription.end_date,
            now,
        );

        // The extra gigabytes go into their own snapshot column; the
        // package key stays priceable on the next extension.
        let new_total = subscription.effective_traffic_limit_gb() + package_gb as i32;
        let tx_id = self
            .charge_addon(
                &mut tx,
                &user,
                addon.total_kopeks,
                &format!("Extra traffic: +{package_gb} GB"),
                serde_json::json!({
                    "added_gb": package_gb,
                    "new_limit_gb": new_total,
                    "months": addon.months,
                }),
            )
            .await?;
        subscriptions::add_purchased_traffic(&mut *tx, subscription.id, package_gb as i32).await?;
        tx.commit().await?;

        self.finish_addon(
            &user,
            subscription.id,
            tx_id,
            addon.total_kopeks,
            EventType::TrafficAdded,
            format!("Extra traffic: +{package_gb} GB"),
        )
        .await;
        Ok(addon.total_kopeks)
    }

    /// Changes the device limit, charging the prorated delta on upgrades.
    pub async fn change_devices(&self, user_id: i64, new_limit: u32) -> Result<i64, Error> {
        let prices = &self.settings.prices;
        if new_limit < 1 || new_limit > prices.max_devices_limit {
            return Err(Error::validation(
                "device_limit",
                format!("must be between 1 and {}", prices.max_devices_limit),
            ));
        }
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let subscription = self.paid_subscription(&mut tx, user_id).await?;
        if subscription.device_limit as u32 == new_limit {
            return Err(Error::validation("device_limit", "already at this limit"));
        }
        let group = promo_groups::for_user(&mut *tx, user.promo_group_id).await?;
        let delta_monthly =
            prices.devices_monthly(new_limit) - prices.devices_monthly(subscription.device_limit as u32);
        let addon = pricing::quote_addon(
            delta_monthly,
            group.discounts(0).device_percent,
            subscription.end_date,
            now,
        );

        let tx_id = self
            .charge_addon(
                &mut tx,
                &user,
                addon.total_kopeks,
                &format!("Device limit change to {new_limit}"),
                serde_json::json!({
                    "from": subscription.device_limit,
                    "to": new_limit,
                    "months": addon.months,
                }),
            )
            .await?;
        subscriptions::set_device_limit(&mut *tx, subscription.id, new_limit as i32).await?;
        tx.commit().await?;

        self.finish_addon(
            &user,
            subscription.id,
            tx_id,
            addon.total_kopeks,
            EventType::DevicesChanged,
            format!("Device limit: {new_limit}"),
        )
        .await;
        Ok(addon.total_kopeks)
    }

    /// Connects additional servers, each billed prorated at its current
    /// price. Re-adding a previously removed server is billed anew.
    pub async fn add_servers(&self, user_id: i64, squad_uuids: &[Uuid]) -> Result<i64, Error> {
        if squad_uuids.is_empty() {
            return Err(Error::validation("server_uuids", "nothing to add"));
        }
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let subscription = self.paid_subscription(&mut tx, user_id).await?;
        for uuid in squad_uuids {
            if subscription.connected_squads.contains(uuid) {
                return Err(Error::validation("server_uuids", "server already connected"));
            }
        }
        let added = servers::resolve_squads(&mut *tx, squad_uuids).await?;
        let group = promo_groups::for_user(&mut *tx, user.promo_group_id).await?;
        let percent = group.discounts(0).server_percent;

        let months = pricing::remaining_months(subscription.end_date, now);
        let mut total = 0;
        let mut links = Vec::with_capacity(added.len());
        for server in &added {
            let addon =
                pricing::quote_addon(server.price_kopeks_per_month, percent, subscription.end_date, now);
            total += addon.total_kopeks;
            links.push((server.id, addon.total_kopeks));
        }

        let tx_id = self
            .charge_addon(
                &mut tx,
                &user,
                total,
                &format!("Servers added: {}", added.len()),
                serde_json::json!({
                    "squad_uuids": squad_uuids,
                    "months": months,
                }),
            )
            .await?;
        let mut squads = subscription.connected_squads.clone();
        squads.extend_from_slice(squad_uuids);
        subscriptions::set_connected_squads(&mut *tx, subscription.id, &squads).await?;
        for (server_id, paid) in &links {
            subscriptions::add_server_link(&mut *tx, subscription.id, *server_id, *paid).await?;
        }
        tx.commit().await?;

        self.finish_addon(
            &user,
            subscription.id,
            tx_id,
            total,
            EventType::ServersAdded,
            format!("Servers added: {}", added.len()),
        )
        .await;
        Ok(total)
    }

    /// Disconnects servers. Always free; nothing is refunded.
    pub async fn remove_servers(&self, user_id: i64, squad_uuids: &[Uuid]) -> Result<(), Error> {
        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let subscription = self.paid_subscription(&mut tx, user_id).await?;

        let remaining: Vec<Uuid> = subscription
            .connected_squads
            .iter()
            .filter(|uuid| !squad_uuids.contains(uuid))
            .copied()
            .collect();
        if remaining.len() == subscription.connected_squads.len() {
            return Err(Error::validation("server_uuids", "no matching connected server"));
        }
        if remaining.is_empty() {
            return Err(Error::validation(
                "server_uuids",
                "a subscription must keep at least one server",
            ));
        }
        subscriptions::set_connected_squads(&mut *tx, subscription.id, &remaining).await?;
        let removed = servers::resolve_squads_any(&mut *tx, squad_uuids).await?;
        for server in &removed {
            subscriptions::remove_server_link(&mut *tx, subscription.id, server.id).await?;
        }
        tx.commit().await?;

        let refreshed = subscriptions::get_by_user(self.store.pool(), user_id).await?;
        if let Some(sub) = refreshed {
            self.sync_to_panel(&user, &sub).await;
        }
        self.append_event(EventType::ServersRemoved, &user, Some(subscription.id), None, None)
            .await;
        Ok(())
    }

    /// Toggles the modem add-on, billed as one extra device slot.
    pub async fn set_modem(&self, user_id: i64, enabled: bool) -> Result<i64, Error> {
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let subscription = self.paid_subscription(&mut tx, user_id).await?;
        if subscription.modem_enabled == enabled {
            return Err(Error::validation("modem", "already in the requested state"));
        }

        let mut total = 0;
        let mut tx_id = None;
        if enabled {
            let group = promo_groups::for_user(&mut *tx, user.promo_group_id).await?;
            let addon = pricing::quote_addon(
                self.settings.prices.price_per_device,
                group.discounts(0).device_percent,
                subscription.end_date,
                now,
            );
            total = addon.total_kopeks;
            tx_id = Some(
                self.charge_addon(
                    &mut tx,
                    &user,
                    total,
                    "Modem mode enabled",
                    serde_json::json!({ "months": addon.months }),
                )
                .await?,
            );
        }
        subscriptions::set_modem(&mut *tx, subscription.id, enabled).await?;
        tx.commit().await?;

        self.finish_addon(
            &user,
            subscription.id,
            tx_id.unwrap_or(0),
            total,
            EventType::ModemToggled,
            if enabled { "Modem mode enabled" } else { "Modem mode disabled" }.to_owned(),
        )
        .await;
        Ok(total)
    }

    /// Zeroes the traffic counter for a flat monthly-base fee.
    pub async fn reset_traffic(&self, user_id: i64) -> Result<i64, Error> {
        let fee = self
            .settings
            .prices
            .period_price(30)
            .ok_or_else(|| Error::Internal("no 30-day price configured".into()))?;

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let subscription = self.paid_subscription(&mut tx, user_id).await?;
        if subscription.is_unlimited_traffic() {
            return Err(Error::validation(
                "traffic_limit",
                "unlimited subscriptions have no counter to reset",
            ));
        }
        users::debit_balance(&mut *tx, user_id, fee).await?;
        let tx_row = transactions::insert(
            &mut *tx,
            user_id,
            transactions::TransactionType::SubscriptionPayment,
            fee,
            "Traffic counter reset",
            serde_json::json!({}),
        )
        .await?;
        subscriptions::set_traffic_used(&mut *tx, subscription.id, 0.0).await?;
        tx.commit().await?;

        if let Some(panel_uuid) = user.panel_uuid {
            if let Err(e) = self.panel.reset_traffic(panel_uuid).await {
                self.report_panel_failure(&user, "reset_traffic", e);
            }
        }
        self.append_event(
            EventType::TrafficReset,
            &user,
            Some(subscription.id),
            Some(tx_row.id),
            Some(fee),
        )
        .await;
        self.bus.notify_user(
            user.telegram_id,
            &user.language,
            UserNotice::TrafficReset { fee_kopeks: fee },
        );
        Ok(fee)
    }

    /// Enables or disables autopay, with the user's warning window.
    pub async fn set_autopay(
        &self,
        user_id: i64,
        enabled: bool,
        days_before: u32,
    ) -> Result<(), Error> {
        if !(1..=14).contains(&days_before) {
            return Err(Error::validation(
                "autopay_days_before",
                "must be between 1 and 14 days",
            ));
        }
        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, user_id).await?;
        let subscription = self.paid_subscription(&mut tx, user_id).await?;
        subscriptions::set_autopay(&mut *tx, subscription.id, enabled, days_before as i32).await?;
        tx.commit().await?;

        self.append_event(EventType::AutopayToggled, &user, Some(subscription.id), None, None)
            .await;
        Ok(())
    }

    /// Refreshes panel-reported usage (and the import link, if it
    /// changed). Read-only; safe from the menu render path.
    pub async fn sync_usage(&self, user_id: i64) -> Result<Option<Subscription>, Error> {
        let pool = self.store.pool();
        let user = users::get(pool, user_id).await?;
        let Some(subscription) = subscriptions::get_by_user(pool, user_id).await? else {
            return Ok(None);
        };
        let Some(panel_uuid) = user.panel_uuid else {
            return Ok(Some(subscription));
        };

        let remote = self.panel.get_remote_user(panel_uuid).await?;
        subscriptions::set_traffic_used(pool, subscription.id, remote.used_traffic_gb()).await?;
        if let Some(url) = &remote.subscription_url {
            if subscription.subscription_url.as_deref() != Some(url) {
                subscriptions::set_subscription_url(pool, subscription.id, url).await?;
            }
        }
        Ok(subscriptions::get_by_user(pool, user_id).await?)
    }

    /// Pushes the current subscription state to the panel.
    ///
    /// Never fails the caller: a transient failure is logged and left for
    /// the next write to reconcile; a permanent one additionally alerts
    /// admins.
    pub async fn sync_to_panel(&self, user: &User, subscription: &Subscription) -> Option<RemoteUser> {
        let now = OffsetDateTime::now_utc();
        let username = format!("tg{}", user.telegram_id);
        let status = match subscription.actual_status(now) {
            SubscriptionStatus::Active => RemoteUserStatus::Active,
            SubscriptionStatus::Expired => RemoteUserStatus::Expired,
            SubscriptionStatus::Disabled => RemoteUserStatus::Disabled,
        };
        let write = RemoteUserWrite {
            username: &username,
            telegram_id: user.telegram_id,
            traffic_limit_bytes: subscription.effective_traffic_limit_gb() as u64 * BYTES_PER_GB,
            hwid_device_limit: subscription.device_limit as u32,
            expire_at: subscription.end_date,
            active_internal_squads: &subscription.connected_squads,
            status,
        };

        let result = match user.panel_uuid {
            Some(uuid) => self.panel.update_remote_user(uuid, &write).await,
            None => self.panel.create_remote_user(&write).await,
        };
        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                self.report_panel_failure(user, "sync_subscription", e);
                return None;
            }
        };

        let pool = self.store.pool();
        if user.panel_uuid != Some(remote.uuid) {
            let _ = users::set_panel_identity(pool, user.id, remote.uuid, &remote.short_uuid).await;
        }
        if let Some(url) = &remote.subscription_url {
            let _ = subscriptions::set_subscription_url(pool, subscription.id, url).await;
        }
        Some(remote)
    }

    fn report_panel_failure(&self, user: &User, context: &str, e: Error) {
        if e.is_transient() {
            tracing::warn!(
                user_id = user.id,
                context,
                error = %e,
                "panel sync failed; DB state is authoritative, will reconcile on next write"
            );
        } else {
            tracing::error!(user_id = user.id, context, error = %e, "permanent panel failure");
            self.bus.notify_admins(AdminNotice::PanelError {
                context: format!("{context} (user {})", user.id),
                detail: e.to_string(),
            });
        }
    }

    /// Loads the locked, paid, mutable subscription or explains why not.
    async fn paid_subscription(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        user_id: i64,
    ) -> Result<Subscription, Error> {
        let subscription = subscriptions::get_by_user_for_update(&mut **tx, user_id)
            .await?
            .ok_or_else(|| Error::validation("subscription", "no subscription"))?;
        if subscription.is_trial {
            return Err(Error::TrialIneligible);
        }
        Ok(subscription)
    }

    /// Debits and records an add-on charge. Zero-cost add-ons skip the
    /// ledger entirely.
    async fn charge_addon(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        user: &User,
        total_kopeks: i64,
        description: &str,
        metadata: serde_json::Value,
    ) -> Result<i64, Error> {
        if total_kopeks <= 0 {
            return Ok(0);
        }
        users::debit_balance(&mut **tx, user.id, total_kopeks).await?;
        let row = transactions::insert(
            &mut **tx,
            user.id,
            transactions::TransactionType::SubscriptionPayment,
            total_kopeks,
            description,
            metadata,
        )
        .await?;
        Ok(row.id)
    }

    /// Post-commit tail shared by the add-on flows: panel sync, event,
    /// user notice.
    async fn finish_addon(
        &self,
        user: &User,
        subscription_id: i64,
        transaction_id: i64,
        total_kopeks: i64,
        event_type: EventType,
        description: String,
    ) {
        if let Ok(Some(subscription)) =
            subscriptions::get_by_user(self.store.pool(), user.id).await
        {
            self.sync_to_panel(user, &subscription).await;
        }
        self.append_event(
            event_type,
            user,
            Some(subscription_id),
            (transaction_id != 0).then_some(transaction_id),
            (total_kopeks > 0).then_some(total_kopeks),
        )
        .await;
        if total_kopeks > 0 {
            self.bus.notify_user(
                user.telegram_id,
                &user.language,
                UserNotice::AddonApplied {
                    description,
                    total_kopeks,
                },
            );
        }
    }

    async fn append_event(
        &self,
        event_type: EventType,
        user: &User,
        subscription_id: Option<i64>,
        transaction_id: Option<i64>,
        amount_kopeks: Option<i64>,
    ) {
        if let Err(e) = events::append(
            self.store.pool(),
            event_type,
            user.id,
            subscription_id,
            transaction_id,
            amount_kopeks,
            serde_json::json!({}),
        )
        .await
        {
            tracing::error!(user_id = user.id, ?event_type, error = %e, "failed to append event");
        }
    }
}
