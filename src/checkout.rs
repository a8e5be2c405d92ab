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

//! The checkout orchestrator.
//!
//! Drives the configuration wizard as a step machine, persists a draft on
//! every transition so a user bounced out to the top-up flow can resume,
//! and gates the final commit on an up-to-date quote: if price inputs
//! changed between quote and commit, the commit aborts back to the draft
//! with [`Error::OrderChanged`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::pricing::Quote;
use crate::service::{PurchaseConfig, PurchaseOutcome, SubscriptionService};
use crate::store::drafts;

/// The wizard steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStep {
    SelectingPeriod,
    SelectingTraffic,
    SelectingCountries,
    SelectingDevices,
    ConfirmingPurchase,
}

/// The resumable wizard snapshot persisted as the user's checkout draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutState {
    pub step: CheckoutStep,
    pub period_days: Option<u32>,
    pub traffic_gb: Option<u32>,
    pub server_uuids: Vec<Uuid>,
    pub device_limit: Option<u32>,
    /// The quote shown at the confirmation step. Commit re-verifies it.
    pub quote: Option<Quote>,
}

impl Default for CheckoutState {
    fn default() -> CheckoutState {
        CheckoutState {
            step: CheckoutStep::SelectingPeriod,
            period_days: None,
            traffic_gb: None,
            server_uuids: Vec::new(),
            device_limit: None,
            quote: None,
        }
    }
}

impl CheckoutState {
    /// The complete purchase configuration, once every step has run.
    pub fn config(&self) -> Option<PurchaseConfig> {
        Some(PurchaseConfig {
            period_days: self.period_days?,
            traffic_gb: self.traffic_gb?,
            device_limit: self.device_limit?,
            server_uuids: self.server_uuids.clone(),
        })
    }

    fn expect_step(&self, step: CheckoutStep) -> Result<(), Error> {
        if self.step != step {
            return Err(Error::validation(
                "step",
                format!("expected {:?}, wizard is at {:?}", step, self.step),
            ));
        }
        Ok(())
    }

    /// Records the period selection and advances to traffic selection.
    pub fn select_period(&mut self, period_days: u32) -> Result<(), Error> {
        self.expect_step(CheckoutStep::SelectingPeriod)?;
        self.period_days = Some(period_days);
        self.step = CheckoutStep::SelectingTraffic;
        Ok(())
    }

    /// Records the traffic package and advances to country selection.
    pub fn select_traffic(&mut self, traffic_gb: u32) -> Result<(), Error> {
        self.expect_step(CheckoutStep::SelectingTraffic)?;
        self.traffic_gb = Some(traffic_gb);
        self.step = CheckoutStep::SelectingCountries;
        Ok(())
    }

    /// Adds or removes a server while on the country step.
    pub fn toggle_server(&mut self, squad_uuid: Uuid) -> Result<(), Error> {
        self.expect_step(CheckoutStep::SelectingCountries)?;
        if let Some(pos) = self.server_uuids.iter().position(|u| *u == squad_uuid) {
            self.server_uuids.remove(pos);
        } else {
            self.server_uuids.push(squad_uuid);
        }
        Ok(())
    }

    /// Locks the server selection and advances to device selection.
    pub fn confirm_servers(&mut self) -> Result<(), Error> {
        self.expect_step(CheckoutStep::SelectingCountries)?;
        if self.server_uuids.is_empty() {
            return Err(Error::validation("server_uuids", "select at least one server"));
        }
        self.step = CheckoutStep::SelectingDevices;
        Ok(())
    }

    /// Records the device limit and advances to confirmation.
    pub fn select_devices(&mut self, device_limit: u32) -> Result<(), Error> {
        self.expect_step(CheckoutStep::SelectingDevices)?;
        self.device_limit = Some(device_limit);
        self.step = CheckoutStep::ConfirmingPurchase;
        Ok(())
    }

    /// Steps back to the country selection, e.g. after `OrderChanged`.
    pub fn back_to_countries(&mut self) {
        self.step = CheckoutStep::SelectingCountries;
        self.quote = None;
    }
}

/// Runs the wizard against the subscription service and the draft store.
#[derive(Clone)]
pub struct CheckoutOrchestrator {
    service: SubscriptionService,
}

impl CheckoutOrchestrator {
    pub fn new(service: SubscriptionService) -> CheckoutOrchestrator {
        CheckoutOrchestrator { service }
    }

    /// Starts a fresh wizard, replacing any existing draft.
    pub async fn begin(&self, user_id: i64) -> Result<CheckoutState, Error> {
        let state = CheckoutState::default();
        self.persist(user_id, &state).await?;
        Ok(state)
    }

    /// Restores the user's saved draft, if any.
    pub async fn resume(&self, user_id: i64) -> Result<Option<CheckoutState>, Error> {
        let Some(row) = drafts::load(self.service.store().pool(), user_id).await? else {
            return Ok(None);
        };
        let state: CheckoutState = serde_json::from_value(row.state.0.clone())?;
        Ok(Some(state))
    }

    /// Applies one wizard transition, refreshes the quote when the
    /// configuration is complete, and persists the draft.
    pub async fn transition<F>(
        &self,
        user_id: i64,
        state: &mut CheckoutState,
        apply: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut CheckoutState) -> Result<(), Error>,
    {
        apply(state)?;
        state.quote = match state.config() {
            Some(config) => Some(self.service.quote_purchase(user_id, &config).await?),
            None => None,
        };
        self.persist(user_id, state).await?;
        Ok(())
    }

    /// Commits the configured purchase.
    ///
    /// Recomputes the quote inside this call; when the total drifted from
    /// the one the user confirmed, the draft is rewound to the country
    /// step and [`Error::OrderChanged`] is returned. On
    /// [`Error::InsufficientFunds`] the draft is left saved so the top-up
    /// flow can resume it.
    pub async fn commit(
        &self,
        user_id: i64,
        state: &mut CheckoutState,
    ) -> Result<PurchaseOutcome, Error> {
        state.expect_step(CheckoutStep::ConfirmingPurchase)?;
        let config = state
            .config()
            .ok_or_else(|| Error::validation("config", "wizard is incomplete"))?;
        let confirmed = state
            .quote
            .as_ref()
            .ok_or_else(|| Error::validation("quote", "no confirmed quote"))?;

        let fresh = self.service.quote_purchase(user_id, &config).await?;
        if fresh.total_kopeks != confirmed.total_kopeks {
            tracing::info!(
                user_id,
                confirmed = confirmed.total_kopeks,
                fresh = fresh.total_kopeks,
                "order changed between quote and commit"
            );
            state.back_to_countries();
            self.persist(user_id, state).await?;
            return Err(Error::OrderChanged);
        }

        match self.service.purchase(user_id, &config).await {
            Ok(outcome) => Ok(outcome),
            Err(e @ Error::InsufficientFunds { .. }) => {
                // The draft survives so the user resumes after topping up.
                self.persist(user_id, state).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Discards the user's draft.
    pub async fn abandon(&self, user_id: i64) -> Result<(), Error> {
        drafts::delete(self.service.store().pool(), user_id).await
    }

    async fn persist(&self, user_id: i64, state: &CheckoutState) -> Result<(), Error> {
        drafts::save(
            self.service.store().pool(),
            user_id,
            serde_json::to_value(state)?,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_step() {
        let mut state = CheckoutState::default();
        state.select_period(30).unwrap();
        state.select_traffic(100).unwrap();
        let squad = Uuid::new_v4();
        state.toggle_server(squad).unwrap();
        state.confirm_servers().unwrap();
        state.select_devices(2).unwrap();
        assert_eq!(state.step, CheckoutStep::ConfirmingPurchase);

        let config = state.config().unwrap();
        assert_eq!(config.period_days, 30);
        assert_eq!(config.traffic_gb, 100);
        assert_eq!(config.device_limit, 2);
        assert_eq!(config.server_uuids, vec![squad]);
    }

    #[test]
    fn steps_reject_out_of_order_input() {
        let mut state = CheckoutState::default();
        assert!(state.select_traffic(100).is_err());
        state.select_period(30).unwrap();
        assert!(state.select_period(60).is_err());
        assert!(state.select_devices(1).is_err());
    }

    #[test]
    fn toggling_a_server_twice_removes_it() {
        let mut state = CheckoutState::default();
        state.select_period(30).unwrap();
        state.select_traffic(100).unwrap();
        let squad = Uuid::new_v4();
        state.toggle_server(squad).unwrap();
        state.toggle_server(squad).unwrap();
        assert!(state.server_uuids.is_empty());
        assert!(state.confirm_servers().is_err());
    }

    #[test]
    fn config_requires_every_field() {
        let mut state = CheckoutState::default();
        assert!(state.config().is_none());
        state.select_period(30).unwrap();
        state.select_traffic(100).unwrap();
        state.toggle_server(Uuid::new_v4()).unwrap();
        state.confirm_servers().unwrap();
        assert!(state.config().is_none());
        state.select_devices(1).unwrap();
        assert!(state.config().is_some());
    }

    #[test]
    fn state_round_trips_through_the_draft_payload() {
        let mut state = CheckoutState::default();
        state.select_period(90).unwrap();
        state.select_traffic(0).unwrap();
        state.toggle_server(Uuid::new_v4()).unwrap();

        let value = serde_json::to_value(&state).unwrap();
        let restored: CheckoutState = serde_json::from_value(value).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.step, CheckoutStep::SelectingCountries);
    }

    #[test]
    fn rewinding_clears_the_stale_quote() {
        let mut state = CheckoutState::default();
        state.select_period(30).unwrap();
        state.select_traffic(100).unwrap();
        state.toggle_server(Uuid::new_v4()).unwrap();
        state.confirm_servers().unwrap();
        state.select_devices(1).unwrap();
        state.back_to_countries();
        assert_eq!(state.step, CheckoutStep::SelectingCountries);
        assert!(state.quote.is_none());
    }
}
