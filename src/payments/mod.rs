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

//! Payment ingress.
//!
//! Each provider's webhook is parsed and verified by a [`ProviderAdapter`]
//! and normalized into a [`TopupEvent`]; one common commit path credits
//! the balance exactly once per `(provider, external_id)`. The HTTP
//! endpoints themselves live outside the broker core; they hand the raw
//! body and signature here and translate the outcome into the provider's
//! expected webhook response.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::Error;
use crate::notify::{AdminNotice, NotificationBus, UserNotice};
use crate::store::events::EventType;
use crate::store::transactions::Transaction;
use crate::store::{events, payments as payment_intents, receipts, transactions, users, Store};

pub mod mulenpay;
pub mod nalogo;
pub mod wata;
pub mod yookassa;

/// A provider webhook normalized to the common credit call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupEvent {
    /// The broker user being credited.
    pub user_id: i64,
    pub amount_kopeks: i64,
    /// The provider-assigned payment ID; the dedupe key together with
    /// the provider name.
    pub external_id: String,
    /// Optional customer identification passed through to the fiscal
    /// receipt.
    pub client_info: Option<String>,
    /// Provider-specific context kept on the transaction row.
    pub metadata: serde_json::Value,
}

/// A payment provider's webhook adapter: verify, then parse.
///
/// `verify` runs against the raw body before anything is deserialized;
/// adapters must reject unsigned or mis-signed payloads with
/// [`Error::InvalidSignature`].
pub trait ProviderAdapter: Send + Sync {
    /// The provider name used in dedupe keys and transaction rows.
    fn name(&self) -> &'static str;

    /// Verifies the webhook's authenticity.
    fn verify(&self, raw_body: &[u8], signature: Option<&str>) -> Result<(), Error>;

    /// Parses the webhook into the normalized event.
    ///
    /// Returns `Ok(None)` for webhook kinds that require no action
    /// (pending, canceled); the endpoint acknowledges them without
    /// crediting.
    fn parse(&self, raw_body: &[u8]) -> Result<Option<TopupEvent>, Error>;
}

/// How a top-up call concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum TopupOutcome {
    /// The balance was credited and a ledger row written.
    Credited(Box<Transaction>),
    /// A completed deposit with this external ID already existed; the
    /// webhook is acknowledged without crediting.
    Duplicate,
}

/// The common commit path behind every provider endpoint.
#[derive(Clone)]
pub struct PaymentIngress {
    settings: Arc<Settings>,
    store: Store,
    bus: NotificationBus,
}

impl PaymentIngress {
    pub fn new(settings: Arc<Settings>, store: Store, bus: NotificationBus) -> PaymentIngress {
        PaymentIngress {
            settings,
            store,
            bus,
        }
    }

    /// Verifies, parses, and processes one webhook delivery end to end.
    pub async fn handle_webhook(
        &self,
        adapter: &dyn ProviderAdapter,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<TopupOutcome, Error> {
        adapter.verify(raw_body, signature)?;
        match adapter.parse(raw_body)? {
            Some(event) => self.process_topup(adapter.name(), &event).await,
            None => Ok(TopupOutcome::Duplicate),
        }
    }

    /// Credits a verified top-up exactly once.
    ///
    /// Replayed webhooks short-circuit to [`TopupOutcome::Duplicate`]; the
    /// balance delta, the ledger row, and the queued fiscal receipt
    /// commit together or not at all.
    pub async fn process_topup(
        &self,
        provider: &'static str,
        event: &TopupEvent,
    ) -> Result<TopupOutcome, Error> {
        if event.amount_kopeks <= 0 {
            return Err(Error::validation("amount_kopeks", "must be positive"));
        }

        // Cheap pre-check outside the transaction; the unique index is
        // what actually enforces exactly-once under replay races.
        if transactions::find_completed_deposit(self.store.pool(), provider, &event.external_id)
            .await?
            .is_some()
        {
            tracing::info!(provider, external_id = %event.external_id, "duplicate top-up ignored");
            return Ok(TopupOutcome::Duplicate);
        }

        let mut tx = self.store.begin().await?;
        let user = users::get_for_update(&mut *tx, event.user_id).await?;
        let row = match transactions::record_deposit(
            &mut tx,
            event.user_id,
            event.amount_kopeks,
            provider,
            &event.external_id,
            &format!("Balance top-up via {provider}"),
            event.metadata.clone(),
        )
        .await
        {
            Ok(row) => row,
            Err(Error::DuplicatePayment { external_id }) => {
                tracing::info!(provider, %external_id, "duplicate top-up lost the insert race");
                return Ok(TopupOutcome::Duplicate);
            }
            Err(e) => return Err(e),
        };
        payment_intents::mark_completed(&mut *tx, provider, &event.external_id, row.id).await?;
        if self.settings.receipts_enabled {
            receipts::enqueue(
                &mut *tx,
                row.id,
                "VPN subscription balance top-up",
                event.amount_kopeks,
                1,
                event.client_info.as_deref(),
            )
            .await?;
        }
        tx.commit().await?;

        tracing::info!(
            provider,
            user_id = event.user_id,
            amount_kopeks = event.amount_kopeks,
            external_id = %event.external_id,
            "top-up credited"
        );

        if let Err(e) = events::append(
            self.store.pool(),
            EventType::PaymentReceived,
            event.user_id,
            None,
            Some(row.id),
            Some(event.amount_kopeks),
            serde_json::json!({ "provider": provider, "external_id": event.external_id }),
        )
        .await
        {
            tracing::error!(error = %e, "failed to append payment_received event");
        }

        let balance = user.balance_kopeks + event.amount_kopeks;
        self.bus.notify_user(
            user.telegram_id,
            &user.language,
            UserNotice::TopupCredited {
                amount_kopeks: event.amount_kopeks,
                balance_kopeks: balance,
            },
        );
        self.bus.notify_admins(AdminNotice::PaymentReceived {
            user_id: event.user_id,
            provider: provider.to_owned(),
            amount_kopeks: event.amount_kopeks,
            external_id: event.external_id.clone(),
        });

        Ok(TopupOutcome::Credited(Box::new(row)))
    }
}

/// Parses a provider's decimal ruble string (`"500.00"`) into kopeks
/// without going through floating point.
pub(crate) fn rubles_to_kopeks(value: &str) -> Result<i64, Error> {
    let value = value.trim();
    let (rubles, kopeks) = match value.split_once('.') {
        Some((r, k)) => (r, k),
        None => (value, ""),
    };
    let rubles: i64 = rubles
        .parse()
        .map_err(|_| Error::validation("amount", format!("bad decimal amount {value:?}")))?;
    if rubles < 0 {
        return Err(Error::validation("amount", "negative amount"));
    }
    let kopeks = match kopeks.len() {
        0 => 0,
        1 | 2 => {
            let parsed: i64 = kopeks
                .parse()
                .map_err(|_| Error::validation("amount", format!("bad decimal amount {value:?}")))?;
            if kopeks.len() == 1 {
                parsed * 10
            } else {
                parsed
            }
        }
        _ => {
            return Err(Error::validation(
                "amount",
                format!("more than two decimal places in {value:?}"),
            ))
        }
    };
    Ok(rubles * 100 + kopeks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_amounts_convert_exactly() {
        assert_eq!(rubles_to_kopeks("500.00").unwrap(), 50_000);
        assert_eq!(rubles_to_kopeks("500").unwrap(), 50_000);
        assert_eq!(rubles_to_kopeks("0.01").unwrap(), 1);
        assert_eq!(rubles_to_kopeks("99.5").unwrap(), 9_950);
        assert_eq!(rubles_to_kopeks(" 1240.00 ").unwrap(), 124_000);
    }

    #[test]
    fn malformed_amounts_are_rejected() {
        assert!(rubles_to_kopeks("12.345").is_err());
        assert!(rubles_to_kopeks("-5.00").is_err());
        assert!(rubles_to_kopeks("abc").is_err());
        assert!(rubles_to_kopeks("1,50").is_err());
    }
}
