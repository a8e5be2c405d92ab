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

//! The shared-secret provider adapter (YooKassa-class).
//!
//! The webhook endpoint authenticates deliveries with a shared secret
//! header; payloads carry an event kind and a payment object with the
//! broker user ID in its metadata.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::YookassaSettings;
use crate::error::Error;
use crate::payments::{rubles_to_kopeks, ProviderAdapter, TopupEvent};

const SUCCEEDED_EVENT: &str = "payment.succeeded";

#[derive(Debug, Deserialize)]
struct Webhook {
    event: String,
    object: PaymentObject,
}

#[derive(Debug, Deserialize)]
struct PaymentObject {
    id: String,
    status: String,
    amount: Amount,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct Amount {
    value: String,
    currency: String,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    user_id: Option<String>,
    #[serde(default)]
    customer_email: Option<String>,
}

pub struct YookassaAdapter {
    settings: YookassaSettings,
}

impl YookassaAdapter {
    pub fn new(settings: YookassaSettings) -> YookassaAdapter {
        YookassaAdapter { settings }
    }
}

impl ProviderAdapter for YookassaAdapter {
    fn name(&self) -> &'static str {
        "yookassa"
    }

    fn verify(&self, _raw_body: &[u8], signature: Option<&str>) -> Result<(), Error> {
        let presented = signature.ok_or(Error::InvalidSignature { provider: "yookassa" })?;
        // Digest comparison keeps the check constant-time.
        let expected = Sha256::digest(self.settings.secret_key.as_bytes());
        let got = Sha256::digest(presented.as_bytes());
        if expected != got {
            return Err(Error::InvalidSignature { provider: "yookassa" });
        }
        Ok(())
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Option<TopupEvent>, Error> {
        let webhook: Webhook = serde_json::from_slice(raw_body)?;
        if webhook.event != SUCCEEDED_EVENT || webhook.object.status != "succeeded" {
            return Ok(None);
        }
        if webhook.object.amount.currency != "RUB" {
            return Err(Error::validation(
                "currency",
                format!("unsupported currency {}", webhook.object.amount.currency),
            ));
        }
        let user_id: i64 = webhook
            .object
            .metadata
            .user_id
            .as_deref()
            .ok_or_else(|| Error::validation("metadata.user_id", "missing"))?
            .parse()
            .map_err(|_| Error::validation("metadata.user_id", "not an integer"))?;

        Ok(Some(TopupEvent {
            user_id,
            amount_kopeks: rubles_to_kopeks(&webhook.object.amount.value)?,
            external_id: webhook.object.id,
            client_info: webhook.object.metadata.customer_email,
            metadata: serde_json::json!({ "shop_id": self.settings.shop_id }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> YookassaAdapter {
        YookassaAdapter::new(YookassaSettings {
            shop_id: "shop-1".into(),
            secret_key: "s3cret".into(),
        })
    }

    fn succeeded_body() -> Vec<u8> {
        serde_json::json!({
            "event": "payment.succeeded",
            "object": {
                "id": "pay-42",
                "status": "succeeded",
                "amount": { "value": "500.00", "currency": "RUB" },
                "metadata": { "user_id": "7" },
            },
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn succeeded_payment_normalizes() {
        let event = adapter().parse(&succeeded_body()).unwrap().unwrap();
        assert_eq!(event.user_id, 7);
        assert_eq!(event.amount_kopeks, 50_000);
        assert_eq!(event.external_id, "pay-42");
    }

    #[test]
    fn pending_events_require_no_action() {
        let body = serde_json::json!({
            "event": "payment.waiting_for_capture",
            "object": {
                "id": "pay-43",
                "status": "waiting_for_capture",
                "amount": { "value": "500.00", "currency": "RUB" },
            },
        })
        .to_string();
        assert_eq!(adapter().parse(body.as_bytes()).unwrap(), None);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let a = adapter();
        assert!(a.verify(b"{}", Some("s3cret")).is_ok());
        assert!(matches!(
            a.verify(b"{}", Some("wrong")),
            Err(Error::InvalidSignature { provider: "yookassa" })
        ));
        assert!(a.verify(b"{}", None).is_err());
    }

    #[test]
    fn foreign_currency_is_rejected() {
        let body = serde_json::json!({
            "event": "payment.succeeded",
            "object": {
                "id": "pay-44",
                "status": "succeeded",
                "amount": { "value": "5.00", "currency": "USD" },
                "metadata": { "user_id": "7" },
            },
        })
        .to_string();
        assert!(adapter().parse(body.as_bytes()).is_err());
    }
}
