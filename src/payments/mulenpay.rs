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

//! The digest-sign provider adapter (MulenPay-class).
//!
//! Webhooks carry a `sign` field: the hex SHA-256 of
//! `currency + amount + shop_id + secret_key`.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::MulenpaySettings;
use crate::error::Error;
use crate::payments::{rubles_to_kopeks, ProviderAdapter, TopupEvent};

#[derive(Debug, Deserialize)]
struct Webhook {
    id: u64,
    amount: String,
    currency: String,
    status: String,
    sign: String,
    #[serde(default)]
    description: Option<String>,
    /// The broker user ID the payment intent was created for.
    user_id: i64,
}

pub struct MulenpayAdapter {
    settings: MulenpaySettings,
}

impl MulenpayAdapter {
    pub fn new(settings: MulenpaySettings) -> MulenpayAdapter {
        MulenpayAdapter { settings }
    }

    fn expected_sign(&self, currency: &str, amount: &str) -> String {
        let raw = format!(
            "{currency}{amount}{}{}",
            self.settings.shop_id, self.settings.secret_key
        );
        hex::encode(Sha256::digest(raw.as_bytes()))
    }
}

impl ProviderAdapter for MulenpayAdapter {
    fn name(&self) -> &'static str {
        "mulenpay"
    }

    fn verify(&self, raw_body: &[u8], _signature: Option<&str>) -> Result<(), Error> {
        // The signature travels inside the payload, derived from the
        // amount fields, so a tampered amount invalidates it.
        let webhook: Webhook = serde_json::from_slice(raw_body)
            .map_err(|_| Error::InvalidSignature { provider: "mulenpay" })?;
        let expected = self.expected_sign(&webhook.currency, &webhook.amount);
        let expected = Sha256::digest(expected.as_bytes());
        let got = Sha256::digest(webhook.sign.to_lowercase().as_bytes());
        if expected != got {
            return Err(Error::InvalidSignature { provider: "mulenpay" });
        }
        Ok(())
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Option<TopupEvent>, Error> {
        let webhook: Webhook = serde_json::from_slice(raw_body)?;
        if webhook.status != "paid" {
            return Ok(None);
        }
        if webhook.currency != "RUB" {
            return Err(Error::validation(
                "currency",
                format!("unsupported currency {}", webhook.currency),
            ));
        }
        Ok(Some(TopupEvent {
            user_id: webhook.user_id,
            amount_kopeks: rubles_to_kopeks(&webhook.amount)?,
            external_id: webhook.id.to_string(),
            client_info: None,
            metadata: serde_json::json!({
                "shop_id": self.settings.shop_id,
                "description": webhook.description,
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> MulenpayAdapter {
        MulenpayAdapter::new(MulenpaySettings {
            shop_id: "shop".into(),
            secret_key: "secret".into(),
        })
    }

    fn signed_body(status: &str) -> Vec<u8> {
        let a = adapter();
        serde_json::json!({
            "id": 99,
            "amount": "250.00",
            "currency": "RUB",
            "status": status,
            "sign": a.expected_sign("RUB", "250.00"),
            "user_id": 5,
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_sign_verifies_and_parses() {
        let a = adapter();
        let body = signed_body("paid");
        a.verify(&body, None).unwrap();
        let event = a.parse(&body).unwrap().unwrap();
        assert_eq!(event.external_id, "99");
        assert_eq!(event.amount_kopeks, 25_000);
        assert_eq!(event.user_id, 5);
    }

    #[test]
    fn tampered_amount_breaks_the_sign() {
        let a = adapter();
        let mut body = String::from_utf8(signed_body("paid")).unwrap();
        body = body.replace("250.00", "2.00");
        assert!(matches!(
            a.verify(body.as_bytes(), None),
            Err(Error::InvalidSignature { provider: "mulenpay" })
        ));
    }

    #[test]
    fn non_paid_statuses_are_ignored() {
        let a = adapter();
        let body = signed_body("pending");
        a.verify(&body, None).unwrap();
        assert_eq!(a.parse(&body).unwrap(), None);
    }
}
