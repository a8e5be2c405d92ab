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

//! The HMAC provider adapter (Wata-class).
//!
//! Deliveries carry an `X-Signature` header: the hex HMAC-SHA256 of the
//! raw request body under the provider signing key.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::config::WataSettings;
use crate::error::Error;
use crate::payments::{rubles_to_kopeks, ProviderAdapter, TopupEvent};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Webhook {
    transaction_id: String,
    transaction_status: String,
    amount: String,
    currency: String,
    /// The broker user ID, round-tripped through the payment link.
    order_id: String,
}

pub struct WataAdapter {
    settings: WataSettings,
}

impl WataAdapter {
    pub fn new(settings: WataSettings) -> WataAdapter {
        WataAdapter { settings }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(self.settings.signing_key.as_bytes())
            .expect("HMAC accepts keys of any length")
    }

    #[cfg(test)]
    fn sign(&self, raw_body: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(raw_body);
        hex::encode(mac.finalize().into_bytes())
    }
}

impl ProviderAdapter for WataAdapter {
    fn name(&self) -> &'static str {
        "wata"
    }

    fn verify(&self, raw_body: &[u8], signature: Option<&str>) -> Result<(), Error> {
        let presented = signature.ok_or(Error::InvalidSignature { provider: "wata" })?;
        let presented =
            hex::decode(presented).map_err(|_| Error::InvalidSignature { provider: "wata" })?;
        let mut mac = self.mac();
        mac.update(raw_body);
        mac.verify_slice(&presented)
            .map_err(|_| Error::InvalidSignature { provider: "wata" })
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Option<TopupEvent>, Error> {
        let webhook: Webhook = serde_json::from_slice(raw_body)?;
        if webhook.transaction_status != "Paid" {
            return Ok(None);
        }
        if webhook.currency != "RUB" {
            return Err(Error::validation(
                "currency",
                format!("unsupported currency {}", webhook.currency),
            ));
        }
        let user_id: i64 = webhook
            .order_id
            .parse()
            .map_err(|_| Error::validation("orderId", "not a broker user id"))?;
        Ok(Some(TopupEvent {
            user_id,
            amount_kopeks: rubles_to_kopeks(&webhook.amount)?,
            external_id: webhook.transaction_id,
            client_info: None,
            metadata: serde_json::json!({}),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> WataAdapter {
        WataAdapter::new(WataSettings {
            signing_key: "k".repeat(32),
        })
    }

    fn body() -> Vec<u8> {
        serde_json::json!({
            "transactionId": "w-7",
            "transactionStatus": "Paid",
            "amount": "100.00",
            "currency": "RUB",
            "orderId": "3",
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn signed_body_verifies() {
        let a = adapter();
        let body = body();
        let sig = a.sign(&body);
        a.verify(&body, Some(&sig)).unwrap();
        let event = a.parse(&body).unwrap().unwrap();
        assert_eq!(event.user_id, 3);
        assert_eq!(event.amount_kopeks, 10_000);
        assert_eq!(event.external_id, "w-7");
    }

    #[test]
    fn modified_body_fails_verification() {
        let a = adapter();
        let body = body();
        let sig = a.sign(&body);
        let tampered = String::from_utf8(body).unwrap().replace("100.00", "1.00");
        assert!(a.verify(tampered.as_bytes(), Some(&sig)).is_err());
    }

    #[test]
    fn missing_or_malformed_signature_fails() {
        let a = adapter();
        assert!(a.verify(&body(), None).is_err());
        assert!(a.verify(&body(), Some("zz-not-hex")).is_err());
    }
}
