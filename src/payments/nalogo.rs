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

//! The tax service client fiscal receipts are submitted to.

use std::time::Duration;

use serde::Serialize;

use crate::config::NalogoSettings;
use crate::error::{ApiError, Error};
use crate::sched::receipts::SubmitReceipt;
use crate::store::receipts::FiscalReceipt;

#[derive(Debug, Serialize)]
struct IncomeRequest<'a> {
    name: &'a str,
    /// Decimal rubles, the format the tax service expects.
    amount: String,
    quantity: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<&'a str>,
}

/// Registers income receipts with the tax service.
#[derive(Debug, Clone)]
pub struct NalogoClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl NalogoClient {
    pub fn new(settings: NalogoSettings) -> NalogoClient {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client construction is infallible with these options");
        NalogoClient {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
            api_token: settings.api_token,
        }
    }
}

impl SubmitReceipt for NalogoClient {
    async fn submit(&self, receipt: &FiscalReceipt) -> Result<(), Error> {
        let body = IncomeRequest {
            name: &receipt.name,
            amount: format!(
                "{}.{:02}",
                receipt.amount_kopeks / 100,
                receipt.amount_kopeks % 100
            ),
            quantity: receipt.quantity,
            client: receipt.client_info.as_deref(),
        };
        let res = self
            .http
            .post(format!("{}/income", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let message = res.text().await.unwrap_or_default();
        Err(Error::Api(ApiError {
            status_code: status,
            message,
        }))
    }
}
