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

//! A typed client for the upstream VPN control panel.
//!
//! The panel is authoritative for remote user identity, device inventory,
//! traffic counters, and subscription URLs. This module exposes intent
//! operations, not raw HTTP calls; transport failures and 5xx responses
//! are retried with backoff inside the client, 4xx responses surface as
//! typed errors.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{ApiError, Error};

pub mod squads;
pub mod users;

/// Configuration for a [`PanelClient`].
pub struct PanelConfig {
    /// Base URL of the panel, e.g. `https://panel.example.com`.
    pub api_url: String,
    /// Bearer token for the panel API.
    pub api_token: String,
}

/// Optional parameters for a [`PanelClient`].
#[derive(Debug, Clone)]
pub struct PanelClientBuilder {
    request_timeout: Duration,
    max_retries: usize,
    retry_base_delay: Duration,
}

impl Default for PanelClientBuilder {
    fn default() -> PanelClientBuilder {
        PanelClientBuilder {
            request_timeout: Duration::from_secs(15),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(250),
        }
    }
}

impl PanelClientBuilder {
    /// Sets the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how many times transport failures and 5xx responses are
    /// retried before the error is surfaced.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Creates a [`PanelClient`] that incorporates the optional parameters.
    pub fn build(self, config: PanelConfig) -> PanelClient {
        let inner = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .expect("reqwest client construction is infallible with these options");
        PanelClient {
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            api_token: config.api_token,
            inner,
            max_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
        }
    }
}

/// The panel responds with payloads wrapped in a `response` envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: T,
}

/// An async client for the panel API.
#[derive(Clone)]
pub struct PanelClient {
    api_url: String,
    api_token: String,
    inner: reqwest::Client,
    max_retries: usize,
    retry_base_delay: Duration,
}

impl std::fmt::Debug for PanelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The bearer token stays out of logs.
        f.debug_struct("PanelClient")
            .field("api_url", &self.api_url)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl PanelClient {
    /// Creates a new client with the default optional parameters.
    pub fn new(config: PanelConfig) -> PanelClient {
        PanelClientBuilder::default().build(config)
    }

    pub(crate) fn build_request<'a, P>(&self, method: Method, path: P) -> RequestBuilder
    where
        P: IntoIterator<Item = &'a str>,
    {
        let mut url = self.api_url.clone();
        for part in path {
            url.push('/');
            url.push_str(part);
        }
        self.inner.request(method, url).bearer_auth(&self.api_token)
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.retry_base_delay.as_millis() as u64)
            .factor(2)
            .map(jitter)
            .take(self.max_retries)
    }

    async fn execute(req: &RequestBuilder) -> Result<reqwest::Response, Error> {
        let req = req.try_clone().ok_or_else(|| Error::Internal(
            "panel request body is not clonable for retries".into(),
        ))?;
        let res = req.send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let message = res.text().await.unwrap_or_default();
        Err(Error::Api(ApiError {
            status_code: status,
            message: truncate(&message, 200),
        }))
    }

    fn retryable(e: &Error) -> bool {
        match e {
            Error::Transport(_) => true,
            Error::Api(api) => api.status_code.is_server_error(),
            _ => false,
        }
    }

    /// Sends a request and decodes the enveloped response body.
    pub(crate) async fn send_request<T>(&self, req: RequestBuilder) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let res = RetryIf::spawn(self.backoff(), || Self::execute(&req), Self::retryable).await?;
        let envelope: Envelope<T> = res.json().await?;
        Ok(envelope.response)
    }

    /// Sends a request, discarding any response body.
    pub(crate) async fn send_request_empty(&self, req: RequestBuilder) -> Result<(), Error> {
        RetryIf::spawn(self.backoff(), || Self::execute(&req), Self::retryable).await?;
        Ok(())
    }

    /// Like [`Self::send_request`], but maps 404 to `None`.
    pub(crate) async fn send_request_optional<T>(
        &self,
        req: RequestBuilder,
    ) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
    {
        match self.send_request(req).await {
            Ok(value) => Ok(Some(value)),
            Err(Error::Api(api)) if api.status_code == StatusCode::NOT_FOUND => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Probes the panel's health endpoint.
    ///
    /// The maintenance watcher polls this; any error means unhealthy.
    pub async fn health(&self) -> Result<PanelHealth, Error> {
        let req = self.build_request(Method::GET, ["api", "system", "health"]);
        self.send_request(req).await
    }
}

/// The panel's health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelHealth {
    /// Whether the panel considers itself operational.
    pub healthy: bool,
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_covers_transport_and_server_errors() {
        let server = Error::Api(ApiError {
            status_code: StatusCode::BAD_GATEWAY,
            message: String::new(),
        });
        let client = Error::Api(ApiError {
            status_code: StatusCode::CONFLICT,
            message: String::new(),
        });
        assert!(PanelClient::retryable(&server));
        assert!(!PanelClient::retryable(&client));
        assert!(!PanelClient::retryable(&Error::TrialAlreadyUsed));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // Multi-byte characters are never split.
        assert_eq!(truncate("ошибка", 3), "о");
    }
}
