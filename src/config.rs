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

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use time::{Time, UtcOffset};
use uuid::Uuid;

use crate::error::Error;

/// Default price of each purchasable period, in kopeks, keyed by period
/// length in days.
static DEFAULT_PERIOD_PRICES: Lazy<BTreeMap<u32, i64>> = Lazy::new(|| {
    BTreeMap::from([
        (14, 50_000),
        (30, 99_000),
        (60, 189_000),
        (90, 269_000),
        (180, 499_000),
        (360, 899_000),
    ])
});

/// Default monthly price of each traffic package, in kopeks, keyed by the
/// package size in gigabytes. The zero key is the unlimited package.
static DEFAULT_TRAFFIC_PRICES: Lazy<BTreeMap<u32, i64>> = Lazy::new(|| {
    BTreeMap::from([
        (5, 2_000),
        (10, 3_500),
        (25, 7_000),
        (50, 11_000),
        (100, 15_000),
        (250, 17_000),
        (500, 19_000),
        (1000, 19_500),
        (0, 20_000),
    ])
});

/// The price tables the pricing engine computes quotes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prices {
    /// Base price per purchasable period, keyed by period length in days.
    pub period_prices: BTreeMap<u32, i64>,
    /// Monthly price per traffic package, keyed by gigabytes (0 = unlimited).
    pub traffic_prices: BTreeMap<u32, i64>,
    /// Monthly price of each device slot beyond the default limit.
    pub price_per_device: i64,
    /// Number of device slots included in the base price.
    pub default_device_limit: u32,
    /// Hard ceiling on the per-subscription device limit.
    pub max_devices_limit: u32,
}

impl Default for Prices {
    fn default() -> Prices {
        Prices {
            period_prices: DEFAULT_PERIOD_PRICES.clone(),
            traffic_prices: DEFAULT_TRAFFIC_PRICES.clone(),
            price_per_device: 5_000,
            default_device_limit: 1,
            max_devices_limit: 20,
        }
    }
}

impl Prices {
    /// Looks up the base price for `period_days`.
    pub fn period_price(&self, period_days: u32) -> Option<i64> {
        self.period_prices.get(&period_days).copied()
    }

    /// Looks up the monthly price of the traffic package `traffic_gb`
    /// (0 = unlimited).
    pub fn traffic_price(&self, traffic_gb: u32) -> Option<i64> {
        self.traffic_prices.get(&traffic_gb).copied()
    }

    /// Monthly price of `device_limit` devices above the included default.
    pub fn devices_monthly(&self, device_limit: u32) -> i64 {
        i64::from(device_limit.saturating_sub(self.default_device_limit)) * self.price_per_device
    }
}

/// Trial subscription parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialSettings {
    /// How long a trial lasts.
    pub duration_days: u32,
    /// Traffic cap for trials, in gigabytes.
    pub traffic_limit_gb: u32,
    /// Device cap for trials.
    pub device_limit: u32,
    /// The single squad trial users are connected to.
    pub squad_uuid: Uuid,
    /// Hours after expiry before the cleanup task may notify and delete.
    pub cleanup_after_hours: u32,
    /// Whether the cleanup task also deletes the remote user from the panel.
    pub delete_from_panel: bool,
}

/// Credentials for the basic-credential payment provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YookassaSettings {
    pub shop_id: String,
    pub secret_key: String,
}

/// Credentials for the digest-sign payment provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulenpaySettings {
    pub shop_id: String,
    pub secret_key: String,
}

/// Signing key for the HMAC-over-body payment provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WataSettings {
    pub signing_key: String,
}

/// Credentials for the tax service fiscal receipts are submitted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalogoSettings {
    pub base_url: String,
    pub api_token: String,
}

/// Immutable broker configuration, injected once at boot.
///
/// A settings change requires a restart; nothing in the broker re-reads
/// configuration after construction.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Price tables for the pricing engine.
    pub prices: Prices,
    /// Trial parameters.
    pub trial: TrialSettings,
    /// Periods offered in the checkout wizard, in days.
    pub available_periods: Vec<u32>,
    /// Periods offered for extension, in days.
    pub renewal_periods: Vec<u32>,

    /// Days-before-expiry buckets that trigger a renewal reminder.
    pub autopay_warning_days: Vec<u32>,
    /// Default `autopay_days_before` for new subscriptions.
    pub default_autopay_days_before: u32,
    /// Additional reminder sent this many hours before expiry.
    pub expiry_warning_hours: u32,

    /// Cadence of the expiry notifier.
    pub expiry_check_interval: Duration,
    /// Cadence of the autopay runner.
    pub autopay_check_interval: Duration,
    /// Cadence of the trial cleanup task.
    pub trial_cleanup_interval: Duration,
    /// Cadence of the receipt queue drainer.
    pub receipt_drain_interval: Duration,
    /// Cadence of the maintenance flag watcher.
    pub maintenance_poll_interval: Duration,

    /// Local wall-clock time at which the daily report is sent.
    pub report_time: Time,
    /// UTC offset the report and log-rotation times are interpreted in.
    pub local_offset: UtcOffset,

    /// Directory holding `current/` per-level logs and `archive/` tarballs.
    pub log_dir: PathBuf,
    /// Local wall-clock time of the daily log rotation.
    pub log_rotation_time: Time,
    /// Archives older than this many days are pruned.
    pub log_keep_days: u32,

    /// Whether successful deposits enqueue a fiscal receipt.
    pub receipts_enabled: bool,
    /// Hard cap on submission attempts per queued receipt.
    pub receipt_max_attempts: u32,
    /// Queued receipts older than this are dropped with an admin alert.
    pub receipt_retention: Duration,
    /// Pause between individual receipt submissions within one drain pass.
    pub receipt_submit_delay: Duration,

    /// Checkout drafts older than this are dropped.
    pub draft_ttl: Duration,

    /// Provider credentials; `None` disables the provider's adapter.
    pub yookassa: Option<YookassaSettings>,
    pub mulenpay: Option<MulenpaySettings>,
    pub wata: Option<WataSettings>,
    /// Tax service credentials; required when receipts are enabled.
    pub nalogo: Option<NalogoSettings>,
}

impl Settings {
    /// Settings with the documented default price tables and cadences.
    ///
    /// Embedders override individual fields after construction; tests use
    /// this directly.
    pub fn with_trial_squad(squad_uuid: Uuid) -> Settings {
        Settings {
            prices: Prices::default(),
            trial: TrialSettings {
                duration_days: 3,
                traffic_limit_gb: 10,
                device_limit: 2,
                squad_uuid,
                cleanup_after_hours: 2,
                delete_from_panel: false,
            },
            available_periods: vec![14, 30, 60, 90, 180, 360],
            renewal_periods: vec![30, 90, 180],
            autopay_warning_days: vec![3, 1],
            default_autopay_days_before: 3,
            expiry_warning_hours: 2,
            expiry_check_interval: Duration::from_secs(10 * 60),
            autopay_check_interval: Duration::from_secs(60 * 60),
            trial_cleanup_interval: Duration::from_secs(30 * 60),
            receipt_drain_interval: Duration::from_secs(5 * 60),
            maintenance_poll_interval: Duration::from_secs(60),
            report_time: Time::from_hms(10, 0, 0).expect("valid time"),
            local_offset: UtcOffset::from_hms(3, 0, 0).expect("valid offset"),
            log_dir: PathBuf::from("logs"),
            log_rotation_time: Time::MIDNIGHT,
            log_keep_days: 14,
            receipts_enabled: false,
            receipt_max_attempts: 10,
            receipt_retention: Duration::from_secs(7 * 24 * 60 * 60),
            receipt_submit_delay: Duration::from_secs(3),
            draft_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            yookassa: None,
            mulenpay: None,
            wata: None,
            nalogo: None,
        }
    }

    /// Validates cross-field consistency.
    ///
    /// Every offered period must carry a price, renewal periods must be a
    /// subset of the offered set, and the autopay window must stay inside
    /// the 1..=14 day range the data model allows.
    pub fn validate(&self) -> Result<(), Error> {
        for period in &self.available_periods {
            if self.prices.period_price(*period).is_none() {
                return Err(Error::validation(
                    "available_periods",
                    format!("period {period} has no configured price"),
                ));
            }
        }
        for period in &self.renewal_periods {
            if !self.available_periods.contains(period) {
                return Err(Error::validation(
                    "renewal_periods",
                    format!("renewal period {period} is not an available period"),
                ));
            }
        }
        if !(1..=14).contains(&self.default_autopay_days_before) {
            return Err(Error::validation(
                "default_autopay_days_before",
                "must be between 1 and 14 days",
            ));
        }
        if self.receipts_enabled && self.nalogo.is_none() {
            return Err(Error::validation(
                "receipts_enabled",
                "fiscal receipts require tax service credentials",
            ));
        }
        if self.prices.default_device_limit < 1
            || self.prices.max_devices_limit < self.prices.default_device_limit
        {
            return Err(Error::validation(
                "device_limits",
                "default device limit must be >= 1 and <= the maximum",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::with_trial_squad(Uuid::new_v4())
    }

    #[test]
    fn default_settings_validate() {
        settings().validate().unwrap();
    }

    #[test]
    fn unpriced_period_is_rejected() {
        let mut s = settings();
        s.available_periods.push(45);
        assert!(s.validate().is_err());
    }

    #[test]
    fn renewal_periods_must_be_offered() {
        let mut s = settings();
        s.renewal_periods = vec![30, 45];
        assert!(s.validate().is_err());
    }

    #[test]
    fn devices_monthly_ignores_included_slots() {
        let prices = Prices::default();
        assert_eq!(prices.devices_monthly(1), 0);
        assert_eq!(prices.devices_monthly(3), 10_000);
        assert_eq!(prices.devices_monthly(0), 0);
    }
}
