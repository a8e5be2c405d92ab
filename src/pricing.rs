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

//! The pricing engine.
//!
//! Deterministic and side-effect free: given a [`PriceRequest`] and the
//! configured [`Prices`], produces a line-itemized [`Quote`]. Callers are
//! the checkout orchestrator, the add-on and extension flows, and the
//! autopay runner.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::Prices;
use crate::error::Error;

/// Number of billable months in a period of `days` days.
///
/// Periods round to the nearest whole month and are never billed as less
/// than one (a 14-day period counts as one month of add-ons).
pub fn months_from_days(days: u32) -> u32 {
    ((f64::from(days) / 30.0).round() as u32).max(1)
}

/// Number of months left until `end_date`, used to prorate add-ons.
///
/// Already-expired subscriptions count as one month: adding to a lapsed
/// paid subscription charges the minimum, never zero.
pub fn remaining_months(end_date: OffsetDateTime, now: OffsetDateTime) -> u32 {
    if end_date <= now {
        return 1;
    }
    let days_left = (end_date - now).whole_days();
    ((days_left as f64 / 30.0).round() as u32).max(1)
}

/// Applies a percentage discount with integer arithmetic.
///
/// Returns `(discounted_amount, discount_value)`. When the discount is at
/// least one ruble and the discounted amount carries a kopek remainder,
/// the discounted amount is rounded up to the next whole ruble (clamped
/// to the original) so fractional kopeks never under-charge.
pub fn apply_percent_discount(amount: i64, percent: u8) -> (i64, i64) {
    if amount <= 0 || percent == 0 {
        return (amount, 0);
    }
    let percent = i64::from(percent.min(100));
    let mut discount = amount * percent / 100;
    let mut discounted = amount - discount;

    if discount >= 100 && discounted % 100 != 0 {
        discounted += 100 - discounted % 100;
        discounted = discounted.min(amount);
        discount = amount - discounted;
    }

    (discounted, discount)
}

/// Per-component percentage discounts from the user's promo group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discounts {
    /// Discount on the server component.
    pub server_percent: u8,
    /// Discount on the traffic component.
    pub traffic_percent: u8,
    /// Discount on the device component.
    pub device_percent: u8,
    /// Discount on the base period price, when the user's (default)
    /// promo group carries one for the requested period.
    pub period_percent: Option<u8>,
}

/// The monthly price of one selected server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPrice {
    /// The panel squad the server corresponds to.
    pub squad_uuid: Uuid,
    /// Monthly price in kopeks.
    pub monthly_price_kopeks: i64,
}

/// Inputs to a new-subscription (or extension) quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRequest {
    /// The purchased period, in days. Must be a configured period.
    pub period_days: u32,
    /// Selected traffic package in gigabytes; 0 is the unlimited package.
    pub traffic_gb: u32,
    /// Requested device limit, within `[1, max_devices_limit]`.
    pub device_limit: u32,
    /// The selected servers, in selection order.
    pub servers: Vec<ServerPrice>,
    /// The user's promo group discounts.
    pub discounts: Discounts,
}

/// One priced component of a quote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteComponent {
    /// Undiscounted monthly price.
    pub monthly_kopeks: i64,
    /// Monthly price after the component's percentage discount.
    pub discounted_monthly_kopeks: i64,
    /// The percentage applied.
    pub discount_percent: u8,
}

impl QuoteComponent {
    fn discounted(monthly_kopeks: i64, percent: u8) -> QuoteComponent {
        let (discounted_monthly_kopeks, _) = apply_percent_discount(monthly_kopeks, percent);
        QuoteComponent {
            monthly_kopeks,
            discounted_monthly_kopeks,
            discount_percent: percent,
        }
    }
}

/// A line-itemized order total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// The quoted period in days.
    pub period_days: u32,
    /// Billable months in the period.
    pub months: u32,
    /// Base period price after any period discount.
    pub base_kopeks: i64,
    /// The traffic component.
    pub traffic: QuoteComponent,
    /// The servers component (sum over all selected servers).
    pub servers: QuoteComponent,
    /// Per-server discounted monthly prices, in selection order. These
    /// become the `paid_price_kopeks` snapshots (monthly × months).
    pub per_server_monthly_kopeks: Vec<(Uuid, i64)>,
    /// The devices component.
    pub devices: QuoteComponent,
    /// The grand total.
    pub total_kopeks: i64,
}

impl Quote {
    /// Sum of the discounted monthly components.
    pub fn monthly_additions_kopeks(&self) -> i64 {
        self.traffic.discounted_monthly_kopeks
            + self.servers.discounted_monthly_kopeks
            + self.devices.discounted_monthly_kopeks
    }

    /// What the user is charged for one server over the whole period.
    pub fn server_paid_price(&self, squad_uuid: Uuid) -> Option<i64> {
        self.per_server_monthly_kopeks
            .iter()
            .find(|(uuid, _)| *uuid == squad_uuid)
            .map(|(_, monthly)| monthly * i64::from(self.months))
    }

    /// Re-derives the total from the line items and compares.
    ///
    /// A mismatch is a bug in the engine, not a user error.
    fn verify(&self) -> Result<(), Error> {
        let expected = self.base_kopeks + i64::from(self.months) * self.monthly_additions_kopeks();
        if expected != self.total_kopeks {
            return Err(Error::PricingInconsistent {
                expected_kopeks: expected,
                computed_kopeks: self.total_kopeks,
            });
        }
        Ok(())
    }
}

/// Quotes a new subscription (or an extension, which prices the current
/// configuration as if purchased anew).
pub fn quote_new(req: &PriceRequest, prices: &Prices) -> Result<Quote, Error> {
    let base = prices.period_price(req.period_days).ok_or_else(|| {
        Error::validation("period_days", format!("{} is not a configured period", req.period_days))
    })?;
    let traffic_monthly = prices.traffic_price(req.traffic_gb).ok_or_else(|| {
        Error::validation("traffic_gb", format!("{} GB is not a configured package", req.traffic_gb))
    })?;
    if req.device_limit < 1 || req.device_limit > prices.max_devices_limit {
        return Err(Error::validation(
            "device_limit",
            format!(
                "must be between 1 and {}, got {}",
                prices.max_devices_limit, req.device_limit
            ),
        ));
    }

    let months = months_from_days(req.period_days);
    let (base_kopeks, _) = match req.discounts.period_percent {
        Some(percent) => apply_percent_discount(base, percent),
        None => (base, 0),
    };

    let traffic = QuoteComponent::discounted(traffic_monthly, req.discounts.traffic_percent);
    let devices = QuoteComponent::discounted(
        prices.devices_monthly(req.device_limit),
        req.discounts.device_percent,
    );

    let mut per_server_monthly_kopeks = Vec::with_capacity(req.servers.len());
    let mut servers_monthly = 0;
    let mut servers_discounted_monthly = 0;
    for server in &req.servers {
        let (discounted, _) =
            apply_percent_discount(server.monthly_price_kopeks, req.discounts.server_percent);
        servers_monthly += server.monthly_price_kopeks;
        servers_discounted_monthly += discounted;
        per_server_monthly_kopeks.push((server.squad_uuid, discounted));
    }
    let servers = QuoteComponent {
        monthly_kopeks: servers_monthly,
        discounted_monthly_kopeks: servers_discounted_monthly,
        discount_percent: req.discounts.server_percent,
    };

    let monthly_additions = traffic.discounted_monthly_kopeks
        + servers.discounted_monthly_kopeks
        + devices.discounted_monthly_kopeks;
    let total_kopeks = base_kopeks + i64::from(months) * monthly_additions;

    let quote = Quote {
        period_days: req.period_days,
        months,
        base_kopeks,
        traffic,
        servers,
        per_server_monthly_kopeks,
        devices,
        total_kopeks,
    };
    quote.verify()?;
    Ok(quote)
}

/// A prorated add-on charge against a running subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonQuote {
    /// Months charged (remaining months, at least one).
    pub months: u32,
    /// Monthly delta after the component discount.
    pub discounted_monthly_kopeks: i64,
    /// Total charge.
    pub total_kopeks: i64,
}

/// Quotes an add-on: `monthly_delta` more per month, prorated over the
/// months left until `end_date`.
///
/// A non-positive delta quotes to zero: reducing a limit never refunds.
pub fn quote_addon(
    monthly_delta_kopeks: i64,
    discount_percent: u8,
    end_date: OffsetDateTime,
    now: OffsetDateTime,
) -> AddonQuote {
    let months = remaining_months(end_date, now);
    if monthly_delta_kopeks <= 0 {
        return AddonQuote {
            months,
            discounted_monthly_kopeks: 0,
            total_kopeks: 0,
        };
    }
    let (discounted_monthly_kopeks, _) =
        apply_percent_discount(monthly_delta_kopeks, discount_percent);
    AddonQuote {
        months,
        discounted_monthly_kopeks,
        total_kopeks: discounted_monthly_kopeks * i64::from(months),
    }
}

#[cfg(test)]
mod tests {
    use time::ext::NumericalDuration;

    use super::*;

    fn prices() -> Prices {
        Prices::default()
    }

    fn request(period_days: u32) -> PriceRequest {
        PriceRequest {
            period_days,
            traffic_gb: 100,
            device_limit: 1,
            servers: vec![ServerPrice {
                squad_uuid: Uuid::new_v4(),
                monthly_price_kopeks: 10_000,
            }],
            discounts: Discounts::default(),
        }
    }

    #[test]
    fn months_round_to_nearest_with_floor_of_one() {
        assert_eq!(months_from_days(14), 1);
        assert_eq!(months_from_days(30), 1);
        assert_eq!(months_from_days(60), 2);
        assert_eq!(months_from_days(90), 3);
        assert_eq!(months_from_days(180), 6);
        assert_eq!(months_from_days(360), 12);
    }

    #[test]
    fn expired_subscription_prorates_to_one_month() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(remaining_months(now - 5.days(), now), 1);
        assert_eq!(remaining_months(now + 20.days(), now), 1);
        assert_eq!(remaining_months(now + 50.days(), now), 2);
    }

    #[test]
    fn small_discounts_keep_kopek_precision() {
        // 2% of 2000 kopeks = 40 kopeks, below the one-ruble rounding
        // threshold: no upward rounding.
        assert_eq!(apply_percent_discount(2_000, 2), (1_960, 40));
    }

    #[test]
    fn large_discounts_round_up_to_whole_rubles() {
        // 15% of 10050 = 1507 (floored); 8543 is not a whole ruble, so it
        // rounds up to 8600 and the discount shrinks accordingly.
        assert_eq!(apply_percent_discount(10_050, 15), (8_600, 1_450));
    }

    #[test]
    fn rounding_never_exceeds_the_original_amount() {
        let (discounted, discount) = apply_percent_discount(199, 100);
        assert_eq!(discounted, 0);
        assert_eq!(discount, 199);
        for amount in [100, 150, 10_001, 99_999] {
            for percent in [1, 10, 25, 50, 99, 100] {
                let (discounted, discount) = apply_percent_discount(amount, percent);
                assert!(discounted <= amount);
                assert_eq!(discounted + discount, amount);
            }
        }
    }

    #[test]
    fn one_month_purchase_totals_exactly() {
        // 99000 base + 1 month × (15000 traffic + 10000 server + 0 devices).
        let quote = quote_new(&request(30), &prices()).unwrap();
        assert_eq!(quote.months, 1);
        assert_eq!(quote.base_kopeks, 99_000);
        assert_eq!(quote.total_kopeks, 124_000);
    }

    #[test]
    fn ninety_day_purchase_with_server_discount() {
        // 269000 base + 3 × discounted server 7500 = 291500.
        let mut req = request(90);
        req.traffic_gb = 0;
        req.servers[0].monthly_price_kopeks = 10_000;
        req.discounts.server_percent = 25;
        let mut prices = prices();
        prices.traffic_prices.insert(0, 0);
        let quote = quote_new(&req, &prices).unwrap();
        assert_eq!(quote.months, 3);
        assert_eq!(quote.servers.discounted_monthly_kopeks, 7_500);
        assert_eq!(quote.total_kopeks, 291_500);
    }

    #[test]
    fn quote_matches_its_own_breakdown() {
        let mut req = request(180);
        req.device_limit = 5;
        req.discounts = Discounts {
            server_percent: 10,
            traffic_percent: 20,
            device_percent: 30,
            period_percent: Some(5),
        };
        let quote = quote_new(&req, &prices()).unwrap();
        assert_eq!(
            quote.total_kopeks,
            quote.base_kopeks + i64::from(quote.months) * quote.monthly_additions_kopeks()
        );
    }

    #[test]
    fn unknown_period_is_a_validation_failure() {
        let err = quote_new(&request(45), &prices()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn device_limit_bounds_are_enforced() {
        let mut req = request(30);
        req.device_limit = 0;
        assert!(quote_new(&req, &prices()).is_err());
        req.device_limit = 21;
        assert!(quote_new(&req, &prices()).is_err());
        req.device_limit = 20;
        assert!(quote_new(&req, &prices()).is_ok());
    }

    #[test]
    fn addon_prorates_over_remaining_months() {
        let now = OffsetDateTime::now_utc();
        // 20 days left rounds to one month.
        let addon = quote_addon(10_000, 0, now + 20.days(), now);
        assert_eq!(addon.months, 1);
        assert_eq!(addon.total_kopeks, 10_000);
        // 80 days left rounds to three months.
        let addon = quote_addon(10_000, 0, now + 80.days(), now);
        assert_eq!(addon.months, 3);
        assert_eq!(addon.total_kopeks, 30_000);
    }

    #[test]
    fn reductions_never_refund() {
        let now = OffsetDateTime::now_utc();
        let addon = quote_addon(-5_000, 0, now + 40.days(), now);
        assert_eq!(addon.total_kopeks, 0);
    }

    #[test]
    fn per_server_snapshot_covers_the_whole_period() {
        let req = request(90);
        let squad = req.servers[0].squad_uuid;
        let quote = quote_new(&req, &prices()).unwrap();
        assert_eq!(quote.server_paid_price(squad), Some(30_000));
        assert_eq!(quote.server_paid_price(Uuid::new_v4()), None);
    }
}
