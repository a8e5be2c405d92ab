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

use sqlx::postgres::PgExecutor;
use sqlx::types::Json;

use crate::error::Error;
use crate::pricing::Discounts;

/// A named bucket of users carrying per-category percentage discounts.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PromoGroup {
    pub id: i64,
    pub name: String,
    /// Exactly one group is the default; users with no explicit group
    /// belong to it.
    pub is_default: bool,
    pub server_discount_percent: i16,
    pub traffic_discount_percent: i16,
    pub device_discount_percent: i16,
    /// Period-length discounts, keyed by period days. Only consulted for
    /// the default group.
    pub period_discounts: Json<BTreeMap<u32, u8>>,
}

impl PromoGroup {
    /// The discount set the pricing engine applies for a quote over
    /// `period_days`.
    pub fn discounts(&self, period_days: u32) -> Discounts {
        Discounts {
            server_percent: self.server_discount_percent.clamp(0, 100) as u8,
            traffic_percent: self.traffic_discount_percent.clamp(0, 100) as u8,
            device_percent: self.device_discount_percent.clamp(0, 100) as u8,
            period_percent: if self.is_default {
                self.period_discounts.get(&period_days).copied()
            } else {
                None
            },
        }
    }
}

pub async fn get(executor: impl PgExecutor<'_>, id: i64) -> Result<PromoGroup, Error> {
    let group = sqlx::query_as::<_, PromoGroup>("SELECT * FROM promo_groups WHERE id = $1")
        .bind(id)
        .fetch_one(executor)
        .await?;
    Ok(group)
}

pub async fn get_default(executor: impl PgExecutor<'_>) -> Result<PromoGroup, Error> {
    let group = sqlx::query_as::<_, PromoGroup>(
        "SELECT * FROM promo_groups WHERE is_default LIMIT 1",
    )
    .fetch_one(executor)
    .await?;
    Ok(group)
}

/// Resolves the group a user belongs to, falling back to the default.
pub async fn for_user(
    executor: impl PgExecutor<'_>,
    promo_group_id: Option<i64>,
) -> Result<PromoGroup, Error> {
    let group = sqlx::query_as::<_, PromoGroup>(
        "SELECT * FROM promo_groups
         WHERE id = $1 OR ($1 IS NULL AND is_default)
         ORDER BY is_default
         LIMIT 1",
    )
    .bind(promo_group_id)
    .fetch_one(executor)
    .await?;
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(is_default: bool) -> PromoGroup {
        PromoGroup {
            id: 1,
            name: "base".into(),
            is_default,
            server_discount_percent: 25,
            traffic_discount_percent: 10,
            device_discount_percent: 0,
            period_discounts: Json(BTreeMap::from([(90, 5), (180, 10)])),
        }
    }

    #[test]
    fn period_discounts_only_apply_to_the_default_group() {
        assert_eq!(group(true).discounts(90).period_percent, Some(5));
        assert_eq!(group(true).discounts(30).period_percent, None);
        assert_eq!(group(false).discounts(90).period_percent, None);
    }

    #[test]
    fn component_percents_are_clamped() {
        let mut g = group(false);
        g.server_discount_percent = 150;
        g.traffic_discount_percent = -5;
        let d = g.discounts(30);
        assert_eq!(d.server_percent, 100);
        assert_eq!(d.traffic_percent, 0);
    }
}
