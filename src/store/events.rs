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

//! The append-only lifecycle event log, consumed by reports and audits.

use sqlx::postgres::PgExecutor;
use sqlx::types::Json;
use time::OffsetDateTime;

use crate::error::Error;

/// The closed set of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum EventType {
    TrialActivated,
    TrialExpired,
    SubscriptionPurchased,
    SubscriptionExtended,
    SubscriptionExpired,
    TrafficAdded,
    TrafficSwitched,
    TrafficReset,
    DevicesChanged,
    ServersAdded,
    ServersRemoved,
    ModemToggled,
    AutopayToggled,
    AutopayCharged,
    AutopayFailed,
    PaymentReceived,
    BalanceRefunded,
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SubscriptionEvent {
    pub id: i64,
    pub event_type: EventType,
    pub user_id: i64,
    pub subscription_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub amount_kopeks: Option<i64>,
    pub occurred_at: OffsetDateTime,
    pub extra: Json<serde_json::Value>,
}

/// Appends an event. This table only ever sees INSERTs.
pub async fn append(
    executor: impl PgExecutor<'_>,
    event_type: EventType,
    user_id: i64,
    subscription_id: Option<i64>,
    transaction_id: Option<i64>,
    amount_kopeks: Option<i64>,
    extra: serde_json::Value,
) -> Result<SubscriptionEvent, Error> {
    let event = sqlx::query_as::<_, SubscriptionEvent>(
        "INSERT INTO subscription_events
             (event_type, user_id, subscription_id, transaction_id, amount_kopeks, extra)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING *",
    )
    .bind(event_type)
    .bind(user_id)
    .bind(subscription_id)
    .bind(transaction_id)
    .bind(amount_kopeks)
    .bind(Json(extra))
    .fetch_one(executor)
    .await?;
    Ok(event)
}

pub async fn list_for_user(
    executor: impl PgExecutor<'_>,
    user_id: i64,
    limit: i64,
) -> Result<Vec<SubscriptionEvent>, Error> {
    let events = sqlx::query_as::<_, SubscriptionEvent>(
        "SELECT * FROM subscription_events
         WHERE user_id = $1
         ORDER BY occurred_at DESC
         LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(events)
}

pub async fn count_since(
    executor: impl PgExecutor<'_>,
    event_type: EventType,
    since: OffsetDateTime,
    until: OffsetDateTime,
) -> Result<i64, Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM subscription_events
         WHERE event_type = $1 AND occurred_at >= $2 AND occurred_at < $3",
    )
    .bind(event_type)
    .bind(since)
    .bind(until)
    .fetch_one(executor)
    .await?;
    Ok(count)
}
