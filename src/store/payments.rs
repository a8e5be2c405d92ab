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

//! Provider-specific payment intents.
//!
//! One row per payment attempt, created when the provider hands back a
//! payment link and joined to its [`crate::store::transactions::Transaction`]
//! when the webhook completes it. The ledger, not this table, is what
//! enforces exactly-once crediting.

use sqlx::postgres::PgExecutor;
use time::OffsetDateTime;

use crate::error::Error;

/// The lifecycle of a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

/// A payment attempt at one provider.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub provider: String,
    /// The provider-assigned payment ID, once known.
    pub external_id: Option<String>,
    pub amount_kopeks: i64,
    pub status: PaymentStatus,
    /// Where the user was sent to pay.
    pub payment_url: Option<String>,
    /// The completed deposit, once the webhook lands.
    pub transaction_id: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Records a new pending intent.
pub async fn create_intent(
    executor: impl PgExecutor<'_>,
    user_id: i64,
    provider: &str,
    amount_kopeks: i64,
    external_id: Option<&str>,
    payment_url: Option<&str>,
) -> Result<Payment, Error> {
    let payment = sqlx::query_as::<_, Payment>(
        "INSERT INTO payments (user_id, provider, amount_kopeks, external_id, payment_url)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING *",
    )
    .bind(user_id)
    .bind(provider)
    .bind(amount_kopeks)
    .bind(external_id)
    .bind(payment_url)
    .fetch_one(executor)
    .await?;
    Ok(payment)
}

/// Joins a completed webhook to its intent, when one exists.
///
/// Webhooks may arrive for intents created outside the broker (or before
/// a crash persisted one); affecting zero rows is not an error.
pub async fn mark_completed(
    executor: impl PgExecutor<'_>,
    provider: &str,
    external_id: &str,
    transaction_id: i64,
) -> Result<bool, Error> {
    let result = sqlx::query(
        "UPDATE payments
         SET status = 'completed', transaction_id = $3, updated_at = now()
         WHERE provider = $1 AND external_id = $2 AND status = 'pending'",
    )
    .bind(provider)
    .bind(external_id)
    .bind(transaction_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_failed(
    executor: impl PgExecutor<'_>,
    provider: &str,
    external_id: &str,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE payments
         SET status = 'failed', updated_at = now()
         WHERE provider = $1 AND external_id = $2 AND status = 'pending'",
    )
    .bind(provider)
    .bind(external_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_by_external_id(
    executor: impl PgExecutor<'_>,
    provider: &str,
    external_id: &str,
) -> Result<Option<Payment>, Error> {
    let payment = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE provider = $1 AND external_id = $2",
    )
    .bind(provider)
    .bind(external_id)
    .fetch_optional(executor)
    .await?;
    Ok(payment)
}

pub async fn list_pending_for_user(
    executor: impl PgExecutor<'_>,
    user_id: i64,
) -> Result<Vec<Payment>, Error> {
    let payments = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments
         WHERE user_id = $1 AND status = 'pending'
         ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(executor)
    .await?;
    Ok(payments)
}
