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

use sqlx::postgres::PgExecutor;
use sqlx::types::Json;
use time::OffsetDateTime;

use crate::error::Error;

/// The kind of a ledger entry. Amounts are unsigned; the sign is implicit
/// in the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    SubscriptionPayment,
    ReferralBonus,
    PromocodeBonus,
    Refund,
}

/// An immutable ledger entry. Completed rows are never updated.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub tx_type: TransactionType,
    pub amount_kopeks: i64,
    pub is_completed: bool,
    /// Payment provider for deposits; `None` for internal entries.
    pub provider: Option<String>,
    /// Provider-assigned payment ID. `(provider, external_id)` is unique
    /// over completed rows, which is what makes money-in exactly-once.
    pub external_id: Option<String>,
    pub description: String,
    /// Structured parameters next to the human string, for reports.
    pub metadata: Json<serde_json::Value>,
    pub created_at: OffsetDateTime,
}

/// Inserts an internal (provider-less) completed entry.
pub async fn insert(
    executor: impl PgExecutor<'_>,
    user_id: i64,
    tx_type: TransactionType,
    amount_kopeks: i64,
    description: &str,
    metadata: serde_json::Value,
) -> Result<Transaction, Error> {
    let tx = sqlx::query_as::<_, Transaction>(
        "INSERT INTO transactions
             (user_id, tx_type, amount_kopeks, is_completed, description, metadata)
         VALUES ($1, $2, $3, TRUE, $4, $5)
         RETURNING *",
    )
    .bind(user_id)
    .bind(tx_type)
    .bind(amount_kopeks)
    .bind(description)
    .bind(Json(metadata))
    .fetch_one(executor)
    .await?;
    Ok(tx)
}

/// Looks up a completed deposit by its dedupe key.
pub async fn find_completed_deposit(
    executor: impl PgExecutor<'_>,
    provider: &str,
    external_id: &str,
) -> Result<Option<Transaction>, Error> {
    let tx = sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions
         WHERE tx_type = 'deposit' AND is_completed
           AND provider = $1 AND external_id = $2",
    )
    .bind(provider)
    .bind(external_id)
    .fetch_optional(executor)
    .await?;
    Ok(tx)
}

/// Records an external deposit and credits the balance, exactly once.
///
/// The insert races through the partial unique index on
/// `(provider, external_id)`; when another webhook delivery won the race
/// (or already did long ago) this returns [`Error::DuplicatePayment`]
/// without touching the balance. Must run inside the caller's
/// transaction so the ledger row and the balance move together.
pub async fn record_deposit(
    conn: &mut sqlx::PgConnection,
    user_id: i64,
    amount_kopeks: i64,
    provider: &str,
    external_id: &str,
    description: &str,
    metadata: serde_json::Value,
) -> Result<Transaction, Error> {
    let inserted = sqlx::query_as::<_, Transaction>(
        "INSERT INTO transactions
             (user_id, tx_type, amount_kopeks, is_completed, provider, external_id,
              description, metadata)
         VALUES ($1, 'deposit', $2, TRUE, $3, $4, $5, $6)
         ON CONFLICT (provider, external_id) WHERE is_completed
         DO NOTHING
         RETURNING *",
    )
    .bind(user_id)
    .bind(amount_kopeks)
    .bind(provider)
    .bind(external_id)
    .bind(description)
    .bind(Json(metadata))
    .fetch_optional(&mut *conn)
    .await?;

    let tx = match inserted {
        Some(tx) => tx,
        None => {
            return Err(Error::DuplicatePayment {
                external_id: external_id.to_owned(),
            })
        }
    };

    sqlx::query(
        "UPDATE users
         SET balance_kopeks = balance_kopeks + $2, updated_at = now()
         WHERE id = $1",
    )
    .bind(user_id)
    .bind(amount_kopeks)
    .execute(&mut *conn)
    .await?;

    Ok(tx)
}

pub async fn list_for_user(
    executor: impl PgExecutor<'_>,
    user_id: i64,
    limit: i64,
) -> Result<Vec<Transaction>, Error> {
    let txs = sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions
         WHERE user_id = $1
         ORDER BY created_at DESC
         LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(txs)
}

/// Deposit count and sum over a period, for the report dispatcher.
pub async fn deposits_summary(
    executor: impl PgExecutor<'_>,
    since: OffsetDateTime,
    until: OffsetDateTime,
) -> Result<(i64, i64), Error> {
    let row: (i64, Option<i64>) = sqlx::query_as(
        "SELECT count(*), sum(amount_kopeks)
         FROM transactions
         WHERE tx_type = 'deposit' AND is_completed
           AND created_at >= $1 AND created_at < $2",
    )
    .bind(since)
    .bind(until)
    .fetch_one(executor)
    .await?;
    Ok((row.0, row.1.unwrap_or(0)))
}
