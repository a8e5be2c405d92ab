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

//! The durable fiscal receipt queue.
//!
//! Successful deposits enqueue a receipt for out-of-band submission to
//! the tax service; the drainer task pops items FIFO and keeps failed
//! ones with an attempt counter under a hard cap.

use sqlx::postgres::PgExecutor;
use time::OffsetDateTime;

use crate::error::Error;

/// One queued fiscal receipt.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FiscalReceipt {
    pub id: i64,
    /// The deposit transaction this receipt fiscalizes.
    pub payment_id: i64,
    /// Service name printed on the receipt.
    pub name: String,
    pub amount_kopeks: i64,
    pub quantity: i32,
    /// Optional customer identification for the tax service.
    pub client_info: Option<String>,
    pub attempts: i32,
    pub created_at: OffsetDateTime,
    pub last_attempt_at: Option<OffsetDateTime>,
}

pub async fn enqueue(
    executor: impl PgExecutor<'_>,
    payment_id: i64,
    name: &str,
    amount_kopeks: i64,
    quantity: i32,
    client_info: Option<&str>,
) -> Result<FiscalReceipt, Error> {
    let receipt = sqlx::query_as::<_, FiscalReceipt>(
        "INSERT INTO receipt_queue (payment_id, name, amount_kopeks, quantity, client_info)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING *",
    )
    .bind(payment_id)
    .bind(name)
    .bind(amount_kopeks)
    .bind(quantity)
    .bind(client_info)
    .fetch_one(executor)
    .await?;
    Ok(receipt)
}

/// The oldest queued receipts, FIFO.
pub async fn next_batch(
    executor: impl PgExecutor<'_>,
    limit: i64,
) -> Result<Vec<FiscalReceipt>, Error> {
    let receipts = sqlx::query_as::<_, FiscalReceipt>(
        "SELECT * FROM receipt_queue ORDER BY id LIMIT $1",
    )
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(receipts)
}

pub async fn remove(executor: impl PgExecutor<'_>, id: i64) -> Result<(), Error> {
    sqlx::query("DELETE FROM receipt_queue WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn bump_attempts(executor: impl PgExecutor<'_>, id: i64) -> Result<i32, Error> {
    let attempts: i32 = sqlx::query_scalar(
        "UPDATE receipt_queue
         SET attempts = attempts + 1, last_attempt_at = now()
         WHERE id = $1
         RETURNING attempts",
    )
    .bind(id)
    .fetch_one(executor)
    .await?;
    Ok(attempts)
}

pub async fn len(executor: impl PgExecutor<'_>) -> Result<i64, Error> {
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM receipt_queue")
        .fetch_one(executor)
        .await?;
    Ok(count)
}

/// Drops receipts past the attempt cap or the retention window.
///
/// Returns the dropped rows so the drainer can report them to admins.
pub async fn drop_exhausted(
    executor: impl PgExecutor<'_>,
    max_attempts: i32,
    created_before: OffsetDateTime,
) -> Result<Vec<FiscalReceipt>, Error> {
    let dropped = sqlx::query_as::<_, FiscalReceipt>(
        "DELETE FROM receipt_queue
         WHERE attempts >= $1 OR created_at < $2
         RETURNING *",
    )
    .bind(max_attempts)
    .bind(created_before)
    .fetch_all(executor)
    .await?;
    Ok(dropped)
}
