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

/// A persisted checkout wizard snapshot, keyed by user. The payload is an
/// opaque serialized [`crate::checkout::CheckoutState`].
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CheckoutDraftRow {
    pub user_id: i64,
    pub state: Json<serde_json::Value>,
    pub updated_at: OffsetDateTime,
}

/// Saves or replaces the user's draft.
pub async fn save(
    executor: impl PgExecutor<'_>,
    user_id: i64,
    state: serde_json::Value,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO checkout_drafts (user_id, state)
         VALUES ($1, $2)
         ON CONFLICT (user_id)
         DO UPDATE SET state = $2, updated_at = now()",
    )
    .bind(user_id)
    .bind(Json(state))
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn load(
    executor: impl PgExecutor<'_>,
    user_id: i64,
) -> Result<Option<CheckoutDraftRow>, Error> {
    let draft = sqlx::query_as::<_, CheckoutDraftRow>(
        "SELECT * FROM checkout_drafts WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    Ok(draft)
}

pub async fn delete(executor: impl PgExecutor<'_>, user_id: i64) -> Result<(), Error> {
    sqlx::query("DELETE FROM checkout_drafts WHERE user_id = $1")
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Drops drafts not touched since `cutoff`. Returns how many.
pub async fn delete_stale(
    executor: impl PgExecutor<'_>,
    cutoff: OffsetDateTime,
) -> Result<u64, Error> {
    let result = sqlx::query("DELETE FROM checkout_drafts WHERE updated_at < $1")
        .bind(cutoff)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
