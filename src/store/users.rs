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
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Error;

/// A broker user.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    /// Internal row ID.
    pub id: i64,
    /// The external chat ID; unique.
    pub telegram_id: i64,
    /// BCP-47-ish language tag used to localize notices.
    pub language: String,
    /// Wallet balance in kopeks. Never negative in a committed state.
    pub balance_kopeks: i64,
    /// Monotone once-true: set on the first paid purchase, never unset.
    pub has_had_paid_subscription: bool,
    /// The user's promo group; `None` means the default group.
    pub promo_group_id: Option<i64>,
    /// The panel-side user identity, once created remotely.
    pub panel_uuid: Option<Uuid>,
    /// The compact panel identifier used in import links.
    pub panel_short_uuid: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub last_activity: OffsetDateTime,
}

/// Creates the user on first chat contact, or refreshes `last_activity`
/// on subsequent contacts.
pub async fn upsert_on_contact(
    executor: impl PgExecutor<'_>,
    telegram_id: i64,
    language: &str,
) -> Result<User, Error> {
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (telegram_id, language)
         VALUES ($1, $2)
         ON CONFLICT (telegram_id)
         DO UPDATE SET last_activity = now()
         RETURNING *",
    )
    .bind(telegram_id)
    .bind(language)
    .fetch_one(executor)
    .await?;
    Ok(user)
}

pub async fn get(executor: impl PgExecutor<'_>, id: i64) -> Result<User, Error> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_one(executor)
        .await?;
    Ok(user)
}

pub async fn get_by_telegram_id(
    executor: impl PgExecutor<'_>,
    telegram_id: i64,
) -> Result<Option<User>, Error> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE telegram_id = $1")
        .bind(telegram_id)
        .fetch_optional(executor)
        .await?;
    Ok(user)
}

/// Re-reads the user inside an open transaction, locking the row.
///
/// Money paths read through this so concurrent mutations serialize on the
/// user row rather than losing updates.
pub async fn get_for_update(executor: impl PgExecutor<'_>, id: i64) -> Result<User, Error> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_one(executor)
        .await?;
    Ok(user)
}

/// Debits the wallet, failing without mutation if the balance would go
/// negative.
pub async fn debit_balance(
    conn: &mut sqlx::PgConnection,
    user_id: i64,
    amount_kopeks: i64,
) -> Result<(), Error> {
    if amount_kopeks < 0 {
        return Err(Error::validation("amount_kopeks", "debit amount must be non-negative"));
    }
    let result = sqlx::query(
        "UPDATE users
         SET balance_kopeks = balance_kopeks - $2, updated_at = now()
         WHERE id = $1 AND balance_kopeks >= $2",
    )
    .bind(user_id)
    .bind(amount_kopeks)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        let balance: i64 =
            sqlx::query_scalar("SELECT balance_kopeks FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_one(&mut *conn)
                .await?;
        return Err(Error::InsufficientFunds {
            missing_kopeks: amount_kopeks - balance,
        });
    }
    Ok(())
}

/// Credits the wallet without a dedupe key.
///
/// Only for internal credits (refunds, bonuses); external money-in goes
/// through the idempotent deposit path in [`crate::store::transactions`].
pub async fn credit_balance(
    executor: impl PgExecutor<'_>,
    user_id: i64,
    amount_kopeks: i64,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE users
         SET balance_kopeks = balance_kopeks + $2, updated_at = now()
         WHERE id = $1",
    )
    .bind(user_id)
    .bind(amount_kopeks)
    .execute(executor)
    .await?;
    Ok(())
}

/// Marks the user as having held a paid subscription. Monotone.
pub async fn mark_had_paid_subscription(
    executor: impl PgExecutor<'_>,
    user_id: i64,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE users
         SET has_had_paid_subscription = TRUE, updated_at = now()
         WHERE id = $1",
    )
    .bind(user_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Records the panel identity assigned on the first remote sync.
pub async fn set_panel_identity(
    executor: impl PgExecutor<'_>,
    user_id: i64,
    panel_uuid: Uuid,
    panel_short_uuid: &str,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE users
         SET panel_uuid = $2, panel_short_uuid = $3, updated_at = now()
         WHERE id = $1",
    )
    .bind(user_id)
    .bind(panel_uuid)
    .bind(panel_short_uuid)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_promo_group(
    executor: impl PgExecutor<'_>,
    user_id: i64,
    promo_group_id: Option<i64>,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE users SET promo_group_id = $2, updated_at = now() WHERE id = $1",
    )
    .bind(user_id)
    .bind(promo_group_id)
    .execute(executor)
    .await?;
    Ok(())
}
