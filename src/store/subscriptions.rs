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

/// The stored status of a subscription.
///
/// [`Subscription::actual_status`] additionally folds in the end date;
/// reads that care about liveness go through it, not this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Disabled,
}

/// A user's subscription. At most one row per user.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub status: SubscriptionStatus,
    pub is_trial: bool,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    /// The traffic package in gigabytes; 0 means unlimited. Always one
    /// of the configured packages, so renewals can re-price it.
    pub traffic_limit_gb: i32,
    /// Extra gigabytes bought on top of the package. Kept apart from the
    /// package so repricing never depends on the summed value being a
    /// catalogue key. Reset by a (re)purchase.
    pub purchased_traffic_gb: i32,
    /// Usage read back from the panel; the broker never measures traffic.
    pub traffic_used_gb: f64,
    pub device_limit: i32,
    /// Connected squads, in selection order.
    pub connected_squads: Vec<Uuid>,
    pub modem_enabled: bool,
    pub autopay_enabled: bool,
    pub autopay_days_before: i32,
    /// Importable link minted by the panel; absent until the first
    /// successful remote sync.
    pub subscription_url: Option<String>,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// The stored status with expiry folded in.
    pub fn actual_status(&self, now: OffsetDateTime) -> SubscriptionStatus {
        if self.status == SubscriptionStatus::Active && self.end_date <= now {
            SubscriptionStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.actual_status(now) == SubscriptionStatus::Active
    }

    /// Whether the traffic cap is the unlimited package.
    pub fn is_unlimited_traffic(&self) -> bool {
        self.traffic_limit_gb == 0
    }

    /// The cap enforced on the panel: package plus purchased extras,
    /// 0 when the package is unlimited.
    pub fn effective_traffic_limit_gb(&self) -> i32 {
        if self.is_unlimited_traffic() {
            0
        } else {
            self.traffic_limit_gb + self.purchased_traffic_gb
        }
    }
}

/// Fields written when a subscription is created or (re)purchased.
#[derive(Debug, Clone)]
pub struct SubscriptionWrite {
    pub is_trial: bool,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    pub traffic_limit_gb: i32,
    pub device_limit: i32,
    pub connected_squads: Vec<Uuid>,
    pub autopay_days_before: i32,
}

pub async fn get_by_user(
    executor: impl PgExecutor<'_>,
    user_id: i64,
) -> Result<Option<Subscription>, Error> {
    let sub = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    Ok(sub)
}

/// Re-reads the subscription inside an open transaction, locking the row.
pub async fn get_by_user_for_update(
    executor: impl PgExecutor<'_>,
    user_id: i64,
) -> Result<Option<Subscription>, Error> {
    let sub = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE user_id = $1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    Ok(sub)
}

/// Creates the user's subscription or replaces it in place.
///
/// The unique index on `user_id` makes this the only write path able to
/// materialize a subscription, enforcing the 1:1 invariant. A purchase
/// over an existing row (trial conversion, repurchase) resets usage.
pub async fn upsert(
    executor: impl PgExecutor<'_>,
    user_id: i64,
    write: &SubscriptionWrite,
) -> Result<Subscription, Error> {
    let sub = sqlx::query_as::<_, Subscription>(
        "INSERT INTO subscriptions
             (user_id, status, is_trial, start_date, end_date, traffic_limit_gb,
              purchased_traffic_gb, traffic_used_gb, device_limit, connected_squads,
              autopay_days_before)
         VALUES ($1, 'active', $2, $3, $4, $5, 0, 0, $6, $7, $8)
         ON CONFLICT (user_id)
         DO UPDATE SET
             status = 'active',
             is_trial = $2,
             start_date = $3,
             end_date = $4,
             traffic_limit_gb = $5,
             purchased_traffic_gb = 0,
             traffic_used_gb = 0,
             device_limit = $6,
             connected_squads = $7,
             autopay_days_before = $8,
             updated_at = now()
         RETURNING *",
    )
    .bind(user_id)
    .bind(write.is_trial)
    .bind(write.start_date)
    .bind(write.end_date)
    .bind(write.traffic_limit_gb)
    .bind(write.device_limit)
    .bind(&write.connected_squads)
    .bind(write.autopay_days_before)
    .fetch_one(executor)
    .await?;
    Ok(sub)
}

pub async fn set_end_date(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    end_date: OffsetDateTime,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE subscriptions
         SET end_date = $2, status = 'active', updated_at = now()
         WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(end_date)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_traffic_limit(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    traffic_limit_gb: i32,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE subscriptions SET traffic_limit_gb = $2, updated_at = now() WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(traffic_limit_gb)
    .execute(executor)
    .await?;
    Ok(())
}

/// Adds purchased extra gigabytes on top of the package.
pub async fn add_purchased_traffic(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    extra_gb: i32,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE subscriptions
         SET purchased_traffic_gb = purchased_traffic_gb + $2, updated_at = now()
         WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(extra_gb)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_device_limit(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    device_limit: i32,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE subscriptions SET device_limit = $2, updated_at = now() WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(device_limit)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_connected_squads(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    squads: &[Uuid],
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE subscriptions SET connected_squads = $2, updated_at = now() WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(squads)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_modem(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    enabled: bool,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE subscriptions SET modem_enabled = $2, updated_at = now() WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(enabled)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_autopay(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    enabled: bool,
    days_before: i32,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE subscriptions
         SET autopay_enabled = $2, autopay_days_before = $3, updated_at = now()
         WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(enabled)
    .bind(days_before)
    .execute(executor)
    .await?;
    Ok(())
}

/// Records panel-reported usage. Read-only from the panel's perspective.
pub async fn set_traffic_used(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    traffic_used_gb: f64,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE subscriptions SET traffic_used_gb = $2, updated_at = now() WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(traffic_used_gb)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_subscription_url(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    url: &str,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE subscriptions SET subscription_url = $2, updated_at = now() WHERE id = $1",
    )
    .bind(subscription_id)
    .bind(url)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_status(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    status: SubscriptionStatus,
) -> Result<(), Error> {
    sqlx::query("UPDATE subscriptions SET status = $2, updated_at = now() WHERE id = $1")
        .bind(subscription_id)
        .bind(status)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn delete(executor: impl PgExecutor<'_>, subscription_id: i64) -> Result<(), Error> {
    sqlx::query("DELETE FROM subscriptions WHERE id = $1")
        .bind(subscription_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// A per-server price snapshot attached to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SubscriptionServer {
    pub subscription_id: i64,
    pub server_id: i64,
    /// What the user was charged for this server for the current paid
    /// period.
    pub paid_price_kopeks: i64,
    pub created_at: OffsetDateTime,
}

/// Replaces the server links, snapshotting what was paid per server.
pub async fn replace_server_links(
    conn: &mut sqlx::PgConnection,
    subscription_id: i64,
    links: &[(i64, i64)],
) -> Result<(), Error> {
    sqlx::query("DELETE FROM subscription_servers WHERE subscription_id = $1")
        .bind(subscription_id)
        .execute(&mut *conn)
        .await?;
    for (server_id, paid_price_kopeks) in links {
        sqlx::query(
            "INSERT INTO subscription_servers (subscription_id, server_id, paid_price_kopeks)
             VALUES ($1, $2, $3)",
        )
        .bind(subscription_id)
        .bind(server_id)
        .bind(paid_price_kopeks)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn add_server_link(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    server_id: i64,
    paid_price_kopeks: i64,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO subscription_servers (subscription_id, server_id, paid_price_kopeks)
         VALUES ($1, $2, $3)",
    )
    .bind(subscription_id)
    .bind(server_id)
    .bind(paid_price_kopeks)
    .execute(executor)
    .await?;
    Ok(())
}

/// Removing a server is always free; the snapshot row just goes away.
pub async fn remove_server_link(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    server_id: i64,
) -> Result<(), Error> {
    sqlx::query(
        "DELETE FROM subscription_servers WHERE subscription_id = $1 AND server_id = $2",
    )
    .bind(subscription_id)
    .bind(server_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn server_links(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
) -> Result<Vec<SubscriptionServer>, Error> {
    let links = sqlx::query_as::<_, SubscriptionServer>(
        "SELECT * FROM subscription_servers WHERE subscription_id = $1 ORDER BY created_at",
    )
    .bind(subscription_id)
    .fetch_all(executor)
    .await?;
    Ok(links)
}

/// Paid subscriptions whose end date falls inside `[now, now + within]`.
pub async fn expiring_within(
    executor: impl PgExecutor<'_>,
    now: OffsetDateTime,
    within: time::Duration,
) -> Result<Vec<Subscription>, Error> {
    let subs = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions
         WHERE status = 'active' AND NOT is_trial
           AND end_date > $1 AND end_date <= $2
         ORDER BY end_date",
    )
    .bind(now)
    .bind(now + within)
    .fetch_all(executor)
    .await?;
    Ok(subs)
}

/// Subscriptions the autopay runner should attempt now.
pub async fn due_for_autopay(
    executor: impl PgExecutor<'_>,
    now: OffsetDateTime,
) -> Result<Vec<Subscription>, Error> {
    let subs = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions
         WHERE status = 'active' AND NOT is_trial AND autopay_enabled
           AND end_date > $1
           AND end_date <= $1 + make_interval(days => autopay_days_before)
         ORDER BY end_date",
    )
    .bind(now)
    .fetch_all(executor)
    .await?;
    Ok(subs)
}

/// Trials that lapsed at least `grace` ago and are still marked active.
pub async fn lapsed_trials(
    executor: impl PgExecutor<'_>,
    now: OffsetDateTime,
    grace: time::Duration,
) -> Result<Vec<Subscription>, Error> {
    let subs = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions
         WHERE is_trial AND status = 'active' AND end_date <= $1",
    )
    .bind(now - grace)
    .fetch_all(executor)
    .await?;
    Ok(subs)
}

/// Flips lapsed active subscriptions to `expired`. Returns how many.
pub async fn mark_lapsed_expired(
    executor: impl PgExecutor<'_>,
    now: OffsetDateTime,
) -> Result<u64, Error> {
    let result = sqlx::query(
        "UPDATE subscriptions
         SET status = 'expired', updated_at = now()
         WHERE status = 'active' AND end_date <= $1",
    )
    .bind(now)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Counts for the report dispatcher.
pub async fn count_active(
    executor: impl PgExecutor<'_>,
    now: OffsetDateTime,
) -> Result<i64, Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM subscriptions
         WHERE status = 'active' AND end_date > $1",
    )
    .bind(now)
    .fetch_one(executor)
    .await?;
    Ok(count)
}

pub async fn count_new_since(
    executor: impl PgExecutor<'_>,
    since: OffsetDateTime,
    until: OffsetDateTime,
    trials: bool,
) -> Result<i64, Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM subscriptions
         WHERE is_trial = $3 AND start_date >= $1 AND start_date < $2",
    )
    .bind(since)
    .bind(until)
    .bind(trials)
    .fetch_one(executor)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use time::ext::NumericalDuration;

    use super::*;

    fn subscription(end_in: time::Duration) -> Subscription {
        let now = OffsetDateTime::now_utc();
        Subscription {
            id: 1,
            user_id: 1,
            status: SubscriptionStatus::Active,
            is_trial: false,
            start_date: now - 1.days(),
            end_date: now + end_in,
            traffic_limit_gb: 100,
            purchased_traffic_gb: 0,
            traffic_used_gb: 0.0,
            device_limit: 1,
            connected_squads: vec![],
            modem_enabled: false,
            autopay_enabled: false,
            autopay_days_before: 3,
            subscription_url: None,
            updated_at: now,
        }
    }

    #[test]
    fn actual_status_folds_in_expiry() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            subscription(2.days()).actual_status(now),
            SubscriptionStatus::Active
        );
        assert_eq!(
            subscription((-2).days()).actual_status(now),
            SubscriptionStatus::Expired
        );

        let mut disabled = subscription(2.days());
        disabled.status = SubscriptionStatus::Disabled;
        assert_eq!(disabled.actual_status(now), SubscriptionStatus::Disabled);
        assert!(!disabled.is_active(now));
    }
}
