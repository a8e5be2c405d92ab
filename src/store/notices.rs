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

//! Dedupe ledger for scheduler-sent notices.
//!
//! Keyed by `(subscription_id, bucket, end_date)`: extending a
//! subscription moves `end_date` and thereby re-arms every bucket.

use sqlx::postgres::PgExecutor;
use time::OffsetDateTime;

use crate::error::Error;

/// Notice buckets the schedulers deduplicate on.
pub mod bucket {
    pub const EXPIRES_HOURS: &str = "expires_hours";
    pub const TRIAL_EXPIRED: &str = "trial_expired";
    pub const AUTOPAY_INSUFFICIENT: &str = "autopay_insufficient";

    /// The warning bucket for a whole-days-before-expiry reminder.
    pub fn expires_in_days(days: u32) -> String {
        format!("expires_{days}d")
    }
}

/// Records that a one-shot notice is being sent.
///
/// Returns `true` when this call won the insert and the caller should
/// send; `false` when the bucket was already recorded for this end date.
pub async fn record_once(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    bucket: &str,
    end_date: OffsetDateTime,
) -> Result<bool, Error> {
    let result = sqlx::query(
        "INSERT INTO sent_notices (subscription_id, bucket, end_date)
         VALUES ($1, $2, $3)
         ON CONFLICT (subscription_id, bucket, end_date) DO NOTHING",
    )
    .bind(subscription_id)
    .bind(bucket)
    .bind(end_date)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Records a repeatable notice gated by a cooldown.
///
/// Returns `true` when no send is on record within `cooldown_secs` of
/// `now` (and stamps this one); `false` inside the cooldown window. Used
/// by the autopay runner's "insufficient balance" notice (at most once
/// per 24 hours per subscription).
pub async fn record_with_cooldown(
    executor: impl PgExecutor<'_>,
    subscription_id: i64,
    bucket: &str,
    end_date: OffsetDateTime,
    now: OffsetDateTime,
    cooldown_secs: f64,
) -> Result<bool, Error> {
    let result = sqlx::query(
        "INSERT INTO sent_notices (subscription_id, bucket, end_date, sent_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (subscription_id, bucket, end_date)
         DO UPDATE SET sent_at = EXCLUDED.sent_at
         WHERE sent_notices.sent_at <= $4 - make_interval(secs => $5)",
    )
    .bind(subscription_id)
    .bind(bucket)
    .bind(end_date)
    .bind(now)
    .bind(cooldown_secs)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Drops notices for end dates far in the past; housekeeping only.
pub async fn prune_older_than(
    executor: impl PgExecutor<'_>,
    cutoff: OffsetDateTime,
) -> Result<u64, Error> {
    let result = sqlx::query("DELETE FROM sent_notices WHERE end_date < $1")
        .bind(cutoff)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
