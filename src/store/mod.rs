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

//! The entity store.
//!
//! One repository module per entity, as free async functions over either a
//! pool (reads) or an open transaction (mutations). Every mutating
//! service operation runs inside exactly one transaction obtained from
//! [`Store::begin`]; repositories never commit on their own.

use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};

use crate::error::Error;

pub mod drafts;
pub mod events;
pub mod notices;
pub mod payments;
pub mod promo_groups;
pub mod receipts;
pub mod servers;
pub mod subscriptions;
pub mod transactions;
pub mod users;

/// Handle to the broker's relational store.
///
/// Cheap to clone; all clones share one bounded connection pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Wraps an already-connected pool.
    pub fn new(pool: PgPool) -> Store {
        Store { pool }
    }

    /// The underlying pool, for read paths and scheduler queries.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Opens a unit of work.
    ///
    /// Reads inside the transaction see a consistent snapshot; callers
    /// must re-read any state their preconditions depend on after this
    /// point, not before.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, Error> {
        Ok(self.pool.begin().await?)
    }
}
