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
use uuid::Uuid;

use crate::error::Error;
use crate::pricing::ServerPrice;

/// A selectable VPN exit group (a panel squad) carrying a monthly price.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Server {
    pub id: i64,
    /// The panel-side squad this server maps to; unique.
    pub squad_uuid: Uuid,
    pub display_name: String,
    pub country_code: String,
    pub price_kopeks_per_month: i64,
    /// Offered in the checkout wizard only while available.
    pub is_available: bool,
    /// Full squads are listed but not selectable.
    pub is_full: bool,
}

impl Server {
    /// The pricing-engine view of this server.
    pub fn price(&self) -> ServerPrice {
        ServerPrice {
            squad_uuid: self.squad_uuid,
            monthly_price_kopeks: self.price_kopeks_per_month,
        }
    }
}

/// Servers offered in the checkout wizard.
pub async fn list_selectable(executor: impl PgExecutor<'_>) -> Result<Vec<Server>, Error> {
    let servers = sqlx::query_as::<_, Server>(
        "SELECT * FROM servers
         WHERE is_available AND NOT is_full
         ORDER BY display_name",
    )
    .fetch_all(executor)
    .await?;
    Ok(servers)
}

/// Resolves squads to servers, preserving the input order.
///
/// Returns an error naming the first squad that is unknown or not
/// currently available; the caller treats this as a stale-prerequisite
/// re-check failure.
pub async fn resolve_squads(
    executor: impl PgExecutor<'_>,
    squad_uuids: &[Uuid],
) -> Result<Vec<Server>, Error> {
    let rows = sqlx::query_as::<_, Server>(
        "SELECT * FROM servers WHERE squad_uuid = ANY($1)",
    )
    .bind(squad_uuids)
    .fetch_all(executor)
    .await?;

    let mut ordered = Vec::with_capacity(squad_uuids.len());
    for uuid in squad_uuids {
        match rows.iter().find(|s| s.squad_uuid == *uuid) {
            Some(server) if server.is_available => ordered.push(server.clone()),
            _ => return Err(Error::ResourceUnavailable(crate::error::Resource::Server)),
        }
    }
    Ok(ordered)
}

/// Resolves squads to servers regardless of availability, preserving the
/// input order and skipping squads with no catalog row.
///
/// Extension and renewal flows price what is already connected; a server
/// withdrawn from sale keeps billing at its current catalog price.
pub async fn resolve_squads_any(
    executor: impl PgExecutor<'_>,
    squad_uuids: &[Uuid],
) -> Result<Vec<Server>, Error> {
    let rows = sqlx::query_as::<_, Server>(
        "SELECT * FROM servers WHERE squad_uuid = ANY($1)",
    )
    .bind(squad_uuids)
    .fetch_all(executor)
    .await?;

    let mut ordered = Vec::with_capacity(squad_uuids.len());
    for uuid in squad_uuids {
        if let Some(server) = rows.iter().find(|s| s.squad_uuid == *uuid) {
            ordered.push(server.clone());
        }
    }
    Ok(ordered)
}

pub async fn get_by_squad_uuid(
    executor: impl PgExecutor<'_>,
    squad_uuid: Uuid,
) -> Result<Option<Server>, Error> {
    let server = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE squad_uuid = $1")
        .bind(squad_uuid)
        .fetch_optional(executor)
        .await?;
    Ok(server)
}

/// Upserts the server catalog from the panel's squad list.
///
/// Prices and manual availability flags are broker-owned and not touched;
/// only the display name and fullness come from the panel.
pub async fn sync_from_panel(
    conn: &mut sqlx::PgConnection,
    squads: &[(Uuid, String, bool)],
) -> Result<u64, Error> {
    let mut changed = 0;
    for (squad_uuid, display_name, is_full) in squads {
        let result = sqlx::query(
            "INSERT INTO servers (squad_uuid, display_name, country_code, price_kopeks_per_month, is_available, is_full)
             VALUES ($1, $2, '', 0, FALSE, $3)
             ON CONFLICT (squad_uuid)
             DO UPDATE SET display_name = $2, is_full = $3",
        )
        .bind(squad_uuid)
        .bind(display_name)
        .bind(is_full)
        .execute(&mut *conn)
        .await?;
        changed += result.rows_affected();
    }
    Ok(changed)
}
