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

use async_stream::try_stream;
use futures_core::Stream;
use reqwest::Method;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::Error;
use crate::panel::PanelClient;

const SQUADS_PATH: [&str; 2] = ["api", "internal-squads"];

/// A panel squad: a selectable exit group the broker maps servers onto.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Squad {
    pub uuid: Uuid,
    pub name: String,
    /// How many remote users are currently in the squad.
    pub members_count: u64,
    /// Panel-enforced capacity; `None` means unbounded.
    pub members_limit: Option<u64>,
}

impl Squad {
    /// Whether the squad can take more members.
    pub fn is_full(&self) -> bool {
        matches!(self.members_limit, Some(limit) if self.members_count >= limit)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SquadPage {
    internal_squads: Vec<Squad>,
    total: u64,
}

/// Parameters for a squad list operation.
#[derive(Debug, Clone, Copy)]
pub struct SquadListParams {
    page_size: u64,
}

impl Default for SquadListParams {
    fn default() -> SquadListParams {
        SquadListParams::DEFAULT
    }
}

impl SquadListParams {
    /// The default squad list parameters.
    ///
    /// Exposed as a constant for use in constant evaluation contexts.
    pub const DEFAULT: SquadListParams = SquadListParams { page_size: 100 };

    /// Sets the page size for the list operation.
    pub const fn page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }
}

impl PanelClient {
    /// Lists the panel's squads as configured by `params`.
    ///
    /// The underlying API call is paginated. The returned stream will
    /// fetch additional pages as it is consumed.
    pub fn list_squads(
        &self,
        params: &SquadListParams,
    ) -> impl Stream<Item = Result<Squad, Error>> + '_ {
        let page_size = params.page_size;
        try_stream! {
            let mut start = 0u64;
            loop {
                let req = self
                    .build_request(Method::GET, SQUADS_PATH)
                    .query(&[("start", start), ("size", page_size)]);
                let page: SquadPage = self.send_request(req).await?;
                let fetched = page.internal_squads.len() as u64;
                for squad in page.internal_squads {
                    yield squad;
                }
                start += fetched;
                if fetched == 0 || start >= page.total {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fullness_requires_a_limit() {
        let mut squad = Squad {
            uuid: Uuid::nil(),
            name: "nl-1".into(),
            members_count: 500,
            members_limit: None,
        };
        assert!(!squad.is_full());
        squad.members_limit = Some(500);
        assert!(squad.is_full());
        squad.members_limit = Some(501);
        assert!(!squad.is_full());
    }
}
