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

use futures_util::future;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_aux::field_attributes::deserialize_number_from_string;
use serde_enum_str::{Deserialize_enum_str, Serialize_enum_str};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Error;
use crate::panel::PanelClient;

const USERS_PATH: [&str; 2] = ["api", "users"];
const DEVICES_PATH: [&str; 3] = ["api", "hwid", "devices"];

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// The remote status of a panel user.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize_enum_str, Serialize_enum_str)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteUserStatus {
    /// The user may connect.
    Active,
    /// The user is administratively disabled.
    Disabled,
    /// The user exhausted their traffic allowance.
    Limited,
    /// The user's access window lapsed.
    Expired,
    /// An unknown status.
    #[serde(other)]
    Other(String),
}

/// A request to create or update a remote panel user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUserWrite<'a> {
    /// Panel-side login, derived from the chat identity.
    pub username: &'a str,
    /// The chat ID the panel indexes remote users by.
    pub telegram_id: i64,
    /// Traffic allowance in bytes; 0 disables the cap.
    pub traffic_limit_bytes: u64,
    /// Device cap enforced by the panel.
    pub hwid_device_limit: u32,
    /// When access lapses.
    #[serde(with = "time::serde::rfc3339")]
    pub expire_at: OffsetDateTime,
    /// The squads the user may exit through.
    pub active_internal_squads: &'a [Uuid],
    /// The remote status to write.
    pub status: RemoteUserStatus,
}

/// A remote panel user.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    /// The panel-assigned identifier.
    pub uuid: Uuid,
    /// The compact identifier used to form the public import URL.
    pub short_uuid: String,
    pub username: String,
    pub status: RemoteUserStatus,
    /// The importable subscription URL minted by the panel.
    pub subscription_url: Option<String>,
    /// The panel reports counters as stringified integers.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub used_traffic_bytes: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub traffic_limit_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub expire_at: OffsetDateTime,
}

impl RemoteUser {
    /// Panel-reported usage converted to gigabytes.
    pub fn used_traffic_gb(&self) -> f64 {
        self.used_traffic_bytes as f64 / BYTES_PER_GB
    }
}

/// A device registered against a remote user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDevice {
    /// The hardware identifier the panel keys devices by.
    pub hwid: String,
    pub platform: DevicePlatform,
    pub device_model: Option<String>,
}

/// The platform a device reported on registration.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize_enum_str, Serialize_enum_str)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlatform {
    Android,
    Ios,
    Windows,
    Macos,
    Linux,
    #[serde(other)]
    Other(String),
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: Vec<RemoteDevice>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteDeviceRequest<'a> {
    user_uuid: Uuid,
    hwid: &'a str,
}

impl PanelClient {
    /// Gets a remote user by panel UUID.
    pub async fn get_remote_user(&self, uuid: Uuid) -> Result<RemoteUser, Error> {
        let uuid = uuid.to_string();
        let req = self.build_request(Method::GET, USERS_PATH.iter().copied().chain([&*uuid]));
        self.send_request(req).await
    }

    /// Finds a remote user by the chat ID it was created with.
    pub async fn find_remote_user_by_telegram_id(
        &self,
        telegram_id: i64,
    ) -> Result<Option<RemoteUser>, Error> {
        let telegram_id = telegram_id.to_string();
        let req = self.build_request(
            Method::GET,
            USERS_PATH
                .iter()
                .copied()
                .chain(["by-telegram-id", &*telegram_id]),
        );
        // The panel returns every identity registered for the chat ID;
        // the broker maintains exactly one.
        let users: Option<Vec<RemoteUser>> = self.send_request_optional(req).await?;
        Ok(users.and_then(|mut users| {
            if users.is_empty() {
                None
            } else {
                Some(users.remove(0))
            }
        }))
    }

    /// Creates a remote user.
    ///
    /// Idempotent: when the panel reports the username or chat ID as
    /// taken, the existing identity is fetched and updated in place, and
    /// that updated user is returned.
    pub async fn create_remote_user(
        &self,
        write: &RemoteUserWrite<'_>,
    ) -> Result<RemoteUser, Error> {
        let req = self
            .build_request(Method::POST, USERS_PATH)
            .json(write);
        match self.send_request(req).await {
            Ok(user) => Ok(user),
            Err(Error::Api(api)) if api.status_code == StatusCode::CONFLICT => {
                let existing = self
                    .find_remote_user_by_telegram_id(write.telegram_id)
                    .await?
                    .ok_or_else(|| Error::UnexpectedResponse {
                        detail: format!(
                            "panel reported a conflict creating a user for telegram id {} \
                             but no existing user was found",
                            write.telegram_id
                        ),
                    })?;
                self.update_remote_user(existing.uuid, write).await
            }
            Err(e) => Err(e),
        }
    }

    /// Updates a remote user by panel UUID.
    pub async fn update_remote_user(
        &self,
        uuid: Uuid,
        write: &RemoteUserWrite<'_>,
    ) -> Result<RemoteUser, Error> {
        let uuid = uuid.to_string();
        let req = self
            .build_request(Method::PATCH, USERS_PATH.iter().copied().chain([&*uuid]))
            .json(write);
        self.send_request(req).await
    }

    /// Deletes a remote user. Used by trial cleanup.
    pub async fn delete_remote_user(&self, uuid: Uuid) -> Result<(), Error> {
        let uuid = uuid.to_string();
        let req = self.build_request(Method::DELETE, USERS_PATH.iter().copied().chain([&*uuid]));
        self.send_request_empty(req).await
    }

    /// Zeroes the remote traffic counter.
    pub async fn reset_traffic(&self, uuid: Uuid) -> Result<(), Error> {
        let uuid = uuid.to_string();
        let req = self.build_request(
            Method::POST,
            USERS_PATH
                .iter()
                .copied()
                .chain([&*uuid, "actions", "reset-traffic"]),
        );
        self.send_request_empty(req).await
    }

    /// Administratively disables a remote user.
    pub async fn disable_remote_user(&self, uuid: Uuid) -> Result<(), Error> {
        let uuid = uuid.to_string();
        let req = self.build_request(
            Method::POST,
            USERS_PATH.iter().copied().chain([&*uuid, "actions", "disable"]),
        );
        self.send_request_empty(req).await
    }

    /// Re-enables a disabled remote user.
    pub async fn enable_remote_user(&self, uuid: Uuid) -> Result<(), Error> {
        let uuid = uuid.to_string();
        let req = self.build_request(
            Method::POST,
            USERS_PATH.iter().copied().chain([&*uuid, "actions", "enable"]),
        );
        self.send_request_empty(req).await
    }

    /// Lists the devices registered against a remote user, in the
    /// panel's order.
    pub async fn list_devices(&self, uuid: Uuid) -> Result<Vec<RemoteDevice>, Error> {
        let uuid = uuid.to_string();
        let req = self.build_request(Method::GET, DEVICES_PATH.iter().copied().chain([&*uuid]));
        let list: DeviceList = self.send_request(req).await?;
        Ok(list.devices)
    }

    /// Unregisters one device from a remote user.
    pub async fn delete_device(&self, uuid: Uuid, hwid: &str) -> Result<(), Error> {
        let req = self
            .build_request(
                Method::POST,
                DEVICES_PATH.iter().copied().chain(["delete"]),
            )
            .json(&DeleteDeviceRequest {
                user_uuid: uuid,
                hwid,
            });
        self.send_request_empty(req).await
    }

    /// Fetches devices for several remote users concurrently.
    ///
    /// One failed lookup fails the whole fan-out; sibling requests are
    /// dropped with it.
    pub async fn list_devices_many(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<(Uuid, Vec<RemoteDevice>)>, Error> {
        future::try_join_all(uuids.iter().map(|uuid| async move {
            let devices = self.list_devices(*uuid).await?;
            Ok::<_, Error>((*uuid, devices))
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_user_decodes_stringified_counters() {
        let user: RemoteUser = serde_json::from_value(serde_json::json!({
            "uuid": "3f1b7c9e-2a64-4a1c-9d2f-1df0a8f6b111",
            "shortUuid": "a1b2c3",
            "username": "broker_42",
            "status": "ACTIVE",
            "subscriptionUrl": "https://panel.example.com/sub/a1b2c3",
            "usedTrafficBytes": "5368709120",
            "trafficLimitBytes": 107374182400u64,
            "expireAt": "2026-09-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(user.used_traffic_bytes, 5_368_709_120);
        assert_eq!(user.status, RemoteUserStatus::Active);
        assert!((user.used_traffic_gb() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_statuses_survive_decoding() {
        let status: RemoteUserStatus = serde_json::from_value(serde_json::json!("QUARANTINED")).unwrap();
        assert_eq!(status, RemoteUserStatus::Other("QUARANTINED".into()));
    }

    #[test]
    fn write_serializes_in_the_panel_shape() {
        let squads = [Uuid::nil()];
        let write = RemoteUserWrite {
            username: "broker_42",
            telegram_id: 42,
            traffic_limit_bytes: 0,
            hwid_device_limit: 2,
            expire_at: OffsetDateTime::UNIX_EPOCH,
            active_internal_squads: &squads,
            status: RemoteUserStatus::Active,
        };
        let value = serde_json::to_value(&write).unwrap();
        assert_eq!(value["trafficLimitBytes"], 0);
        assert_eq!(value["hwidDeviceLimit"], 2);
        assert_eq!(value["status"], "ACTIVE");
        assert!(value["activeInternalSquads"].is_array());
    }
}
