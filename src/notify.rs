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

//! The notification bus.
//!
//! Typed, already-structured notices fanned out to the chat front-end
//! (user notices) and the admin audit channel. The front-end drains the
//! receivers and renders localization and keyboards; the broker core only
//! produces the structured payloads. Enqueueing never fails the operation
//! that produced the notice.

use std::path::PathBuf;

use time::OffsetDateTime;
use tokio::sync::mpsc;

/// A notice addressed to one user's chat.
#[derive(Debug, Clone, PartialEq)]
pub struct UserNotification {
    /// The chat to deliver to.
    pub telegram_id: i64,
    /// The user's language, for template selection downstream.
    pub language: String,
    pub notice: UserNotice,
}

/// The closed set of user-visible notices.
#[derive(Debug, Clone, PartialEq)]
pub enum UserNotice {
    TrialActivated {
        end_date: OffsetDateTime,
        subscription_url: Option<String>,
    },
    PurchaseCompleted {
        total_kopeks: i64,
        end_date: OffsetDateTime,
        /// Absent when the panel sync is still pending; the front-end
        /// shows "link generating".
        subscription_url: Option<String>,
    },
    SubscriptionExtended {
        total_kopeks: i64,
        end_date: OffsetDateTime,
    },
    AddonApplied {
        description: String,
        total_kopeks: i64,
    },
    TrafficReset {
        fee_kopeks: i64,
    },
    ExpiresSoon {
        end_date: OffsetDateTime,
        days_left: i64,
    },
    TrialExpired,
    AutopayCharged {
        total_kopeks: i64,
        end_date: OffsetDateTime,
        balance_kopeks: i64,
    },
    AutopayInsufficient {
        missing_kopeks: i64,
        end_date: OffsetDateTime,
    },
    TopupCredited {
        amount_kopeks: i64,
        balance_kopeks: i64,
    },
}

/// A notice for the admin audit channel.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminNotice {
    SubscriptionPurchased {
        user_id: i64,
        telegram_id: i64,
        total_kopeks: i64,
        period_days: u32,
        was_trial_conversion: bool,
    },
    SubscriptionExtended {
        user_id: i64,
        total_kopeks: i64,
        period_days: u32,
    },
    PaymentReceived {
        user_id: i64,
        provider: String,
        amount_kopeks: i64,
        external_id: String,
    },
    AutopayRun {
        processed: u64,
        successful: u64,
        insufficient_balance: u64,
        failed: u64,
    },
    PanelError {
        context: String,
        detail: String,
    },
    TrialsCleaned {
        expired: u64,
        deleted_from_panel: u64,
    },
    ReceiptQueueBacklog {
        queued: i64,
    },
    ReceiptQueueDrained,
    ReceiptDropped {
        payment_id: i64,
        attempts: i32,
    },
    Report {
        title: String,
        body: String,
    },
    LogArchiveReady {
        date: time::Date,
        path: PathBuf,
    },
    MaintenanceChanged {
        enabled: bool,
    },
}

/// Receiving halves handed to the chat front-end at boot.
pub struct NotificationReceivers {
    pub user_rx: mpsc::UnboundedReceiver<UserNotification>,
    pub admin_rx: mpsc::UnboundedReceiver<AdminNotice>,
}

/// The sending half shared by services and schedulers.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    user_tx: mpsc::UnboundedSender<UserNotification>,
    admin_tx: mpsc::UnboundedSender<AdminNotice>,
}

impl NotificationBus {
    /// Creates the bus and the receivers the front-end drains.
    pub fn new() -> (NotificationBus, NotificationReceivers) {
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (admin_tx, admin_rx) = mpsc::unbounded_channel();
        (
            NotificationBus { user_tx, admin_tx },
            NotificationReceivers { user_rx, admin_rx },
        )
    }

    /// Enqueues a user notice. Delivery failures never propagate.
    pub fn notify_user(&self, telegram_id: i64, language: &str, notice: UserNotice) {
        let notification = UserNotification {
            telegram_id,
            language: language.to_owned(),
            notice,
        };
        if self.user_tx.send(notification).is_err() {
            tracing::warn!(telegram_id, "user notification dropped: front-end receiver is gone");
        }
    }

    /// Enqueues an admin notice. Delivery failures never propagate.
    pub fn notify_admins(&self, notice: AdminNotice) {
        if self.admin_tx.send(notice).is_err() {
            tracing::warn!("admin notification dropped: audit receiver is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notices_arrive_in_order() {
        let (bus, mut receivers) = NotificationBus::new();
        bus.notify_user(1, "ru", UserNotice::TrialExpired);
        bus.notify_user(
            2,
            "en",
            UserNotice::TopupCredited {
                amount_kopeks: 50_000,
                balance_kopeks: 50_000,
            },
        );
        let first = receivers.user_rx.recv().await.unwrap();
        assert_eq!(first.telegram_id, 1);
        assert_eq!(first.notice, UserNotice::TrialExpired);
        let second = receivers.user_rx.recv().await.unwrap();
        assert_eq!(second.language, "en");
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (bus, receivers) = NotificationBus::new();
        drop(receivers);
        bus.notify_user(1, "ru", UserNotice::TrialExpired);
        bus.notify_admins(AdminNotice::ReceiptQueueDrained);
    }
}
