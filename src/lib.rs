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

//! A subscription broker for VPN panel-backed services.
//!
//! The broker sits between a chat front-end, several payment providers,
//! and an upstream VPN control panel. It sells time-bounded access
//! charged against an internal wallet (integer kopeks throughout),
//! accepts top-ups through provider webhooks exactly once, and keeps its
//! view of every subscription synchronized with the panel's.
//!
//! The crate is the broker *core*: the pricing engine, the entity store,
//! the panel adapter, the subscription and checkout services, payment
//! ingress, and the background scheduler fleet. The chat UI, the HTTP
//! webhook listeners, and schema migrations live in the embedding
//! application; they talk to the core through [`Broker`] and the typed
//! notices on the [`notify::NotificationBus`].

#[warn(missing_debug_implementations, missing_docs)]
mod broker;
pub mod checkout;
pub mod config;
mod error;
pub mod notify;
pub mod panel;
pub mod payments;
pub mod pricing;
pub mod sched;
mod service;
pub mod store;

pub use broker::Broker;
pub use checkout::{CheckoutOrchestrator, CheckoutState, CheckoutStep};
pub use config::{
    MulenpaySettings, NalogoSettings, Prices, Settings, TrialSettings, WataSettings,
    YookassaSettings,
};
pub use error::{ApiError, Error, ErrorCategory, Resource};
pub use panel::squads::{Squad, SquadListParams};
pub use panel::users::{RemoteDevice, RemoteUser, RemoteUserStatus, RemoteUserWrite};
pub use panel::{PanelClient, PanelClientBuilder, PanelConfig, PanelHealth};
pub use payments::{PaymentIngress, ProviderAdapter, TopupEvent, TopupOutcome};
pub use pricing::{
    apply_percent_discount, months_from_days, quote_addon, quote_new, remaining_months,
    AddonQuote, Discounts, PriceRequest, Quote, QuoteComponent, ServerPrice,
};
pub use service::{PurchaseConfig, PurchaseOutcome, SubscriptionService, TrialOutcome};
pub use store::Store;
