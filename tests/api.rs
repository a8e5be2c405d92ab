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

//! Integration tests.
//!
//! To run these tests, you must provide a Postgres database in the
//! `BROKER_TEST_DATABASE_URL` environment variable. The schema is
//! created on first use.
//!
//! These tests must be run serially, as via
//!
//!     $ cargo test -- --test-threads=1
//!
//! because each test competes for access to the same database. No live
//! panel is required: panel syncs are expected to fail against the
//! unroutable test endpoint, which exercises the "DB state is
//! authoritative" policy on every committed operation.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use codes_iso_3166::part_1::CountryCode;
use once_cell::sync::Lazy;
use rand::Rng;
use sqlx::postgres::{PgPool, PgPoolOptions};
use test_log::test;
use time::ext::NumericalDuration;
use time::OffsetDateTime;
use uuid::Uuid;

use vpn_broker::notify::{NotificationBus, NotificationReceivers, UserNotice};
use vpn_broker::sched::autopay::AutopayRunner;
use vpn_broker::store::{drafts, events, payments, subscriptions, transactions, users, Store};
use vpn_broker::{
    CheckoutOrchestrator, Error, PanelClientBuilder, PanelConfig, PaymentIngress, PurchaseConfig,
    Settings, SubscriptionService, TopupEvent, TopupOutcome,
};

/// The database to run against.
static DATABASE_URL: Lazy<String> = Lazy::new(|| {
    env::var("BROKER_TEST_DATABASE_URL").expect("missing BROKER_TEST_DATABASE_URL")
});

/// The squad every test subscription connects to.
static TEST_SQUAD: Lazy<Uuid> = Lazy::new(Uuid::new_v4);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    telegram_id BIGINT NOT NULL UNIQUE,
    language TEXT NOT NULL DEFAULT 'ru',
    balance_kopeks BIGINT NOT NULL DEFAULT 0 CHECK (balance_kopeks >= 0),
    has_had_paid_subscription BOOLEAN NOT NULL DEFAULT FALSE,
    promo_group_id BIGINT,
    panel_uuid UUID,
    panel_short_uuid TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_activity TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS promo_groups (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    name TEXT NOT NULL,
    is_default BOOLEAN NOT NULL DEFAULT FALSE,
    server_discount_percent SMALLINT NOT NULL DEFAULT 0,
    traffic_discount_percent SMALLINT NOT NULL DEFAULT 0,
    device_discount_percent SMALLINT NOT NULL DEFAULT 0,
    period_discounts JSONB NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS servers (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    squad_uuid UUID NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    country_code TEXT NOT NULL DEFAULT '',
    price_kopeks_per_month BIGINT NOT NULL DEFAULT 0,
    is_available BOOLEAN NOT NULL DEFAULT TRUE,
    is_full BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE TABLE IF NOT EXISTS subscriptions (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    user_id BIGINT NOT NULL UNIQUE REFERENCES users (id),
    status TEXT NOT NULL DEFAULT 'active',
    is_trial BOOLEAN NOT NULL DEFAULT FALSE,
    start_date TIMESTAMPTZ NOT NULL,
    end_date TIMESTAMPTZ NOT NULL,
    traffic_limit_gb INT NOT NULL DEFAULT 0,
    purchased_traffic_gb INT NOT NULL DEFAULT 0,
    traffic_used_gb DOUBLE PRECISION NOT NULL DEFAULT 0,
    device_limit INT NOT NULL DEFAULT 1,
    connected_squads UUID[] NOT NULL DEFAULT '{}',
    modem_enabled BOOLEAN NOT NULL DEFAULT FALSE,
    autopay_enabled BOOLEAN NOT NULL DEFAULT FALSE,
    autopay_days_before INT NOT NULL DEFAULT 3,
    subscription_url TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS subscription_servers (
    subscription_id BIGINT NOT NULL REFERENCES subscriptions (id) ON DELETE CASCADE,
    server_id BIGINT NOT NULL REFERENCES servers (id),
    paid_price_kopeks BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS transactions (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users (id),
    tx_type TEXT NOT NULL,
    amount_kopeks BIGINT NOT NULL,
    is_completed BOOLEAN NOT NULL DEFAULT FALSE,
    provider TEXT,
    external_id TEXT,
    description TEXT NOT NULL DEFAULT '',
    metadata JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS transactions_dedupe
    ON transactions (provider, external_id) WHERE is_completed;
CREATE TABLE IF NOT EXISTS payments (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users (id),
    provider TEXT NOT NULL,
    external_id TEXT,
    amount_kopeks BIGINT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    payment_url TEXT,
    transaction_id BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS checkout_drafts (
    user_id BIGINT PRIMARY KEY REFERENCES users (id),
    state JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS subscription_events (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    event_type TEXT NOT NULL,
    user_id BIGINT NOT NULL,
    subscription_id BIGINT,
    transaction_id BIGINT,
    amount_kopeks BIGINT,
    occurred_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    extra JSONB NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS sent_notices (
    subscription_id BIGINT NOT NULL,
    bucket TEXT NOT NULL,
    end_date TIMESTAMPTZ NOT NULL,
    sent_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (subscription_id, bucket, end_date)
);
CREATE TABLE IF NOT EXISTS receipt_queue (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    payment_id BIGINT NOT NULL,
    name TEXT NOT NULL,
    amount_kopeks BIGINT NOT NULL,
    quantity INT NOT NULL DEFAULT 1,
    client_info TEXT,
    attempts INT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_attempt_at TIMESTAMPTZ
)
"#;

fn offline_panel() -> vpn_broker::PanelClient {
    // An unroutable panel with no retries: every sync fails fast, which
    // is the committed-but-unsynced path the broker must tolerate.
    PanelClientBuilder::default()
        .request_timeout(Duration::from_millis(200))
        .max_retries(0)
        .build(PanelConfig {
            api_url: "http://127.0.0.1:1".into(),
            api_token: "test-token".into(),
        })
}

struct Harness {
    pool: PgPool,
    store: Store,
    settings: Arc<Settings>,
    service: SubscriptionService,
    ingress: PaymentIngress,
    #[allow(dead_code)]
    receivers: NotificationReceivers,
}

async fn harness() -> Harness {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&DATABASE_URL)
        .await
        .expect("database must be reachable");
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if !statement.is_empty() {
            sqlx::query(statement).execute(&pool).await.unwrap();
        }
    }
    sqlx::query(
        "INSERT INTO promo_groups (name, is_default)
         SELECT 'default', TRUE
         WHERE NOT EXISTS (SELECT 1 FROM promo_groups WHERE is_default)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO servers (squad_uuid, display_name, country_code, price_kopeks_per_month)
         VALUES ($1, 'test-nl-1', $2, 10000)
         ON CONFLICT (squad_uuid) DO NOTHING",
    )
    .bind(*TEST_SQUAD)
    .bind(CountryCode::NL.to_string())
    .execute(&pool)
    .await
    .unwrap();

    let settings = Arc::new(Settings::with_trial_squad(Uuid::new_v4()));
    let store = Store::new(pool.clone());
    let (bus, receivers) = NotificationBus::new();
    let service = SubscriptionService::new(
        Arc::clone(&settings),
        store.clone(),
        offline_panel(),
        bus.clone(),
    );
    let ingress = PaymentIngress::new(Arc::clone(&settings), store.clone(), bus.clone());
    Harness {
        pool,
        store,
        settings,
        service,
        ingress,
        receivers,
    }
}

async fn create_test_user(pool: &PgPool) -> users::User {
    let telegram_id = rand::thread_rng().gen_range(1_000_000_000i64..9_000_000_000i64);
    users::upsert_on_contact(pool, telegram_id, "ru").await.unwrap()
}

async fn set_balance(pool: &PgPool, user_id: i64, balance: i64) {
    sqlx::query("UPDATE users SET balance_kopeks = $2 WHERE id = $1")
        .bind(user_id)
        .bind(balance)
        .execute(pool)
        .await
        .unwrap();
}

fn one_month_config() -> PurchaseConfig {
    PurchaseConfig {
        period_days: 30,
        traffic_gb: 100,
        device_limit: 1,
        server_uuids: vec![*TEST_SQUAD],
    }
}

#[test(tokio::test)]
async fn test_trial_activation() {
    let h = harness().await;
    let user = create_test_user(&h.pool).await;

    let outcome = h.service.create_trial(user.id).await.unwrap();
    let sub = outcome.subscription;
    assert!(sub.is_trial);
    assert_eq!(sub.traffic_limit_gb, h.settings.trial.traffic_limit_gb as i32);
    assert_eq!(sub.device_limit, h.settings.trial.device_limit as i32);
    assert_eq!(sub.connected_squads, vec![h.settings.trial.squad_uuid]);
    let expected_end = sub.start_date + i64::from(h.settings.trial.duration_days).days();
    assert_eq!(sub.end_date, expected_end);

    // The panel is unreachable in tests, so no import link yet.
    assert_eq!(outcome.subscription_url, None);

    let user = users::get(&h.pool, user.id).await.unwrap();
    assert!(!user.has_had_paid_subscription);

    let log = events::list_for_user(&h.pool, user.id, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].event_type, events::EventType::TrialActivated);

    // The trial is once per user.
    let err = h.service.create_trial(user.id).await.unwrap_err();
    assert!(matches!(err, Error::TrialAlreadyUsed));
}

#[test(tokio::test)]
async fn test_purchase_with_exact_balance() {
    let h = harness().await;
    let user = create_test_user(&h.pool).await;
    h.service.create_trial(user.id).await.unwrap();

    // 99000 base + 1 month x (15000 traffic + 10000 server + 0 devices).
    set_balance(&h.pool, user.id, 124_000).await;
    let outcome = h.service.purchase(user.id, &one_month_config()).await.unwrap();
    assert_eq!(outcome.quote.total_kopeks, 124_000);

    let user = users::get(&h.pool, user.id).await.unwrap();
    assert_eq!(user.balance_kopeks, 0);
    assert!(user.has_had_paid_subscription);

    let sub = outcome.subscription;
    assert!(!sub.is_trial);
    assert_eq!(sub.traffic_used_gb, 0.0);
    assert_eq!(sub.connected_squads, vec![*TEST_SQUAD]);

    let txs = transactions::list_for_user(&h.pool, user.id, 10).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].tx_type, transactions::TransactionType::SubscriptionPayment);
    assert_eq!(txs[0].amount_kopeks, 124_000);

    let purchases = events::list_for_user(&h.pool, user.id, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == events::EventType::SubscriptionPurchased)
        .count();
    assert_eq!(purchases, 1);

    let links = subscriptions::server_links(&h.pool, sub.id).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].paid_price_kopeks, 10_000);
}

#[test(tokio::test)]
async fn test_checkout_keeps_draft_on_insufficient_funds() {
    let h = harness().await;
    let user = create_test_user(&h.pool).await;
    set_balance(&h.pool, user.id, 123_999).await;

    let checkout = CheckoutOrchestrator::new(h.service.clone());
    let mut state = checkout.begin(user.id).await.unwrap();
    checkout
        .transition(user.id, &mut state, |s| s.select_period(30))
        .await
        .unwrap();
    checkout
        .transition(user.id, &mut state, |s| s.select_traffic(100))
        .await
        .unwrap();
    checkout
        .transition(user.id, &mut state, |s| s.toggle_server(*TEST_SQUAD))
        .await
        .unwrap();
    checkout
        .transition(user.id, &mut state, |s| s.confirm_servers())
        .await
        .unwrap();
    checkout
        .transition(user.id, &mut state, |s| s.select_devices(1))
        .await
        .unwrap();
    assert_eq!(state.quote.as_ref().unwrap().total_kopeks, 124_000);

    // One kopek short: no mutation, the draft survives for the top-up
    // flow to resume.
    let err = checkout.commit(user.id, &mut state).await.unwrap_err();
    match err {
        Error::InsufficientFunds { missing_kopeks } => assert_eq!(missing_kopeks, 1),
        e => panic!("expected InsufficientFunds, got {e:?}"),
    }
    let user_row = users::get(&h.pool, user.id).await.unwrap();
    assert_eq!(user_row.balance_kopeks, 123_999);
    assert!(subscriptions::get_by_user(&h.pool, user.id).await.unwrap().is_none());
    assert!(drafts::load(&h.pool, user.id).await.unwrap().is_some());

    // Topping up the missing kopek lets the same draft commit.
    set_balance(&h.pool, user.id, 124_000).await;
    let mut resumed = checkout.resume(user.id).await.unwrap().unwrap();
    let outcome = checkout.commit(user.id, &mut resumed).await.unwrap();
    assert_eq!(outcome.quote.total_kopeks, 124_000);
    assert!(drafts::load(&h.pool, user.id).await.unwrap().is_none());
}

#[test(tokio::test)]
async fn test_webhook_replay_credits_once() {
    let h = harness().await;
    let user = create_test_user(&h.pool).await;
    let external_id = format!("pay-{}", rand::thread_rng().gen::<u32>());
    payments::create_intent(
        &h.pool,
        user.id,
        "yookassa",
        50_000,
        Some(&external_id),
        Some("https://pay.example.com/x"),
    )
    .await
    .unwrap();
    let event = TopupEvent {
        user_id: user.id,
        amount_kopeks: 50_000,
        external_id: external_id.clone(),
        client_info: None,
        metadata: serde_json::json!({}),
    };

    let first = h.ingress.process_topup("yookassa", &event).await.unwrap();
    assert!(matches!(first, TopupOutcome::Credited(_)));

    // The webhook joined the pending intent to its ledger row.
    let intent = payments::get_by_external_id(&h.pool, "yookassa", &external_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(intent.status, payments::PaymentStatus::Completed);
    assert!(intent.transaction_id.is_some());
    let second = h.ingress.process_topup("yookassa", &event).await.unwrap();
    assert_eq!(second, TopupOutcome::Duplicate);

    let user_row = users::get(&h.pool, user.id).await.unwrap();
    assert_eq!(user_row.balance_kopeks, 50_000);

    let received = events::list_for_user(&h.pool, user.id, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == events::EventType::PaymentReceived)
        .count();
    assert_eq!(received, 1);
}

#[test(tokio::test)]
async fn test_extension_date_arithmetic() {
    let h = harness().await;
    let user = create_test_user(&h.pool).await;
    set_balance(&h.pool, user.id, 1_000_000).await;
    let outcome = h.service.purchase(user.id, &one_month_config()).await.unwrap();
    let end_before = outcome.subscription.end_date;

    // Extending a live subscription appends to the current end date.
    let extended = h.service.extend(user.id, 30).await.unwrap();
    assert_eq!(extended.subscription.end_date, end_before + 30.days());

    // An expired subscription restarts from now.
    let past = OffsetDateTime::now_utc() - 5.days();
    sqlx::query("UPDATE subscriptions SET end_date = $2 WHERE user_id = $1")
        .bind(user.id)
        .bind(past)
        .execute(&h.pool)
        .await
        .unwrap();
    let revived = h.service.extend(user.id, 30).await.unwrap();
    let lower = OffsetDateTime::now_utc() + 29.days();
    assert!(revived.subscription.end_date > lower);
}

#[test(tokio::test)]
async fn test_extension_reprices_after_traffic_topup() {
    let h = harness().await;
    let user = create_test_user(&h.pool).await;
    set_balance(&h.pool, user.id, 1_000_000).await;
    h.service.purchase(user.id, &one_month_config()).await.unwrap();

    // +50 GB on the 100 GB package with one month left: 11000 kopeks.
    let charged = h.service.add_traffic(user.id, 50).await.unwrap();
    assert_eq!(charged, 11_000);

    let sub = subscriptions::get_by_user(&h.pool, user.id).await.unwrap().unwrap();
    assert_eq!(sub.traffic_limit_gb, 100);
    assert_eq!(sub.purchased_traffic_gb, 50);
    assert_eq!(sub.effective_traffic_limit_gb(), 150);

    // The top-up lives next to the package, so renewal still prices the
    // 100 GB catalogue key instead of failing on the summed 150.
    let extended = h.service.extend(user.id, 30).await.unwrap();
    assert_eq!(extended.quote.total_kopeks, 124_000);
    let sub = subscriptions::get_by_user(&h.pool, user.id).await.unwrap().unwrap();
    assert_eq!(sub.traffic_limit_gb, 100);
    assert_eq!(sub.purchased_traffic_gb, 50);
}

#[test(tokio::test)]
async fn test_autopay_insufficient_notifies_once_per_day() {
    let h = harness().await;
    let user = create_test_user(&h.pool).await;
    set_balance(&h.pool, user.id, 1_000_000).await;
    h.service.purchase(user.id, &one_month_config()).await.unwrap();
    h.service.set_autopay(user.id, true, 3).await.unwrap();

    // Expiring inside the autopay window, with the balance one kopek
    // short of the 124000-kopek monthly renewal.
    let soon = OffsetDateTime::now_utc() + 2.days();
    sqlx::query("UPDATE subscriptions SET end_date = $2 WHERE user_id = $1")
        .bind(user.id)
        .bind(soon)
        .execute(&h.pool)
        .await
        .unwrap();
    set_balance(&h.pool, user.id, 123_999).await;
    // Compare against the stored (microsecond-precision) timestamp.
    let soon = subscriptions::get_by_user(&h.pool, user.id)
        .await
        .unwrap()
        .unwrap()
        .end_date;

    let (bus, mut receivers) = NotificationBus::new();
    let service = SubscriptionService::new(
        Arc::clone(&h.settings),
        h.store.clone(),
        offline_panel(),
        bus.clone(),
    );
    let runner = AutopayRunner::new(Arc::clone(&h.settings), h.store.clone(), service, bus);

    let stats = runner.run_once().await.unwrap();
    assert_eq!(stats.insufficient_balance, 1);
    assert_eq!(stats.successful, 0);

    // No mutation: balance and end date are untouched.
    let user_row = users::get(&h.pool, user.id).await.unwrap();
    assert_eq!(user_row.balance_kopeks, 123_999);
    let sub = subscriptions::get_by_user(&h.pool, user.id).await.unwrap().unwrap();
    assert_eq!(sub.end_date, soon);

    // A second pass inside the 24h cooldown sends no duplicate notice.
    let stats = runner.run_once().await.unwrap();
    assert_eq!(stats.insufficient_balance, 1);

    let mut insufficient_notices = 0;
    while let Ok(notification) = receivers.user_rx.try_recv() {
        if matches!(notification.notice, UserNotice::AutopayInsufficient { .. }) {
            insufficient_notices += 1;
        }
    }
    assert_eq!(insufficient_notices, 1);
}

#[test(tokio::test)]
async fn test_server_add_remove_round_trip() {
    let h = harness().await;
    let user = create_test_user(&h.pool).await;
    set_balance(&h.pool, user.id, 1_000_000).await;
    h.service.purchase(user.id, &one_month_config()).await.unwrap();

    // A second sellable server to add post-purchase.
    let extra = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO servers (squad_uuid, display_name, country_code, price_kopeks_per_month)
         VALUES ($1, 'test-de-1', $2, 10000)",
    )
    .bind(extra)
    .bind(CountryCode::DE.to_string())
    .execute(&h.pool)
    .await
    .unwrap();

    let before = subscriptions::get_by_user(&h.pool, user.id).await.unwrap().unwrap();
    let balance_before = users::get(&h.pool, user.id).await.unwrap().balance_kopeks;

    // One month remains on the subscription, so the added server costs
    // exactly its monthly price; the snapshot row carries the same.
    let charged = h.service.add_servers(user.id, &[extra]).await.unwrap();
    assert_eq!(charged, 10_000);
    h.service.remove_servers(user.id, &[extra]).await.unwrap();

    let after = subscriptions::get_by_user(&h.pool, user.id).await.unwrap().unwrap();
    // Same connected set as before, but the debit remains.
    assert_eq!(after.connected_squads, before.connected_squads);
    let balance_after = users::get(&h.pool, user.id).await.unwrap().balance_kopeks;
    assert_eq!(balance_after, balance_before - charged);
}
