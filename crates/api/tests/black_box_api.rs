use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};

use stockledger_api::app::services::AppServices;
use stockledger_infra::workers::PeriodicRunner;
use stockledger_infra::Settings;

const STAFF: &str = "clerk-1";

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let mut settings = Settings::defaults().expect("default settings");
        settings.outbox.relay = PeriodicRunner::every(Duration::from_millis(20));
        settings.alerts = PeriodicRunner::every(Duration::from_secs(3600));

        // Same router as prod, in-memory stores, ephemeral port.
        let services = Arc::new(AppServices::in_memory(settings.retry.clone()));
        services.start_background(&settings).expect("background workers");
        let app = stockledger_api::app::build_app(services.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.services.shutdown();
    }
}

async fn post(client: &reqwest::Client, srv: &TestServer, path: &str, body: Value) -> (StatusCode, Value) {
    let res = client
        .post(srv.url(path))
        .header("x-staff-id", STAFF)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap_or(Value::Null))
}

async fn put(client: &reqwest::Client, srv: &TestServer, path: &str, body: Value) -> (StatusCode, Value) {
    let res = client
        .put(srv.url(path))
        .header("x-staff-id", STAFF)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap_or(Value::Null))
}

async fn get(client: &reqwest::Client, srv: &TestServer, path: &str) -> (StatusCode, Value) {
    let res = client
        .get(srv.url(path))
        .header("x-staff-id", STAFF)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap_or(Value::Null))
}

async fn apply(client: &reqwest::Client, srv: &TestServer, body: Value) -> (StatusCode, Value) {
    post(client, srv, "/transactions", body).await
}

#[tokio::test(flavor = "multi_thread")]
async fn staff_header_required_for_everything_but_health() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(srv.url("/whoami")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(srv.url("/transactions"))
        .json(&json!({ "transaction_type": "RESTOCK", "variant_id": 1, "quantity": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let (status, body) = get(&client, &srv, "/whoami").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["staff_id"], STAFF);
}

#[tokio::test(flavor = "multi_thread")]
async fn restock_allocate_transfer_sale_scenario() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = apply(&client, &srv, json!({ "transaction_type": "RESTOCK", "variant_id": 10, "quantity": 100 })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["transaction"]["staff_id"], STAFF);
    assert_eq!(body["central"]["available_quantity"], 100);

    let (status, _) = apply(&client, &srv, json!({ "transaction_type": "ALLOCATE", "variant_id": 10, "quantity": 30 })).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = apply(
        &client,
        &srv,
        json!({ "transaction_type": "TRANSFER_TO_DEALER", "variant_id": 10, "quantity": 30, "to_dealer_id": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = apply(
        &client,
        &srv,
        json!({ "transaction_type": "SALE", "variant_id": 10, "quantity": 5, "from_dealer_id": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["dealer"]["available_quantity"], 25);

    let (status, view) = get(&client, &srv, "/inventory/10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["central_available"], 70);
    assert_eq!(view["central_allocated"], 0);
    assert_eq!(view["total_in_system"], 95);
    assert_eq!(view["per_dealer"][0]["dealer_id"], 1);
    assert_eq!(view["per_dealer"][0]["allocated"], 30);
    assert_eq!(view["per_dealer"][0]["available"], 25);

    // Oversell is rejected and leaves the dealer untouched.
    let (status, body) = apply(
        &client,
        &srv,
        json!({ "transaction_type": "SALE", "variant_id": 10, "quantity": 30, "from_dealer_id": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "insufficient_stock");

    let (_, view) = get(&client, &srv, "/inventory/10").await;
    assert_eq!(view["per_dealer"][0]["available"], 25);

    let (status, ledger) = get(&client, &srv, "/inventory/10/ledger?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ledger["total"], 4);
    assert_eq!(ledger["items"].as_array().unwrap().len(), 2);

    let (status, report) = get(&client, &srv, "/inventory/10/reconciliation").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["consistent"], true);
    assert_eq!(report["ledger_net"], 95);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_requests_map_to_json_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = get(&client, &srv, "/inventory/404").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = get(&client, &srv, "/inventory/not-a-number").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_id");

    let (status, body) = apply(&client, &srv, json!({ "transaction_type": "RESTOCK", "variant_id": 1, "quantity": 0 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    // A sale against a dealer row that was never created.
    let (status, body) = apply(
        &client,
        &srv,
        json!({ "transaction_type": "SALE", "variant_id": 1, "quantity": 1, "from_dealer_id": 9 }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_reference");
}

#[tokio::test(flavor = "multi_thread")]
async fn order_allocation_is_idempotent_per_order() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    apply(&client, &srv, json!({ "transaction_type": "RESTOCK", "variant_id": 3, "quantity": 10 })).await;

    let order = json!({ "items": [{ "variant_id": 3, "quantity": 4 }] });
    let (status, first) = post(&client, &srv, "/orders/SO-1/allocate", order.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["already_allocated"], false);
    assert_eq!(first["transactions"][0]["reference_id"], "SO-1");

    let (status, second) = post(&client, &srv, "/orders/SO-1/allocate", order).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["already_allocated"], true);
    assert_eq!(second["transactions"][0]["transaction_id"], first["transactions"][0]["transaction_id"]);

    let (_, view) = get(&client, &srv, "/inventory/3").await;
    assert_eq!(view["central_allocated"], 4);
    assert_eq!(view["central_available"], 6);

    let (status, body) = post(&client, &srv, "/orders/SO-2/allocate", json!({ "items": [{ "variant_id": 3, "quantity": 7 }] })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "insufficient_stock");
}

#[tokio::test(flavor = "multi_thread")]
async fn alerts_open_once_and_follow_their_lifecycle() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    apply(&client, &srv, json!({ "transaction_type": "RESTOCK", "variant_id": 5, "quantity": 40 })).await;
    let (status, _) = put(&client, &srv, "/inventory/5/reorder-level", json!({ "reorder_level": 50 })).await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..3 {
        let (status, _) = post(&client, &srv, "/alerts/scan", json!({})).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, alerts) = get(&client, &srv, "/alerts").await;
    assert_eq!(status, StatusCode::OK);
    let alerts = alerts.as_array().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["alert_type"], "LOW_STOCK");
    assert_eq!(alerts[0]["status"], "NEW");
    assert_eq!(alerts[0]["current_stock"], 40);
    assert_eq!(alerts[0]["threshold"], 50);

    let id = alerts[0]["alert_id"].as_u64().unwrap();
    let (status, acked) = post(&client, &srv, &format!("/alerts/{id}/acknowledge"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(acked["status"], "ACKNOWLEDGED");

    let (status, body) = post(&client, &srv, &format!("/alerts/{id}/acknowledge"), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = post(&client, &srv, &format!("/alerts/{id}/resolve"), json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (_, active) = get(&client, &srv, "/alerts").await;
    assert!(active.as_array().unwrap().is_empty());
    let (_, resolved) = get(&client, &srv, "/alerts?status=resolved").await;
    assert_eq!(resolved.as_array().unwrap().len(), 1);

    let (status, _) = post(&client, &srv, "/alerts/999/resolve", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn regional_rollup_follows_published_events() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, _) = put(&client, &srv, "/directory/dealers/7", json!({ "name": "North Star Auto", "region": "NORTH" })).await;
    assert_eq!(status, StatusCode::OK);

    apply(&client, &srv, json!({ "transaction_type": "RESTOCK", "variant_id": 8, "quantity": 20 })).await;
    apply(&client, &srv, json!({ "transaction_type": "ALLOCATE", "variant_id": 8, "quantity": 5 })).await;
    apply(
        &client,
        &srv,
        json!({ "transaction_type": "TRANSFER_TO_DEALER", "variant_id": 8, "quantity": 5, "to_dealer_id": 7 }),
    )
    .await;

    // The rollup is fed through the outbox relay and the bus; poll until it catches up.
    let mut north = Value::Null;
    for _ in 0..100 {
        let (_, totals) = get(&client, &srv, "/inventory/regions").await;
        if let Some(row) = totals
            .as_array()
            .and_then(|rows| rows.iter().find(|r| r["region"] == "NORTH" && r["allocated_quantity"] == 5))
        {
            north = row.clone();
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(north["variant_id"], 8);
    assert_eq!(north["available_quantity"], 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn vehicle_transfer_workflow_moves_units_on_delivery() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let vins = ["1HGCM82633A004352", "2T1BURHE0JC043821"];
    let (status, body) = post(&client, &srv, "/vehicles/receive", json!({ "variant_id": 12, "vins": vins })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["received"], 2);

    let (status, transfer) = post(
        &client,
        &srv,
        "/transfers",
        json!({ "variant_id": 12, "to_dealer_id": 4, "vins": [vins[0]] }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(transfer["status"], "PENDING");
    let id = transfer["request_id"].as_str().unwrap().to_string();

    // Delivery before dispatch is an invalid step.
    let (status, _) = post(&client, &srv, &format!("/transfers/{id}/deliver"), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    for step in ["confirm", "dispatch"] {
        let (status, _) = post(&client, &srv, &format!("/transfers/{id}/{step}"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (_, view) = get(&client, &srv, "/inventory/12").await;
    assert_eq!(view["central_available"], 2);

    let (status, delivered) = post(&client, &srv, &format!("/transfers/{id}/deliver"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(delivered["status"], "DELIVERED");

    let (_, vehicle) = get(&client, &srv, &format!("/vehicles/{}", vins[0])).await;
    assert_eq!(vehicle["location"]["kind"], "dealer");
    assert_eq!(vehicle["location"]["dealer_id"], 4);

    let (_, view) = get(&client, &srv, "/inventory/12").await;
    assert_eq!(view["central_available"], 1);
    assert_eq!(view["per_dealer"][0]["available"], 1);

    let (status, sold) = post(&client, &srv, &format!("/vehicles/{}/sell", vins[0]), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sold["status"], "SOLD");

    let (_, view) = get(&client, &srv, "/inventory/12").await;
    assert_eq!(view["per_dealer"][0]["available"], 0);
    assert_eq!(view["total_in_system"], 1);
}
