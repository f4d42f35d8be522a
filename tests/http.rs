//! HTTP surface over a real loopback listener.

mod common;

use common::*;
use serde_json::Value;
use std::net::SocketAddr;
use tariff_extract::server::{self, AppState};
use tariff_extract::{Pipeline, TariffRecord, TariffStore, VisionCallError, VisionSlot};

async fn spawn(pipeline: Pipeline) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(pipeline);
    tokio::spawn(server::serve(listener, state, std::future::pending()));
    addr
}

#[tokio::test]
async fn upload_then_fetch() {
    let addr = spawn(india_pipeline(
        FakeModel::always(Ok(cosco_reply(50.0))),
        TariffStore::in_memory().unwrap(),
    ))
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/upload?country=India"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let summary: Value = resp.json().await.unwrap();
    assert_eq!(summary["country"], "India");
    assert_eq!(summary["records_persisted"], 1);
    assert!(summary["errors"].as_array().unwrap().is_empty());

    let records: Value = client
        .get(format!("http://{addr}/fetch"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["line"], "COSCO");
    assert_eq!(records[0]["port"], "Nhava Sheva");
    assert_eq!(records[0]["demurrage"]["20GP"]["6-10"], 50.0);

    let filtered: Value = client
        .get(format!("http://{addr}/fetch?country=Kenya"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(filtered.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn fetch_returns_the_stored_record_unchanged() {
    let store = TariffStore::in_memory().unwrap();
    let addr = spawn(scenario_a_pipeline(
        FakeModel::always(Ok(scenario_a_reply())),
        store.clone(),
    ))
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/upload?country=India"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = client
        .get(format!("http://{addr}/fetch"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r["country"], "India");
    assert_eq!(r["port"], "Nhava Sheva");
    assert_eq!(r["line"], "COSCO");
    assert_eq!(r["equipment"], "20GP");
    assert_eq!(r["currency"], "USD");
    assert_eq!(r["free_days"], serde_json::json!({ "0-5": 5, "6-10": 3 }));
    assert_eq!(
        r["demurrage"],
        serde_json::json!({ "20GP": { "0-5": 0.0, "6-10": 50.0 } })
    );

    let fetched: Vec<TariffRecord> = serde_json::from_value(body).unwrap();
    assert_eq!(fetched, store.fetch_all().unwrap());
}

#[tokio::test]
async fn request_errors_map_to_4xx() {
    let addr = spawn(india_pipeline(
        FakeModel::always(Ok("[]".into())),
        TariffStore::in_memory().unwrap(),
    ))
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/upload"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_country");

    let resp = client
        .post(format!("http://{addr}/upload?country=Atlantis"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unknown_country");
}

#[tokio::test]
async fn zero_documents_is_422_with_summary() {
    let addr = spawn(pipeline(
        test_config(),
        FakeSource::new("India", &[]),
        FakeDetector::with(&[]),
        VisionSlot::Ready(FakeModel::always(Ok("[]".into()))),
        TariffStore::in_memory().unwrap(),
    ))
    .await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/upload?country=India"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "no_documents");
    assert_eq!(body["summary"]["documents_processed"], 0);
}

#[tokio::test]
async fn missing_credentials_is_503() {
    let addr = spawn(pipeline(
        test_config(),
        FakeSource::new("India", &["india.pdf"]),
        FakeDetector::with(&[(100.0, 100.0, 400.0, 200.0, 0.92)]),
        VisionSlot::Unavailable {
            provider: "openai".into(),
            hint: "set OPENAI_API_KEY".into(),
        },
        TariffStore::in_memory().unwrap(),
    ))
    .await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/upload?country=India"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "provider_not_configured");
}

#[tokio::test]
async fn quarantine_lists_failed_regions() {
    let addr = spawn(india_pipeline(
        FakeModel::always(Err(VisionCallError::Timeout(60))),
        TariffStore::in_memory().unwrap(),
    ))
    .await;
    let client = reqwest::Client::new();

    let summary: Value = client
        .post(format!("http://{addr}/upload?country=India"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["regions_quarantined"], 1);
    assert_eq!(summary["errors"][0]["stage"], "parse");

    let items: Value = client
        .get(format!("http://{addr}/quarantine"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["status"], "retry_exhausted");
    assert_eq!(items[0]["attempts"], 3);
}

#[tokio::test]
async fn health_reports_version_and_count() {
    let addr = spawn(india_pipeline(
        FakeModel::always(Ok("[]".into())),
        TariffStore::in_memory().unwrap(),
    ))
    .await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["records"], 0);
}
