//! HTTP Collaborator Integration Tests
//!
//! Market-status and snapshot clients against a mock HTTP server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal_macros::dec;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use quote_stream_client::application::ports::{
    CollaboratorError, MarketStatusPort, QuoteCache, SnapshotPort,
};
use quote_stream_client::infrastructure::collaborators::{
    HttpMarketStatusClient, HttpSnapshotClient, build_http_client,
};
use quote_stream_client::infrastructure::persistence::InMemoryQuoteCache;
use quote_stream_client::{InstrumentKey, OptionSide, QuoteStatus, QuoteStore, SnapshotPoller};

fn http() -> reqwest::Client {
    build_http_client(Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn market_status_accepts_both_field_spellings() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/market/open"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"isOpen": true})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/market/closed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"is_open": false})))
        .mount(&server)
        .await;

    let open = HttpMarketStatusClient::new(http(), format!("{}/market/open", server.uri()));
    let closed = HttpMarketStatusClient::new(http(), format!("{}/market/closed", server.uri()));

    assert!(open.is_open().await.unwrap());
    assert!(!closed.is_open().await.unwrap());
}

#[tokio::test]
async fn market_status_error_statuses_surface() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = HttpMarketStatusClient::new(http(), server.uri());
    assert!(matches!(
        client.is_open().await,
        Err(CollaboratorError::Status(503))
    ));
}

#[tokio::test]
async fn market_status_rejects_unexpected_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "open"})))
        .mount(&server)
        .await;

    let client = HttpMarketStatusClient::new(http(), server.uri());
    assert!(matches!(
        client.is_open().await,
        Err(CollaboratorError::Decode(_))
    ));
}

#[tokio::test]
async fn snapshot_sends_simple_key_params() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/snapshot"))
        .and(query_param("exchange", "NSE"))
        .and(query_param("symbol", "RELIANCE"))
        .and(query_param("productType", "cash"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ltp": "2901.5",
            "close": "2880",
            "status": "live"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpSnapshotClient::new(http(), format!("{}/snapshot", server.uri()));
    let snapshot = client
        .fetch(&InstrumentKey::simple("RELIANCE", "NSE", "cash"))
        .await
        .unwrap();

    assert_eq!(snapshot.ltp, Some(dec!(2901.5)));
    assert!(snapshot.is_live());
}

#[tokio::test]
async fn snapshot_sends_derivative_params() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("symbol", "NIFTY"))
        .and(query_param("expiry", "2024-06-27"))
        .and(query_param("right", "call"))
        .and(query_param("strike", "22000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ltp": "101.25"})))
        .expect(1)
        .mount(&server)
        .await;

    let key = InstrumentKey::derivative(
        "NIFTY",
        NaiveDate::from_ymd_opt(2024, 6, 27).unwrap(),
        OptionSide::Call,
        dec!(22000.00),
    );
    let client = HttpSnapshotClient::new(http(), server.uri());
    let snapshot = client.fetch(&key).await.unwrap();
    assert_eq!(snapshot.ltp, Some(dec!(101.25)));
}

#[tokio::test]
async fn poller_applies_mixed_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("symbol", "TCS"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ltp": "3500",
            "close": "3450",
            "status": "live"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("symbol", "INFY"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = Arc::new(QuoteStore::default());
    let cache = Arc::new(InMemoryQuoteCache::new());
    let snapshots = Arc::new(HttpSnapshotClient::new(http(), server.uri()));
    let poller = SnapshotPoller::new(snapshots, Arc::clone(&store), cache.clone());

    let tcs = InstrumentKey::simple("TCS", "NSE", "cash");
    let infy = InstrumentKey::simple("INFY", "NSE", "cash");
    let results = poller.fetch(vec![tcs.clone(), infy.clone()]).await;
    let report = poller.apply(results);

    assert_eq!(report.applied, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(store.get_or_empty(&tcs).status, QuoteStatus::Live);
    assert_eq!(store.get_or_empty(&infy).status, QuoteStatus::NoData);
    assert!(cache.load_all().unwrap().contains_key(&tcs.canonical()));
}
