//! Collaborator Adapters
//!
//! HTTP clients for the request/response services the stream client
//! depends on: market status and one-shot snapshot quotes.

mod http;

pub use http::{HttpMarketStatusClient, HttpSnapshotClient, build_http_client};
