//! HTTP collaborators over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::application::ports::{CollaboratorError, MarketStatusPort, SnapshotPort, SnapshotQuote};
use crate::domain::instrument::{InstrumentKey, format_expiry};

/// Build the shared HTTP client with a per-request timeout.
///
/// # Errors
///
/// Returns `CollaboratorError::Request` if the client cannot be built.
pub fn build_http_client(timeout: Duration) -> Result<Client, CollaboratorError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollaboratorError::Request(e.to_string()))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, CollaboratorError> {
    let status = response.status();
    if !status.is_success() {
        return Err(CollaboratorError::Status(status.as_u16()));
    }
    response
        .json()
        .await
        .map_err(|e| CollaboratorError::Decode(e.to_string()))
}

fn request_error(e: &reqwest::Error) -> CollaboratorError {
    if e.is_timeout() {
        CollaboratorError::Request("timed out".to_string())
    } else {
        CollaboratorError::Request(e.to_string())
    }
}

// =============================================================================
// Market Status
// =============================================================================

#[derive(Debug, Deserialize)]
struct MarketStatusResponse {
    #[serde(rename = "isOpen", alias = "is_open")]
    is_open: bool,
}

/// Market-status endpoint client.
#[derive(Debug, Clone)]
pub struct HttpMarketStatusClient {
    client: Client,
    url: String,
}

impl HttpMarketStatusClient {
    /// Create a client for `url`.
    #[must_use]
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl MarketStatusPort for HttpMarketStatusClient {
    async fn is_open(&self) -> Result<bool, CollaboratorError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        let body: MarketStatusResponse = decode(response).await?;
        Ok(body.is_open)
    }
}

// =============================================================================
// Snapshot Quotes
// =============================================================================

/// Snapshot-quote endpoint client.
///
/// Instruments are passed as query parameters: `exchange`, `symbol` and
/// `productType` for simple keys; `symbol`, `expiry`, `right` and `strike`
/// for derivatives.
#[derive(Debug, Clone)]
pub struct HttpSnapshotClient {
    client: Client,
    url: String,
}

impl HttpSnapshotClient {
    /// Create a client for `url`.
    #[must_use]
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

fn query_params(key: &InstrumentKey) -> Vec<(&'static str, String)> {
    match key {
        InstrumentKey::Simple {
            symbol,
            exchange,
            product_type,
        } => vec![
            ("exchange", exchange.clone()),
            ("symbol", symbol.clone()),
            ("productType", product_type.clone()),
        ],
        InstrumentKey::Derivative {
            underlying,
            expiry,
            side,
            strike,
        } => vec![
            ("symbol", underlying.clone()),
            ("expiry", format_expiry(*expiry)),
            ("right", side.wire_right().to_string()),
            ("strike", strike.to_string()),
        ],
    }
}

#[async_trait]
impl SnapshotPort for HttpSnapshotClient {
    async fn fetch(&self, key: &InstrumentKey) -> Result<SnapshotQuote, CollaboratorError> {
        let response = self
            .client
            .get(&self.url)
            .query(&query_params(key))
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        decode(response).await
    }
}
