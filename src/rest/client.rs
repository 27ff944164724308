use crate::auth::Credential;
use crate::error::{PushError, Result};
use crate::types::{Subscription, SubscriptionIdResponse};
use log::warn;
use reqwest::{Client as HttpClient, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

/// A client for the push service control-plane REST API.
///
/// The base URL is normally derived from the websocket endpoint: the service
/// exposes its HTTP surface on the same host, with `wss` mapped to `https`.
///
/// # Examples
///
/// ```no_run
/// use pushstream_connector_rs::rest::Client;
/// use pushstream_connector_rs::auth::Credential;
/// use url::Url;
///
/// #[tokio::main]
/// async fn main() {
///     let ws_url = Url::parse("wss://push.example.com/v0").unwrap();
///     let client = Client::from_ws_endpoint(&ws_url, None).expect("Failed to create client");
///     let cred = Credential::Secret("your_secret".to_string());
///
///     let config = client.fetch_config(&cred).await.expect("Failed to fetch config");
///     println!("push config: {}", config);
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    http_client: HttpClient,
    base_url: Url,
}

impl Client {
    /// Creates a client against an explicit HTTP base URL.
    pub fn new(base_url: Url, timeout_sec: Option<u64>) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SECONDS));
        let http_client = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// Creates a client from the websocket endpoint, rewriting the scheme
    /// (`wss` becomes `https`, `ws` becomes `http`).
    pub fn from_ws_endpoint(ws_url: &Url, timeout_sec: Option<u64>) -> Result<Self> {
        Self::new(http_base_from_ws(ws_url)?, timeout_sec)
    }

    /// The underlying HTTP client, reused for token minting.
    pub fn http(&self) -> &HttpClient {
        &self.http_client
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        // Url::join would drop the version path segment ("/v0") for absolute
        // paths, so build by string concatenation like the upstream service
        // examples do.
        let joined = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path);
        Ok(Url::parse(&joined)?)
    }

    /// GET `/config`: the push service configuration for this account.
    pub async fn fetch_config(&self, credential: &Credential) -> Result<Value> {
        let url = self.endpoint("/config")?;
        let response = credential
            .apply_http(self.http_client.get(url))
            .send()
            .await?;
        Self::expect_json(response).await
    }

    /// GET `/subscription`: all subscriptions registered for this account.
    pub async fn list_subscriptions(&self, credential: &Credential) -> Result<Value> {
        let url = self.endpoint("/subscription")?;
        let response = credential
            .apply_http(self.http_client.get(url))
            .send()
            .await?;
        Self::expect_json(response).await
    }

    /// POST `/subscription`: registers a subscription specification.
    ///
    /// Returns the subscription id and whether it already existed. The server
    /// answers 422 with the existing id in the `Location` header when a
    /// subscription with the same name is already registered; that is a normal
    /// outcome, not a failure.
    pub async fn register_subscription(
        &self,
        credential: &Credential,
        subscription: &Subscription,
    ) -> Result<(Uuid, bool)> {
        let url = self.endpoint("/subscription")?;
        let response = credential
            .apply_http(self.http_client.post(url).json(subscription))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            let existing = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| Uuid::parse_str(v).ok());
            return match existing {
                Some(id) => Ok((id, true)),
                // The server always sets a valid id in Location on 422.
                None => Err(PushError::SubscriptionConflict),
            };
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::UnexpectedStatus { status, body });
        }

        let parsed: SubscriptionIdResponse = response.json().await?;
        Ok((parsed.id, false))
    }

    /// PUT `/subscription/{id}`: replaces the filter set of an existing
    /// subscription. A 422 response signals a name conflict.
    pub async fn update_subscription(
        &self,
        credential: &Credential,
        id: Uuid,
        subscription: &Subscription,
    ) -> Result<(Option<Uuid>, bool)> {
        let url = self.endpoint(&format!("/subscription/{}", id))?;
        let response = credential
            .apply_http(self.http_client.put(url).json(subscription))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Ok((None, true));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::UnexpectedStatus { status, body });
        }

        let parsed: SubscriptionIdResponse = response.json().await?;
        Ok((Some(parsed.id), false))
    }

    /// DELETE `/subscription/{id_or_name}`.
    pub async fn delete_subscription(
        &self,
        credential: &Credential,
        id_or_name: &str,
    ) -> Result<()> {
        let url = self.endpoint(&format!("/subscription/{}", id_or_name))?;
        let response = credential
            .apply_http(self.http_client.delete(url))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::UnexpectedStatus { status, body });
        }
        Ok(())
    }

    async fn expect_json(response: Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Control-plane request failed: {} {}", status, body);
            return Err(PushError::UnexpectedStatus { status, body });
        }
        Ok(response.json().await?)
    }
}

/// Rewrites a websocket URL into its HTTP sibling (`wss`→`https`, `ws`→`http`).
pub fn http_base_from_ws(ws_url: &Url) -> Result<Url> {
    let mut url = ws_url.clone();
    let scheme = match ws_url.scheme() {
        "wss" => "https",
        _ => "http",
    };
    url.set_scheme(scheme)
        .map_err(|_| PushError::WebsocketError(format!("cannot rewrite scheme of {}", ws_url)))?;
    Ok(url)
}
