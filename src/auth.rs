use crate::error::{PushError, Result};
use crate::types::AccessTokenResponse;
use chrono::Utc;
use log::info;
use url::Url;

/// Header carrying the static shared secret on upgrade and REST requests.
pub const SECRET_HEADER: &str = "push-secret";

/// Gets the current UTC timestamp in milliseconds since the Unix epoch.
pub fn get_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Which kind of credential a session was constructed with. The retry policy
/// only cares about whether the credential can be refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Static shared secret; never expires within a session's lifetime.
    Secret,
    /// Minted bearer token; may expire and can be re-minted on demand.
    Token,
}

/// Authentication material for both the control-plane HTTP API and the
/// websocket upgrade. A session picks one variant at construction; the session
/// and retry logic are written once against this type.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Sent as the `push-secret` request header.
    Secret(String),
    /// Sent as the `access_token` query parameter; re-minted from the client
    /// id/secret pair when the server classifies a request as unauthorized.
    Token {
        client_id: String,
        client_secret: String,
        /// Base URL of the token-minting API, e.g. `https://api.example.com/v2`.
        token_url: Url,
        /// The currently held token, if one has been minted or supplied.
        access_token: Option<String>,
    },
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Secret(_) => CredentialKind::Secret,
            Credential::Token { .. } => CredentialKind::Token,
        }
    }

    /// Creates a token credential from an already-minted access token. The
    /// token cannot be refreshed without a client id/secret, so expiry is
    /// fatal for sessions built this way.
    pub fn from_access_token(token_url: Url, access_token: impl Into<String>) -> Self {
        Credential::Token {
            client_id: String::new(),
            client_secret: String::new(),
            token_url,
            access_token: Some(access_token.into()),
        }
    }

    /// Makes sure a token credential actually holds a token, minting one if
    /// needed. No-op for the secret variant.
    pub async fn ensure_token(&mut self, http: &reqwest::Client) -> Result<()> {
        if let Credential::Token {
            access_token: token @ None,
            client_id,
            client_secret,
            token_url,
        } = self
        {
            let (minted, ttl) = mint_access_token(http, token_url, client_id, client_secret).await?;
            info!("Minted access token (expires in {}s)", ttl);
            *token = Some(minted);
        }
        Ok(())
    }

    /// Discards the held token and mints a fresh one. Fails for the secret
    /// variant and for token credentials without a client id/secret pair.
    pub async fn refresh(&mut self, http: &reqwest::Client) -> Result<()> {
        match self {
            Credential::Secret(_) => Err(PushError::AuthenticationError(
                "static secret credential cannot be refreshed".to_string(),
            )),
            Credential::Token {
                client_id,
                client_secret,
                token_url,
                access_token,
            } => {
                if client_id.is_empty() {
                    return Err(PushError::AuthenticationError(
                        "cannot refresh: no client id/secret configured".to_string(),
                    ));
                }
                let (minted, ttl) =
                    mint_access_token(http, token_url, client_id, client_secret).await?;
                info!("Refreshed access token (expires in {}s)", ttl);
                *access_token = Some(minted);
                Ok(())
            }
        }
    }

    /// Attaches this credential to a control-plane request.
    pub fn apply_http(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credential::Secret(secret) => req.header(SECRET_HEADER, secret),
            Credential::Token { access_token, .. } => req.query(&[(
                "access_token",
                access_token.as_deref().unwrap_or_default(),
            )]),
        }
    }

    /// Attaches this credential to a websocket upgrade URL. Returns the header
    /// pair to set on the upgrade request, if the variant uses one.
    pub fn apply_ws(&self, url: &mut Url) -> Option<(&'static str, String)> {
        match self {
            Credential::Secret(secret) => Some((SECRET_HEADER, secret.clone())),
            Credential::Token { access_token, .. } => {
                url.query_pairs_mut().append_pair(
                    "access_token",
                    access_token.as_deref().unwrap_or_default(),
                );
                None
            }
        }
    }
}

/// Mints an access token from a client id/secret pair via the OAuth
/// client-credentials flow. Returns the token and its TTL in seconds.
pub async fn mint_access_token(
    http: &reqwest::Client,
    token_url: &Url,
    client_id: &str,
    client_secret: &str,
) -> Result<(String, u64)> {
    // Keep the version path segment intact; Url::join would replace it.
    let url = Url::parse(&format!(
        "{}/oauth/access_token",
        token_url.as_str().trim_end_matches('/')
    ))?;
    let form = [
        ("client_id", client_id),
        ("client_secret", client_secret),
        ("grant_type", "client_credentials"),
    ];

    let response = http.post(url).form(&form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PushError::UnexpectedStatus { status, body });
    }

    let parsed: AccessTokenResponse = response.json().await?;
    Ok((parsed.access_token, parsed.expires_in))
}
