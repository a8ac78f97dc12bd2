//! OAuth token refresh
//!
//! `TokenRefresher` is the seam the refresh manager calls through; the
//! production implementation POSTs `grant_type=refresh_token` to a standard
//! OAuth2 token endpoint.

use common::{BoxFuture, Secret};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. Providers that
/// do not rotate refresh tokens omit `refresh_token`; the old one stays valid.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// Exchanges a refresh token for a new access token.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenResponse>>;
}

/// OAuth2 refresh-token grant against a configured endpoint.
pub struct OAuthRefresher {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: Option<Secret<String>>,
}

impl OAuthRefresher {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<Secret<String>>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }
}

impl TokenRefresher for OAuthRefresher {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenResponse>> {
        Box::pin(async move {
            let mut form = vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
            ];
            if let Some(secret) = &self.client_secret {
                form.push(("client_secret", secret.expose().as_str()));
            }

            let response = self
                .client
                .post(&self.endpoint)
                .form(&form)
                .send()
                .await
                .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Err(classify_failure(status.as_u16(), &body));
            }

            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
        })
    }
}

/// Map a non-success token endpoint response to an error.
///
/// A revoked or expired refresh token surfaces as `invalid_grant` (RFC 6749
/// §5.2, usually with 400) or as 401/403; those are terminal. Everything else
/// is retried on the next cycle.
pub fn classify_failure(status: u16, body: &str) -> Error {
    if status == 401 || status == 403 || body.contains("invalid_grant") {
        return Error::InvalidGrant(format!("token endpoint returned {status}: {body}"));
    }
    Error::TokenExchange(format!("token endpoint returned {status}: {body}"))
}
