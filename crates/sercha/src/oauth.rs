//! OAuth2 refresh-token exchange over HTTP.
//!
//! Client registrations come from the `[oauth.<source_type>]` config
//! sections. A refresh is a form-encoded `grant_type=refresh_token` POST to
//! the registration's `token_url`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use sercha_core::models::{Credentials, OAuthTokens, Source};
use sercha_core::tasks::TokenRefresher;
use sercha_core::{Error, Result};

use crate::config::OAuthClientConfig;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_tokens(self) -> OAuthTokens {
        OAuthTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expiry: self
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        }
    }
}

pub struct HttpTokenRefresher {
    client: reqwest::Client,
    clients: HashMap<String, OAuthClientConfig>,
}

impl HttpTokenRefresher {
    pub fn new(clients: HashMap<String, OAuthClientConfig>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, clients })
    }

    fn client_secret(config: &OAuthClientConfig) -> Result<Option<String>> {
        match &config.client_secret_env {
            None => Ok(None),
            Some(var) => std::env::var(var).map(Some).map_err(|_| {
                Error::TokenRefreshFailed(format!("environment variable {var} not set"))
            }),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, source: &Source, credentials: &Credentials) -> Result<OAuthTokens> {
        let config = self.clients.get(&source.source_type).ok_or_else(|| {
            Error::TokenRefreshFailed(format!(
                "no oauth client configured for source type {}",
                source.source_type
            ))
        })?;
        let refresh_token = credentials
            .oauth()
            .and_then(|t| t.refresh_token.as_deref())
            .ok_or_else(|| {
                Error::TokenRefreshFailed(format!("source {} has no refresh token", source.id))
            })?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", config.client_id.clone()),
        ];
        if let Some(secret) = Self::client_secret(config)? {
            form.push(("client_secret", secret));
        }

        let response = self
            .client
            .post(&config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::TokenRefreshFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TokenRefreshFailed(format!("{status}: {body}")));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::TokenRefreshFailed(format!("invalid token response: {e}")))?;
        Ok(tokens.into_tokens())
    }
}
