//! X (formerly Twitter) publisher using the v2 `POST /2/tweets` endpoint

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::XConfig;
use crate::error::{ConfigError, PlatformError, Result};
use crate::platforms::oauth1::OAuth1Credentials;
use crate::platforms::{
    build_client, error_from_response, http_client_builder, trim_base_url, unset_variables,
    PublishResult, Publisher,
};
use crate::types::{PlatformKind, Published, ScheduledPost};

pub const DEFAULT_API_BASE: &str = "https://api.x.com";

#[derive(Debug)]
enum XAuth {
    /// OAuth 2.0 user-context access token
    Bearer(SecretString),
    OAuth1(OAuth1Credentials),
}

pub struct XPublisher {
    client: reqwest::Client,
    api_base: String,
    auth: XAuth,
}

#[derive(Debug, Deserialize)]
struct CreateTweetResponse {
    data: CreatedTweet,
}

#[derive(Debug, Deserialize)]
struct CreatedTweet {
    id: String,
}

impl XPublisher {
    /// Prefers a bearer token; falls back to the four OAuth 1.0a values
    pub fn from_config(config: &XConfig) -> Result<Self> {
        let api_base = trim_base_url(config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE));

        let auth = match config.bearer_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => XAuth::Bearer(SecretString::from(token.to_string())),
            _ => {
                let missing = unset_variables(&[
                    ("X_API_KEY", &config.api_key),
                    ("X_API_SECRET", &config.api_secret),
                    ("X_ACCESS_TOKEN", &config.access_token),
                    ("X_ACCESS_TOKEN_SECRET", &config.access_token_secret),
                ]);

                match (
                    &config.api_key,
                    &config.api_secret,
                    &config.access_token,
                    &config.access_token_secret,
                ) {
                    (Some(key), Some(secret), Some(token), Some(token_secret))
                        if missing.is_empty() =>
                    {
                        XAuth::OAuth1(OAuth1Credentials {
                            consumer_key: key.trim().to_string(),
                            consumer_secret: SecretString::from(secret.trim().to_string()),
                            token: token.trim().to_string(),
                            token_secret: SecretString::from(token_secret.trim().to_string()),
                        })
                    }
                    _ => {
                        return Err(ConfigError::MissingCredential {
                            platform: PlatformKind::X.to_string(),
                            variables: vec![
                                "X_BEARER_TOKEN".to_string(),
                                missing.join(" + "),
                            ],
                        }
                        .into())
                    }
                }
            }
        };

        Ok(Self {
            client: build_client(http_client_builder())?,
            api_base,
            auth,
        })
    }

    fn tweets_url(&self) -> String {
        format!("{}/2/tweets", self.api_base)
    }

    fn authorization(&self, url: &str) -> std::result::Result<String, PlatformError> {
        match &self.auth {
            XAuth::Bearer(token) => Ok(format!("Bearer {}", token.expose_secret())),
            XAuth::OAuth1(credentials) => credentials.authorization_header("POST", url, &[]),
        }
    }

    /// Public permalink for a tweet ID
    pub fn status_url(id: &str) -> String {
        format!("https://x.com/i/web/status/{}", id)
    }
}

#[async_trait]
impl Publisher for XPublisher {
    fn platform(&self) -> PlatformKind {
        PlatformKind::X
    }

    async fn publish(&self, post: &ScheduledPost) -> PublishResult {
        self.validate_content(&post.content)?;

        let url = self.tweets_url();
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.authorization(&url)?)
            .json(&serde_json::json!({ "text": post.content }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response("X", response).await);
        }

        let body = response.text().await?;
        let created: CreateTweetResponse = serde_json::from_str(&body).map_err(|e| {
            PlatformError::Posting(format!("unexpected X response ({}): {}", e, body))
        })?;

        tracing::debug!(tweet_id = %created.data.id, "Created tweet");
        Ok(Published {
            url: Some(Self::status_url(&created.data.id)),
            platform_post_id: created.data.id,
        })
    }
}
