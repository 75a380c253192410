//! WordPress publisher using the REST API with application passwords

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::WordpressConfig;
use crate::error::{ConfigError, CrosspostError, PlatformError, Result};
use crate::platforms::note::derive_title;
use crate::platforms::{
    build_client, error_from_response, http_client_builder, trim_base_url, unset_variables,
    PublishResult, Publisher,
};
use crate::types::{PlatformKind, Published, ScheduledPost};

const VALID_STATUSES: [&str; 4] = ["publish", "draft", "private", "pending"];

pub struct WordpressPublisher {
    client: reqwest::Client,
    site_url: String,
    username: String,
    app_password: SecretString,
    default_status: String,
}

#[derive(Debug, Deserialize)]
struct CreatedPost {
    id: u64,
    #[serde(default)]
    link: Option<String>,
}

impl WordpressPublisher {
    pub fn from_config(config: &WordpressConfig) -> Result<Self> {
        let missing = unset_variables(&[
            ("WORDPRESS_URL", &config.site_url),
            ("WORDPRESS_USERNAME", &config.username),
            ("WORDPRESS_APP_PASSWORD", &config.app_password),
        ]);

        let (Some(site_url), Some(username), Some(app_password)) =
            (&config.site_url, &config.username, &config.app_password)
        else {
            return Err(missing_credential(missing));
        };
        if !missing.is_empty() {
            return Err(missing_credential(missing));
        }

        let site_url = trim_base_url(site_url);
        if !site_url.starts_with("http://") && !site_url.starts_with("https://") {
            return Err(CrosspostError::InvalidInput(format!(
                "WORDPRESS_URL must start with http:// or https:// (got '{}')",
                site_url
            )));
        }

        let default_status = config
            .post_status
            .clone()
            .unwrap_or_else(|| "publish".to_string());
        if !VALID_STATUSES.contains(&default_status.as_str()) {
            return Err(ConfigError::MissingField(format!(
                "wordpress.post_status must be one of {}",
                VALID_STATUSES.join(", ")
            ))
            .into());
        }

        Ok(Self {
            client: build_client(http_client_builder())?,
            site_url,
            username: username.trim().to_string(),
            // Application passwords are displayed with spaces; WordPress accepts either form
            app_password: SecretString::from(app_password.trim().to_string()),
            default_status,
        })
    }

    fn posts_url(&self) -> String {
        format!("{}/wp-json/wp/v2/posts", self.site_url)
    }

    fn status_for(&self, post: &ScheduledPost) -> String {
        post.metadata_str("status")
            .filter(|s| VALID_STATUSES.contains(s))
            .unwrap_or(self.default_status.as_str())
            .to_string()
    }
}

fn missing_credential(variables: Vec<String>) -> CrosspostError {
    ConfigError::MissingCredential {
        platform: PlatformKind::Wordpress.to_string(),
        variables: vec![variables.join(" + ")],
    }
    .into()
}

#[async_trait]
impl Publisher for WordpressPublisher {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Wordpress
    }

    async fn publish(&self, post: &ScheduledPost) -> PublishResult {
        self.validate_content(&post.content)?;

        let response = self
            .client
            .post(self.posts_url())
            .basic_auth(&self.username, Some(self.app_password.expose_secret()))
            .json(&serde_json::json!({
                "title": derive_title(post),
                "content": post.content,
                "status": self.status_for(post),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response("WordPress", response).await);
        }

        let body = response.text().await?;
        let created: CreatedPost = serde_json::from_str(&body).map_err(|e| {
            PlatformError::Posting(format!("unexpected WordPress response ({}): {}", e, body))
        })?;

        tracing::debug!(wordpress_id = created.id, "Created WordPress post");
        Ok(Published {
            platform_post_id: created.id.to_string(),
            url: created.link,
        })
    }
}
