//! note.com publisher
//!
//! note has no official posting API. Publishing logs in with email and
//! password to obtain a session cookie, then creates the article with the
//! same JSON calls the web editor makes. Each publish uses its own cookie
//! jar so sessions never leak between posts.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::config::NoteConfig;
use crate::error::{ConfigError, PlatformError, Result};
use crate::platforms::{
    build_client, error_from_response, http_client_builder, trim_base_url, unset_variables,
    PublishResult, Publisher,
};
use crate::types::{PlatformKind, Published, ScheduledPost};

pub const DEFAULT_BASE_URL: &str = "https://note.com";

const TITLE_MAX_CHARS: usize = 100;

pub struct NotePublisher {
    base_url: String,
    email: String,
    password: SecretString,
}

impl NotePublisher {
    pub fn from_config(config: &NoteConfig) -> Result<Self> {
        let missing = unset_variables(&[
            ("NOTE_EMAIL", &config.email),
            ("NOTE_PASSWORD", &config.password),
        ]);

        match (&config.email, &config.password) {
            (Some(email), Some(password)) if missing.is_empty() => Ok(Self {
                base_url: trim_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
                email: email.trim().to_string(),
                password: SecretString::from(password.clone()),
            }),
            _ => Err(ConfigError::MissingCredential {
                platform: PlatformKind::Note.to_string(),
                variables: vec![missing.join(" + ")],
            }
            .into()),
        }
    }

    async fn sign_in(&self, client: &reqwest::Client) -> std::result::Result<(), PlatformError> {
        let response = client
            .post(format!("{}/api/v1/sessions/sign_in", self.base_url))
            .json(&serde_json::json!({
                "login": self.email,
                "password": self.password.expose_secret(),
            }))
            .send()
            .await?;

        let status = response.status();
        if matches!(status.as_u16(), 400 | 401 | 403 | 422) {
            return Err(PlatformError::Authentication(format!(
                "note rejected the login (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(error_from_response("note", response).await);
        }

        // A 200 can still carry an error payload
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(PlatformError::Authentication(format!(
                "note rejected the login: {}",
                error
            )));
        }

        Ok(())
    }
}

/// Title from metadata, or the first non-empty line of the content
pub fn derive_title(post: &ScheduledPost) -> String {
    if let Some(title) = post.metadata_str("title").map(str::trim).filter(|t| !t.is_empty()) {
        return title.to_string();
    }

    let first_line = post
        .content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    first_line.chars().take(TITLE_MAX_CHARS).collect()
}

/// Plain text to the paragraph markup the note editor stores
pub fn to_note_html(content: &str) -> String {
    content
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p).replace('\n', "<br>")))
        .collect()
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Pull the note ID and public URL out of a creation response
fn parse_created(base_url: &str, body: &Value) -> std::result::Result<Published, PlatformError> {
    let data = body.get("data").unwrap_or(body);

    let id = match data.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => {
            return Err(PlatformError::Posting(format!(
                "note response has no article id: {}",
                body
            )))
        }
    };

    let key = data.get("key").and_then(Value::as_str);
    let urlname = data
        .get("user")
        .and_then(|u| u.get("urlname"))
        .and_then(Value::as_str);

    let url = match (key, urlname) {
        (Some(key), Some(user)) => Some(format!("{}/{}/n/{}", base_url, user, key)),
        (Some(key), None) => Some(format!("{}/n/{}", base_url, key)),
        _ => data
            .get("note_url")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    Ok(Published {
        platform_post_id: key.map(str::to_string).unwrap_or(id),
        url,
    })
}

#[async_trait]
impl Publisher for NotePublisher {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Note
    }

    async fn publish(&self, post: &ScheduledPost) -> PublishResult {
        self.validate_content(&post.content)?;

        let client = build_client(http_client_builder().cookie_store(true))
            .map_err(|e| PlatformError::Network(e.to_string()))?;

        self.sign_in(&client).await?;

        let response = client
            .post(format!("{}/api/v2/notes", self.base_url))
            .json(&serde_json::json!({
                "name": derive_title(post),
                "body": to_note_html(&post.content),
                "status": "published",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response("note", response).await);
        }

        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            PlatformError::Posting(format!("note returned a non-JSON body ({}): {}", e, text))
        })?;

        let published = parse_created(&self.base_url, &body)?;
        tracing::debug!(note_id = %published.platform_post_id, "Created note article");
        Ok(published)
    }
}
