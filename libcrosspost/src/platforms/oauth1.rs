//! OAuth 1.0a request signing (HMAC-SHA1)
//!
//! Used for X user-context credentials (API key/secret plus access
//! token/secret). Only header-based signing is implemented; JSON bodies are
//! not part of the signature.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;

use crate::error::PlatformError;

type HmacSha1 = Hmac<Sha1>;

/// RFC 3986 unreserved characters stay as-is
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct OAuth1Credentials {
    pub consumer_key: String,
    pub consumer_secret: SecretString,
    pub token: String,
    pub token_secret: SecretString,
}

impl std::fmt::Debug for OAuth1Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Credentials")
            .field("consumer_key", &self.consumer_key)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

pub fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

impl OAuth1Credentials {
    /// Build an `Authorization` header with a fresh nonce and timestamp
    pub fn authorization_header(
        &self,
        method: &str,
        url: &str,
        extra_params: &[(&str, &str)],
    ) -> Result<String, PlatformError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.authorization_header_with(method, url, extra_params, &generate_nonce(), &timestamp)
    }

    /// Build an `Authorization` header for a known nonce and timestamp
    pub fn authorization_header_with(
        &self,
        method: &str,
        url: &str,
        extra_params: &[(&str, &str)],
        nonce: &str,
        timestamp: &str,
    ) -> Result<String, PlatformError> {
        let oauth_params = self.oauth_params(nonce, timestamp);
        let signature = self.signature(method, url, extra_params, &oauth_params)?;

        let mut fields: Vec<String> = oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
            .collect();
        fields.push(format!("oauth_signature=\"{}\"", encode(&signature)));
        fields.sort();

        Ok(format!("OAuth {}", fields.join(", ")))
    }

    fn oauth_params<'a>(&'a self, nonce: &'a str, timestamp: &'a str) -> Vec<(&'a str, &'a str)> {
        vec![
            ("oauth_consumer_key", self.consumer_key.as_str()),
            ("oauth_nonce", nonce),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", timestamp),
            ("oauth_token", self.token.as_str()),
            ("oauth_version", "1.0"),
        ]
    }

    /// Base64 HMAC-SHA1 signature over the request
    pub fn signature(
        &self,
        method: &str,
        url: &str,
        extra_params: &[(&str, &str)],
        oauth_params: &[(&str, &str)],
    ) -> Result<String, PlatformError> {
        let base = signature_base_string(method, url, extra_params, oauth_params);
        let key = format!(
            "{}&{}",
            encode(self.consumer_secret.expose_secret()),
            encode(self.token_secret.expose_secret())
        );

        let mut mac = HmacSha1::new_from_slice(key.as_bytes())
            .map_err(|e| PlatformError::Authentication(format!("invalid signing key: {}", e)))?;
        mac.update(base.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

/// `METHOD&url&params`, each part percent-encoded, params sorted
pub fn signature_base_string(
    method: &str,
    url: &str,
    extra_params: &[(&str, &str)],
    oauth_params: &[(&str, &str)],
) -> String {
    let (base_url, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };

    let mut params: Vec<(String, String)> = extra_params
        .iter()
        .chain(oauth_params.iter())
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();

    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = percent_decode_str(k).decode_utf8_lossy();
            let v = percent_decode_str(v).decode_utf8_lossy();
            params.push((encode(&k), encode(&v)));
        }
    }

    params.sort();
    let param_string = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        encode(base_url),
        encode(&param_string)
    )
}

fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
