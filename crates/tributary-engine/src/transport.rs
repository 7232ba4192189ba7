use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use crate::truncate_text;

/// Status code and raw body of an HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON, failing with the status and body on a non-2xx reply.
    pub fn json_or_error(&self, label: &str) -> Result<Value> {
        if !self.is_success() {
            bail!(
                "{label} request failed ({}): {}",
                self.status,
                truncate_text(&self.body, 512)
            );
        }
        serde_json::from_str(&self.body)
            .with_context(|| format!("{label} returned invalid JSON payload"))
    }
}

/// Outbound side of the workflow pipe: JSON POSTs with bearer auth.
pub trait WebhookTransport: Send + Sync {
    fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<HttpReply>;
}

/// Outbound side of the image pipe: prediction create and status reads.
pub trait PredictionsApi: Send + Sync {
    fn create_prediction(
        &self,
        url: &str,
        api_token: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<HttpReply>;

    fn get_prediction(&self, url: &str, api_token: &str, timeout: Duration) -> Result<HttpReply>;
}

pub fn build_http_client() -> Result<HttpClient> {
    HttpClient::builder()
        .user_agent(concat!("tributary/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed building HTTP client")
}

pub struct HttpWebhookTransport {
    http: HttpClient,
}

impl HttpWebhookTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: build_http_client()?,
        })
    }
}

impl WebhookTransport for HttpWebhookTransport {
    fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let response = self
            .http
            .post(url)
            .bearer_auth(bearer_token)
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .json(payload)
            .send()
            .with_context(|| format!("N8N request failed ({url})"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .context("N8N response body read failed")?;
        Ok(HttpReply { status, body })
    }
}

/// Replicate predictions API. Uses the legacy `Token` auth scheme and asks the
/// server to hold each request open until the prediction settles.
pub struct ReplicateHttpApi {
    http: HttpClient,
}

impl ReplicateHttpApi {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: build_http_client()?,
        })
    }
}

impl PredictionsApi for ReplicateHttpApi {
    fn create_prediction(
        &self,
        url: &str,
        api_token: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, format!("Token {api_token}"))
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "wait")
            .timeout(timeout)
            .json(payload)
            .send()
            .with_context(|| format!("Replicate request failed ({url})"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .context("Replicate response body read failed")?;
        Ok(HttpReply { status, body })
    }

    fn get_prediction(&self, url: &str, api_token: &str, timeout: Duration) -> Result<HttpReply> {
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("Token {api_token}"))
            .header("Prefer", "wait")
            .timeout(timeout)
            .send()
            .with_context(|| format!("Replicate poll request failed ({url})"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .context("Replicate poll body read failed")?;
        Ok(HttpReply { status, body })
    }
}
