//! Embedding provider client.
//!
//! Converts batches of texts into dense float vectors via an external HTTP
//! embedding API. Texts are templated through the provider's document- or
//! query-side format string (one `{}` placeholder each) before sending, so
//! asymmetric-embedding models see the right instruction prefix.
//!
//! # Wire contract
//!
//! One POST per batch with `{"content": [texts...]}`; the response is an
//! array of the same length whose `i`-th entry carries `embedding[0]` — a
//! numeric vector of the configured dimension. Anything else (connection
//! failure, non-200, malformed JSON, short response) surfaces as a single
//! failure describing the batch; callers decide whether to retry or count
//! the failure against a file.
//!
//! # Client reuse
//!
//! Keep-alive HTTP clients are cached per `scheme://host:port` for the
//! process lifetime; read timeouts come from config and are applied
//! per-request. This is a deliberate cache, not leaked state.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::config::ApiConfig;

/// Whether a text is embedded as corpus content or as a search query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeKind {
    Document,
    Query,
}

static HTTP_CLIENTS: OnceLock<Mutex<HashMap<String, reqwest::Client>>> = OnceLock::new();

/// Cached keep-alive client for `url`'s `scheme://host:port`, plus the path
/// component to request.
pub(crate) fn client_for(url: &str) -> Result<(reqwest::Client, String)> {
    let scheme_end = url
        .find("://")
        .with_context(|| format!("Invalid server URL: {}", url))?;
    let host_start = scheme_end + 3;
    let path_start = url[host_start..]
        .find('/')
        .map(|i| host_start + i)
        .unwrap_or(url.len());
    let base = &url[..path_start];

    let clients = HTTP_CLIENTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = clients.lock().unwrap();
    let client = guard
        .entry(base.to_string())
        .or_insert_with(|| {
            reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new())
        })
        .clone();
    Ok((client, url.to_string()))
}

pub struct EmbeddingClient {
    api: ApiConfig,
    timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(api: ApiConfig, timeout_ms: u64) -> Self {
        Self {
            api,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn api(&self) -> &ApiConfig {
        &self.api
    }

    /// Embed a batch of texts, returning vectors in input order.
    pub async fn generate(&self, texts: &[String], kind: EncodeKind) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let (client, url) = client_for(&self.api.api_url)?;

        let body = serde_json::json!({ "content": self.prepare_content(texts, kind) });
        let response = client
            .post(&url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api.resolved_api_key()))
            .header("Connection", "keep-alive")
            .json(&body)
            .send()
            .await
            .context("Failed to connect to embedding server")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Embedding server returned error: {} - {}", status, body);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse embedding server response")?;
        let items = json
            .as_array()
            .filter(|a| a.len() == texts.len())
            .context("Unexpected embedding response format")?;

        let mut vectors = Vec::with_capacity(texts.len());
        for item in items {
            let data = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .and_then(|e| e.first())
                .and_then(|e| e.as_array())
                .context("Missing or invalid 'embedding' field in response")?;
            let vector: Vec<f32> = data
                .iter()
                .map(|v| {
                    v.as_f64()
                        .map(|f| f as f32)
                        .context("Non-numeric value in embedding data")
                })
                .collect::<Result<_>>()?;
            vectors.push(vector);
        }
        Ok(vectors)
    }

    /// Embed a single text.
    pub async fn generate_one(&self, text: &str, kind: EncodeKind) -> Result<Vec<f32>> {
        let mut vectors = self.generate(&[text.to_string()], kind).await?;
        vectors
            .pop()
            .context("Empty embedding response")
    }

    fn prepare_content(&self, texts: &[String], kind: EncodeKind) -> Vec<String> {
        let template = match kind {
            EncodeKind::Document => &self.api.document_format,
            EncodeKind::Query => &self.api.query_format,
        };
        if template.is_empty() || !template.contains("{}") {
            return texts.to_vec();
        }
        texts
            .iter()
            .map(|t| format_placeholder(template, t))
            .collect()
    }
}

/// Substitute the single `{}` placeholder in `template`.
pub fn format_placeholder(template: &str, value: &str) -> String {
    match template.find("{}") {
        Some(pos) => {
            let mut out = String::with_capacity(template.len() + value.len());
            out.push_str(&template[..pos]);
            out.push_str(value);
            out.push_str(&template[pos + 2..]);
            out
        }
        None => template.to_string(),
    }
}

/// L2 norm, used by the startup diagnostics to confirm the provider returns
/// normalized vectors.
pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Dot product; equals cosine similarity for normalized vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_placeholder_substitutes_once() {
        assert_eq!(format_placeholder("query: {}", "abc"), "query: abc");
        assert_eq!(format_placeholder("{} tail", "x"), "x tail");
        assert_eq!(format_placeholder("no slot", "x"), "no slot");
    }

    #[test]
    fn prepare_content_applies_templates() {
        let api = ApiConfig {
            document_format: "passage: {}".to_string(),
            query_format: "query: {}".to_string(),
            ..Default::default()
        };
        let client = EmbeddingClient::new(api, 1000);
        let texts = vec!["hello".to_string()];
        assert_eq!(
            client.prepare_content(&texts, EncodeKind::Document),
            vec!["passage: hello".to_string()]
        );
        assert_eq!(
            client.prepare_content(&texts, EncodeKind::Query),
            vec!["query: hello".to_string()]
        );
    }

    #[test]
    fn prepare_content_without_template_passes_through() {
        let client = EmbeddingClient::new(ApiConfig::default(), 1000);
        let texts = vec!["raw".to_string()];
        assert_eq!(client.prepare_content(&texts, EncodeKind::Query), texts);
    }

    #[test]
    fn l2_norm_of_unit_vector() {
        let norm = l2_norm(&[0.6, 0.8]);
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn client_cache_keys_by_host() {
        let (_, url_a) = client_for("http://localhost:9200/embedding").unwrap();
        let (_, url_b) = client_for("http://localhost:9200/other").unwrap();
        assert_eq!(url_a, "http://localhost:9200/embedding");
        assert_eq!(url_b, "http://localhost:9200/other");
        assert!(client_for("not-a-url").is_err());
    }
}
