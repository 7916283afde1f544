//! Completion provider client: context-augmented chat and fill-in-the-middle.
//!
//! `chat` templates the retrieved passages plus the user's question into the
//! final prompt, sends the full message array, and either parses the SSE
//! stream (forwarding each delta through the caller's callback) or the
//! one-shot JSON body. `fim` prefers the provider's native fill-in-the-middle
//! endpoint when one is configured and otherwise falls back to a single-turn
//! chat with the FIM prompt template.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::config::ApiConfig;
use crate::embedding::{client_for, format_placeholder};
use crate::models::SearchResult;
use crate::tokenizer::Tokenizer;

const QUERY_TEMPLATE: &str = r#"
You're a helpful software developer assistant, please use the provided context to base your answers on
for user questions. Answer to the best of your knowledge. Keep your responses short and on point.
Context:
__CONTEXT__

Question:
__QUESTION__

Answer:
"#;

const FIM_TEMPLATE: &str = r#"
You are a helpful coding assistant. When asked to fill the missing middle between a prefix and a suffix,
produce only the middle content - do not repeat the prefix or suffix, do not add explanation.
Prefix:
__PREFIX__

Suffix:
__SUFFIX__
"#;

/// Streaming callback; receives each content delta as it arrives.
pub type StreamCallback<'a> = &'a mut (dyn FnMut(&str) + Send);

pub struct CompletionClient<'a> {
    api: ApiConfig,
    timeout: Duration,
    tokenizer: &'a Tokenizer,
    /// `generation.prepend_label_format`: per-passage label template with
    /// one `{}` slot for the file name.
    label_format: String,
}

impl<'a> CompletionClient<'a> {
    pub fn new(
        api: ApiConfig,
        timeout_ms: u64,
        tokenizer: &'a Tokenizer,
        label_format: String,
    ) -> Self {
        Self {
            api,
            timeout: Duration::from_millis(timeout_ms),
            tokenizer,
            label_format,
        }
    }

    /// Run a chat completion over `messages`, injecting a context block
    /// assembled from `search_results` into the last user message.
    ///
    /// Returns the concatenated full response text. With a streaming
    /// provider each delta is also forwarded through `on_stream`.
    pub async fn chat(
        &self,
        messages: &[serde_json::Value],
        search_results: &[SearchResult],
        temperature: f32,
        max_tokens: usize,
        mut on_stream: Option<StreamCallback<'_>>,
    ) -> Result<String> {
        let question = messages
            .last()
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .context("Last message has no content")?
            .to_string();

        if let Some(cb) = on_stream.as_deref_mut() {
            cb("[meta]Working on the response");
        }

        let context = self.build_context(search_results, false, "\n\n");
        let prompt = QUERY_TEMPLATE
            .replacen("__CONTEXT__", &context, 1)
            .replacen("__QUESTION__", &question, 1);

        let mut modified = messages.to_vec();
        if let Some(last) = modified.last_mut() {
            last["content"] = serde_json::Value::String(prompt);
        }

        let mut body = serde_json::json!({
            "model": self.api.model,
            "messages": modified,
            "stream": self.api.stream,
        });
        if self.api.temperature_support {
            body["temperature"] = serde_json::json!(temperature);
        }
        body[&self.api.max_tokens_name] = serde_json::json!(max_tokens);

        let (client, url) = client_for(&self.api.api_url)?;
        let request = client
            .post(&url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api.resolved_api_key()))
            .header("Connection", "keep-alive")
            .header(
                "Accept",
                if self.api.stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            )
            .json(&body);

        let response = request
            .send()
            .await
            .context("Failed to connect to completion server")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("Server returned error: {} - {}", status, body);
            if let Some(cb) = on_stream.as_deref_mut() {
                cb(&msg);
            }
            bail!(msg);
        }

        if self.api.stream {
            let mut full = String::new();
            let mut buffer = String::new();
            let mut stream = response.bytes_stream();
            'recv: while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("Completion stream aborted")?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);
                    match parse_sse_event(&event) {
                        SseEvent::Done => break 'recv,
                        SseEvent::Content(content) => {
                            full.push_str(&content);
                            if let Some(cb) = on_stream.as_deref_mut() {
                                cb(&content);
                            }
                        }
                        SseEvent::Skip => {}
                    }
                }
            }
            Ok(full)
        } else {
            let json: serde_json::Value = response
                .json()
                .await
                .context("Failed to parse completion response")?;
            let full = extract_message_content(&json).unwrap_or_default();
            if let Some(cb) = on_stream.as_deref_mut() {
                cb(&full);
            }
            Ok(full)
        }
    }

    /// Fill-in-the-middle completion.
    ///
    /// With a native FIM sub-config (non-empty `prefix_name`) the request
    /// goes to the FIM endpoint with provider-named prefix/suffix fields;
    /// otherwise the FIM prompt template runs as a non-streaming single-user
    /// chat. Retrieved context is commented out and prepended to the prefix.
    pub async fn fim(
        &self,
        prefix: &str,
        suffix: &str,
        stops: &[String],
        temperature: f32,
        max_tokens: usize,
        search_results: &[SearchResult],
    ) -> Result<String> {
        let context = self.build_context(search_results, true, "\n\n");
        let full_prefix = if context.is_empty() {
            prefix.to_string()
        } else {
            format!("{}\n\n{}", context, prefix)
        };

        let fim_prefix_name = self.api.fim.prefix_name.trim();
        let fim_suffix_name = self.api.fim.suffix_name.trim();
        let native = !fim_prefix_name.is_empty();
        let url = if native {
            self.api.fim.api_url.clone()
        } else {
            self.api.api_url.clone()
        };

        let mut body = serde_json::json!({ "model": self.api.model });
        if native {
            body[fim_prefix_name] = serde_json::json!(full_prefix);
            body[fim_suffix_name] = serde_json::json!(suffix);
            let stops: &[String] = if stops.is_empty() {
                &self.api.fim.stop_tokens
            } else {
                stops
            };
            if !stops.is_empty() {
                body["stop"] = serde_json::json!(stops);
            }
        } else {
            let prompt = FIM_TEMPLATE
                .replacen("__PREFIX__", &full_prefix, 1)
                .replacen("__SUFFIX__", suffix, 1);
            body["messages"] = serde_json::json!([{ "role": "user", "content": prompt }]);
            body["stream"] = serde_json::json!(false);
        }
        if self.api.temperature_support {
            body["temperature"] = serde_json::json!(temperature);
        }
        body[&self.api.max_tokens_name] = serde_json::json!(max_tokens);

        let (client, url) = client_for(&url)?;
        let response = client
            .post(&url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api.resolved_api_key()))
            .header("Connection", "keep-alive")
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to connect to completion server")?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("Server returned error: {} - {}", status, text);
        }

        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(json) => Ok(extract_message_content(&json)
                .or_else(|| {
                    json.get("content")
                        .and_then(|c| c.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_default()),
            // Some servers answer FIM requests with an SSE body even when
            // not asked to stream.
            Err(_) => Ok(collect_sse_content(&text)),
        }
    }

    /// Assemble the context block from retrieved passages, labelling each
    /// with its source file name and stopping at the provider's context
    /// length. A passage that only partially fits contributes a
    /// character-proportional excerpt and ends the block.
    fn build_context(
        &self,
        search_results: &[SearchResult],
        comment_out: bool,
        divider: &str,
    ) -> String {
        let max_context_tokens = self.api.context_length;
        let mut used = self.tokenizer.count(QUERY_TEMPLATE, false);
        let mut context = String::new();

        for result in search_results {
            let filename = Path::new(&result.source_id)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| {
                    if result.source_id.is_empty() {
                        "source".to_string()
                    } else {
                        result.source_id.clone()
                    }
                });
            let label = format_placeholder(&self.label_format, &filename);
            let already_labeled = result.content.starts_with(&label);

            let content_tokens = self.tokenizer.count(&result.content, false);
            let label_tokens = if already_labeled {
                0
            } else {
                self.tokenizer.count(&label, false)
            };

            if max_context_tokens < used + label_tokens + content_tokens {
                let remaining = max_context_tokens.saturating_sub(used);
                if remaining <= label_tokens {
                    break;
                }
                let remaining_content = remaining - label_tokens;
                let approx_chars = if content_tokens > 0 {
                    result.content.len() * remaining_content / content_tokens
                } else {
                    result.content.len()
                };
                let cut = floor_char_boundary(&result.content, approx_chars);
                let excerpt = &result.content[..cut];
                let labeled = if already_labeled {
                    excerpt.to_string()
                } else {
                    format!("{}{}", label, excerpt)
                };
                used += self.tokenizer.count(&labeled, false);
                push_passage(&mut context, &labeled, comment_out, divider);
                break;
            }

            let labeled = if already_labeled {
                result.content.clone()
            } else {
                format!("{}{}", label, result.content)
            };
            used += label_tokens + content_tokens;
            push_passage(&mut context, &labeled, comment_out, divider);
        }

        context
    }
}

fn push_passage(context: &mut String, passage: &str, comment_out: bool, divider: &str) {
    if comment_out {
        for line in passage.lines() {
            context.push_str("// ");
            context.push_str(line);
            context.push('\n');
        }
    } else {
        context.push_str(passage);
    }
    context.push_str(divider);
}

enum SseEvent {
    Content(String),
    Done,
    Skip,
}

fn parse_sse_event(event: &str) -> SseEvent {
    let Some(payload) = event.strip_prefix("data: ") else {
        return SseEvent::Skip;
    };
    if payload.trim() == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(json) => {
            let delta = json
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"));
            let content = delta
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
                .or_else(|| {
                    delta
                        .and_then(|d| d.get("reasoning_content"))
                        .and_then(|c| c.as_str())
                });
            match content {
                Some(c) => SseEvent::Content(c.to_string()),
                None => SseEvent::Skip,
            }
        }
        Err(e) => {
            warn!(error = %e, "Error parsing stream chunk");
            SseEvent::Skip
        }
    }
}

/// Extract all content deltas from a complete SSE body.
fn collect_sse_content(body: &str) -> String {
    let mut full = String::new();
    for event in body.split("\n\n") {
        match parse_sse_event(event) {
            SseEvent::Content(c) => full.push_str(&c),
            SseEvent::Done => break,
            SseEvent::Skip => {}
        }
    }
    full
}

fn extract_message_content(json: &serde_json::Value) -> Option<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client<'a>(tokenizer: &'a Tokenizer, context_length: usize, label: &str) -> CompletionClient<'a> {
        let api = ApiConfig {
            context_length,
            ..Default::default()
        };
        CompletionClient::new(api, 1000, tokenizer, label.to_string())
    }

    fn result(source: &str, content: &str) -> SearchResult {
        SearchResult::synthetic(source, content.to_string(), "text")
    }

    #[test]
    fn parses_delta_content() {
        let event = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        match parse_sse_event(event) {
            SseEvent::Content(c) => assert_eq!(c, "Hello"),
            _ => panic!("expected content"),
        }
    }

    #[test]
    fn parses_reasoning_content_fallback() {
        let event = r#"data: {"choices":[{"delta":{"content":null,"reasoning_content":"think"}}]}"#;
        match parse_sse_event(event) {
            SseEvent::Content(c) => assert_eq!(c, "think"),
            _ => panic!("expected content"),
        }
    }

    #[test]
    fn done_marker_ends_stream() {
        assert!(matches!(parse_sse_event("data: [DONE]"), SseEvent::Done));
        assert!(matches!(parse_sse_event(": comment"), SseEvent::Skip));
    }

    #[test]
    fn collect_sse_concatenates() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\ndata: [DONE]\n\n";
        assert_eq!(collect_sse_content(body), "ab");
    }

    #[test]
    fn context_block_labels_passages() {
        let tokenizer = Tokenizer::approximate();
        let c = client(&tokenizer, 10_000, "// File: {}\n");
        let ctx = c.build_context(&[result("src/lib.rs", "fn lib() {}")], false, "\n\n");
        assert!(ctx.starts_with("// File: lib.rs\n"));
        assert!(ctx.contains("fn lib() {}"));
    }

    #[test]
    fn context_block_skips_double_labels() {
        let tokenizer = Tokenizer::approximate();
        let c = client(&tokenizer, 10_000, "[{}] ");
        let ctx = c.build_context(&[result("a.rs", "[a.rs] body")], false, "\n\n");
        assert_eq!(ctx.matches("[a.rs]").count(), 1);
    }

    #[test]
    fn context_block_respects_context_length() {
        let tokenizer = Tokenizer::approximate();
        let template_tokens = tokenizer.count(QUERY_TEMPLATE, false);
        let c = client(&tokenizer, template_tokens + 20, "");
        let big: String = (0..500).map(|i| format!("w{} ", i)).collect();
        let ctx = c.build_context(&[result("a.txt", &big)], false, "\n\n");
        // Only a proportional excerpt fits.
        assert!(ctx.len() < big.len());
        assert!(!ctx.is_empty());
    }

    #[test]
    fn fim_context_is_commented() {
        let tokenizer = Tokenizer::approximate();
        let c = client(&tokenizer, 10_000, "");
        let ctx = c.build_context(&[result("x.c", "int a;\nint b;")], true, "\n\n");
        for line in ctx.lines().filter(|l| !l.trim().is_empty()) {
            assert!(line.starts_with("// "), "uncommented line: {:?}", line);
        }
    }
}
