//! Chat-completion provider abstraction.
//!
//! [`OpenAiCompleter`] talks to the OpenAI chat completions API; the
//! streaming path consumes server-sent events and yields content deltas as
//! they arrive. [`CannedCompleter`] returns a fixed answer for tests and
//! offline runs.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::models::ChatMessage;

/// One generation call's inputs, already flattened to model messages.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A text-generation backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Generate the full answer in one call.
    async fn complete(&self, req: &CompletionRequest) -> Result<String>;

    /// Generate the answer as a stream of content deltas. The stream ends
    /// when generation finishes; an item-level error ends it early.
    async fn stream(&self, req: &CompletionRequest) -> Result<BoxStream<'static, Result<String>>>;
}

// ============ OpenAI provider ============

pub struct OpenAiCompleter {
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompleter {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::transient(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: config.base_url.clone(),
            client,
        })
    }

    fn api_key() -> Result<String> {
        std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::fatal("OPENAI_API_KEY environment variable not set"))
    }

    fn body(req: &CompletionRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = req
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        serde_json::json!({
            "model": req.model,
            "messages": messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "stream": stream,
        })
    }

    async fn send(
        &self,
        req: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let api_key = Self::api_key()?;
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&Self::body(req, stream))
            .send()
            .await
            .map_err(|e| Error::transient(format!("completion request: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(Error::transient(format!(
                "completion API error {}: {}",
                status, text
            )))
        } else {
            Err(Error::fatal(format!(
                "completion API error {}: {}",
                status, text
            )))
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompleter {
    async fn complete(&self, req: &CompletionRequest) -> Result<String> {
        let resp = self.send(req, false).await?;
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::transient(format!("completion response: {}", e)))?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::transient("completion response missing content"))
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<BoxStream<'static, Result<String>>> {
        let resp = self.send(req, true).await?;
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<String>>(32);

        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::transient(format!("completion stream: {}", e))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE frames are separated by a blank line.
                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);
                    for token in parse_sse_frame(&frame) {
                        match token {
                            SseItem::Done => return,
                            SseItem::Token(t) => {
                                if tx.send(Ok(t)).await.is_err() {
                                    // Receiver dropped; caller cancelled.
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

enum SseItem {
    Token(String),
    Done,
}

fn parse_sse_frame(frame: &str) -> Vec<SseItem> {
    let mut out = Vec::new();
    for line in frame.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            out.push(SseItem::Done);
            continue;
        }
        let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        if let Some(content) = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            if !content.is_empty() {
                out.push(SseItem::Token(content.to_string()));
            }
        }
    }
    out
}

// ============ Canned provider ============

/// Returns a fixed answer, optionally split into word tokens when
/// streamed. No network dependency.
pub struct CannedCompleter {
    answer: String,
}

impl CannedCompleter {
    pub fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
        }
    }
}

#[async_trait]
impl CompletionProvider for CannedCompleter {
    async fn complete(&self, _req: &CompletionRequest) -> Result<String> {
        Ok(self.answer.clone())
    }

    async fn stream(&self, _req: &CompletionRequest) -> Result<BoxStream<'static, Result<String>>> {
        let tokens: Vec<Result<String>> = self
            .answer
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();
        Ok(futures_util::stream::iter(tokens).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatRole;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: "hello".to_string(),
            }],
            temperature: 0.2,
            max_tokens: 64,
        }
    }

    #[test]
    fn sse_frame_extracts_delta_content() {
        let frame = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        let items = parse_sse_frame(frame);
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], SseItem::Token(t) if t == "Hel"));
    }

    #[test]
    fn sse_done_marker_recognized() {
        let items = parse_sse_frame("data: [DONE]");
        assert!(matches!(items[0], SseItem::Done));
    }

    #[test]
    fn sse_ignores_comments_and_empty_deltas() {
        let frame = ": keep-alive\ndata: {\"choices\":[{\"delta\":{}}]}";
        assert!(parse_sse_frame(frame).is_empty());
    }

    #[tokio::test]
    async fn canned_complete_and_stream_agree() {
        let provider = CannedCompleter::new("twenty five days");
        let full = provider.complete(&request()).await.unwrap();

        let mut stream = provider.stream(&request()).await.unwrap();
        let mut streamed = String::new();
        while let Some(token) = stream.next().await {
            streamed.push_str(&token.unwrap());
        }
        assert_eq!(full, streamed);
    }
}
