//! Streaming HTTP client for remote chat/completion APIs.

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use localrag_core::{ChunkSink, RagConfig};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::providers::ApiType;

/// One parsed line of a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamLine {
    pub content: Option<String>,
    pub done: bool,
}

/// Parse one line of an SSE (`data: {...}`) or Ollama NDJSON stream.
///
/// Blank lines, SSE comments and unparseable payloads yield an empty
/// [`StreamLine`].
pub fn parse_stream_line(line: &str) -> StreamLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return StreamLine::default();
    }

    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();
        if data == "[DONE]" {
            return StreamLine {
                content: None,
                done: true,
            };
        }
        return match serde_json::from_str::<Value>(data) {
            Ok(value) => StreamLine {
                content: value["choices"][0]["delta"]["content"]
                    .as_str()
                    .map(str::to_string),
                done: false,
            },
            Err(e) => {
                warn!("Failed to parse stream data: {}", e);
                StreamLine::default()
            }
        };
    }

    match serde_json::from_str::<Value>(line) {
        Ok(value) => StreamLine {
            content: value["response"].as_str().map(str::to_string),
            done: value["done"].as_bool().unwrap_or(false),
        },
        Err(e) => {
            warn!("Failed to parse stream line: {}", e);
            StreamLine::default()
        }
    }
}

pub struct StreamingClient {
    client: reqwest::Client,
}

impl StreamingClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub fn from_config(config: &RagConfig) -> Result<Self> {
        Self::new(config.connect_timeout(), config.read_timeout())
    }

    /// POST `prompt` to `base_url` and stream the answer.
    ///
    /// Every content piece goes to `sink` as it arrives; the concatenated text
    /// is returned once the stream ends.
    pub async fn stream(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        prompt: &str,
        sink: &ChunkSink<'_>,
    ) -> Result<String> {
        let api_type = ApiType::detect(base_url);
        let url = api_type.full_api_url(base_url);
        let body = api_type.request_body(model, prompt);
        info!("Sending streaming request: {} ({:?})", url, api_type);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .context("Failed to send request")?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            warn!("Request failed, status code: {}", status);
            bail!("Request failed, status code: {}", status);
        }

        let mut full = String::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = resp.bytes_stream();
        let mut done = false;

        while let Some(bytes) = stream.next().await {
            let bytes = bytes.context("Failed to read response")?;
            buffer.extend_from_slice(&bytes);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if handle_line(&line, &mut full, sink) {
                    done = true;
                    break;
                }
            }
            if done {
                break;
            }
        }

        if !done && !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).to_string();
            handle_line(&line, &mut full, sink);
        }

        debug!("Stream finished, {} characters", full.len());
        Ok(full)
    }
}

/// Returns true once the stream signalled completion or the sink stopped
/// accepting chunks.
fn handle_line(line: &str, full: &mut String, sink: &ChunkSink<'_>) -> bool {
    let parsed = parse_stream_line(line);
    if let Some(content) = parsed.content {
        if !content.is_empty() {
            full.push_str(&content);
            if !sink.send(content) {
                debug!("Chunk receiver closed, ending stream early");
                return true;
            }
        }
    }
    parsed.done
}
