//! LLM answer composition over a `/chat/completions`-shaped API.
//!
//! Streaming mode parses `data: {json}` SSE lines until the `[DONE]`
//! sentinel, yielding content deltas in order without buffering the whole
//! response. Citations are derived from which retrieved chunks' paths the
//! model actually referenced.

use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::pin::Pin;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::models::{Citation, CodeChunk};

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone)]
pub struct CompositionResult {
    pub full_response: String,
    pub citations: Vec<Citation>,
}

#[derive(Clone)]
pub struct Composer {
    http: reqwest::Client,
    config: LlmConfig,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

impl Composer {
    pub fn new(http: reqwest::Client, config: LlmConfig) -> Self {
        Self { http, config }
    }

    /// One-shot composition; returns the full response text.
    pub async fn compose_answer(
        &self,
        model: Option<&str>,
        query: &str,
        chunks: &[CodeChunk],
    ) -> Result<String> {
        let resp = self.send_request(model, query, chunks, false).await?;
        let body: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| Error::LlmFailed(format!("invalid completion response: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::LlmFailed("no choices in completion response".into()))
    }

    /// Streaming composition; yields content deltas in arrival order.
    pub async fn stream_answer(
        &self,
        model: Option<&str>,
        query: &str,
        chunks: &[CodeChunk],
    ) -> Result<TokenStream> {
        let resp = self.send_request(model, query, chunks, true).await?;

        let stream = stream_lines(resp.bytes_stream()).filter_map(|line_result| async move {
            match line_result {
                Ok(line) => parse_sse_line(&line),
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn send_request(
        &self,
        model: Option<&str>,
        query: &str,
        chunks: &[CodeChunk],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let system_prompt = build_system_prompt();
        let user_prompt = build_user_prompt(query, chunks);

        let req = ChatCompletionRequest {
            model: model.unwrap_or(&self.config.model),
            messages: vec![
                Message {
                    role: "system",
                    content: system_prompt,
                },
                Message {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream,
        };

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&req);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| Error::LlmFailed(format!("failed to reach LLM API: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::LlmFailed(format!(
                "LLM API returned {status}: {body}"
            )));
        }

        Ok(resp)
    }
}

// ─── Prompts ─────────────────────────────────────────────

pub fn build_system_prompt() -> &'static str {
    "You are an expert code assistant answering questions about a repository \
     from retrieved code fragments.\n\
     Answer ONLY from the provided code context; never invent code that is \
     not shown.\n\
     Reference specific locations as `file_path:line_number`.\n\
     Use markdown, with fenced code blocks tagged by language.\n\
     If the provided context is insufficient to answer, say so and describe \
     what is missing."
}

pub fn build_user_prompt(query: &str, chunks: &[CodeChunk]) -> String {
    let mut prompt = String::new();
    let _ = write!(prompt, "Question: {query}\n\nCode Context:\n");

    for (i, chunk) in chunks.iter().enumerate() {
        let _ = write!(
            prompt,
            "File {}: {} (lines {}-{})\n",
            i + 1,
            chunk.file_path,
            chunk.start_line,
            chunk.end_line
        );
        if chunk.language.is_empty() || chunk.language == "unknown" {
            let _ = write!(prompt, "```\n{}\n```\n\n", chunk.content);
        } else {
            let _ = write!(prompt, "```{}\n{}\n```\n\n", chunk.language, chunk.content);
        }
    }

    prompt
}

// ─── Citations ───────────────────────────────────────────

/// A chunk is cited when its file path appears textually in the response.
/// Excerpt is the chunk's first two lines (or first 100 chars) with a
/// trailing ellipsis; order preserves retrieval order.
pub fn extract_citations(response: &str, chunks: &[CodeChunk]) -> Vec<Citation> {
    let mut citations = Vec::new();

    for chunk in chunks {
        if !response.contains(&chunk.file_path) {
            continue;
        }

        let excerpt = if chunk.content.len() > 100 {
            let lines: Vec<&str> = chunk.content.lines().collect();
            if lines.len() > 2 {
                format!("{}\n{}...", lines[0], lines[1])
            } else {
                let mut end = 100;
                while !chunk.content.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}...", &chunk.content[..end])
            }
        } else {
            chunk.content.clone()
        };

        citations.push(Citation {
            file_path: chunk.file_path.clone(),
            line_number: chunk.start_line,
            excerpt,
        });
    }

    citations
}

// ─── SSE parsing ─────────────────────────────────────────

/// Parse a single SSE line. Returns:
/// - Some(Ok(content)) for content deltas
/// - Some(Err(e)) for malformed payloads
/// - None to skip (empty lines, comments, [DONE], empty deltas)
fn parse_sse_line(line: &str) -> Option<Result<String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data: ")?.trim();
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.clone())
                .unwrap_or_default();
            if content.is_empty() {
                return None;
            }
            Some(Ok(content))
        }
        Err(e) => Some(Err(Error::LlmFailed(format!(
            "failed to parse stream chunk: {e}"
        )))),
    }
}

/// Convert a byte stream into a stream of complete lines.
fn stream_lines(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        (Box::pin(byte_stream), String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                // Drain a complete line from the buffer if one exists
                if let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].to_string();
                    buffer = buffer[newline_pos + 1..].to_string();
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (stream, buffer)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(Error::LlmFailed(format!("stream read error: {e}"))),
                            (stream, buffer),
                        ));
                    }
                    None => {
                        if !buffer.trim().is_empty() {
                            let remaining = std::mem::take(&mut buffer);
                            return Some((Ok(remaining), (stream, buffer)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchSource;

    fn make_chunk(path: &str, start: usize, end: usize, content: &str) -> CodeChunk {
        CodeChunk {
            repository_id: "repo-1".into(),
            file_path: path.into(),
            start_line: start,
            end_line: end,
            content: content.into(),
            language: "go".into(),
            score: 0.9,
            source: SearchSource::Merged,
        }
    }

    // ─── SSE parsing ─────────────────────────────────────

    #[test]
    fn test_parse_sse_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap().unwrap(), "Hello");
    }

    #[test]
    fn test_parse_sse_done_sentinel() {
        assert!(parse_sse_line("data: [DONE]").is_none());
    }

    #[test]
    fn test_parse_sse_empty_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":null}}]}"#;
        assert!(parse_sse_line(line).is_none());
    }

    #[test]
    fn test_parse_sse_role_only_chunk() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(parse_sse_line(line).is_none());
    }

    #[test]
    fn test_parse_sse_comment_and_blank() {
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("").is_none());
        assert!(parse_sse_line("event: message").is_none());
    }

    #[test]
    fn test_parse_sse_malformed_json() {
        let result = parse_sse_line("data: {broken");
        assert!(result.unwrap().is_err());
    }

    // ─── Prompts ─────────────────────────────────────────

    #[test]
    fn test_user_prompt_structure() {
        let chunks = vec![
            make_chunk("auth.go", 10, 30, "func Login() {}"),
            make_chunk("db.go", 1, 15, "func Connect() {}"),
        ];
        let prompt = build_user_prompt("how does login work?", &chunks);

        assert!(prompt.starts_with("Question: how does login work?\n\nCode Context:\n"));
        assert!(prompt.contains("File 1: auth.go (lines 10-30)"));
        assert!(prompt.contains("File 2: db.go (lines 1-15)"));
        assert!(prompt.contains("```go\nfunc Login() {}\n```"));
    }

    #[test]
    fn test_user_prompt_unknown_language_has_plain_fence() {
        let mut chunk = make_chunk("data.cfg", 1, 2, "key=value");
        chunk.language = "unknown".into();
        let prompt = build_user_prompt("q", &[chunk]);
        assert!(prompt.contains("```\nkey=value\n```"));
    }

    #[test]
    fn test_system_prompt_demands_grounding() {
        let prompt = build_system_prompt();
        assert!(prompt.contains("ONLY from the provided code context"));
        assert!(prompt.contains("file_path:line_number"));
    }

    // ─── Citations ───────────────────────────────────────

    #[test]
    fn test_citations_for_referenced_paths_only() {
        let chunks = vec![
            make_chunk("auth.go", 10, 30, "func Login() {}"),
            make_chunk("db.go", 1, 15, "func Connect() {}"),
        ];
        let response = "Login happens in auth.go:12 using the handler.";
        let citations = extract_citations(response, &chunks);

        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].file_path, "auth.go");
        assert_eq!(citations[0].line_number, 10);
    }

    #[test]
    fn test_citation_excerpt_truncates_long_content() {
        let long_content = (1..=20)
            .map(|i| format!("line number {i} with some extra padding text"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = vec![make_chunk("big.go", 1, 20, &long_content)];
        let citations = extract_citations("see big.go", &chunks);

        assert_eq!(citations.len(), 1);
        assert!(citations[0].excerpt.ends_with("..."));
        assert!(citations[0].excerpt.lines().count() <= 2);
    }

    #[test]
    fn test_citations_preserve_retrieval_order() {
        let chunks = vec![
            make_chunk("b.go", 1, 5, "bbb"),
            make_chunk("a.go", 1, 5, "aaa"),
        ];
        let citations = extract_citations("a.go and b.go are both relevant", &chunks);
        assert_eq!(citations[0].file_path, "b.go");
        assert_eq!(citations[1].file_path, "a.go");
    }
}
