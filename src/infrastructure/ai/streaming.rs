//! Server-Sent Events parsing for streaming provider responses.

use serde_json::Value;

/// One parsed SSE event: optional event name plus the data payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse a single SSE block (the text between blank lines).
///
/// Returns None for comments, empty blocks, and the `[DONE]`
/// terminator used by OpenAI-compatible streams.
pub fn parse_sse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in block.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim().to_string());
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    if data == "[DONE]" {
        return None;
    }
    Some(SseEvent { event, data })
}

/// Extract the incremental text from a streaming chunk.
///
/// Handles both OpenAI-style chunks (`choices[0].delta.content`) and
/// Anthropic-style `content_block_delta` events (`delta.text`).
pub fn extract_delta_text(event: &SseEvent) -> Option<String> {
    let value: Value = serde_json::from_str(&event.data).ok()?;

    if let Some(text) = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }

    if value.get("type").and_then(Value::as_str) == Some("content_block_delta") {
        if let Some(text) = value
            .get("delta")
            .and_then(|delta| delta.get("text"))
            .and_then(Value::as_str)
        {
            return Some(text.to_string());
        }
    }

    None
}

/// Incremental splitter: feed raw bytes, take out complete SSE blocks.
#[derive(Debug, Default)]
pub struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain all blocks completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.pending.push_str(chunk);

        let mut events = Vec::new();
        while let Some(boundary) = self.pending.find("\n\n") {
            let block: String = self.pending.drain(..boundary + 2).collect();
            if let Some(event) = parse_sse_block(&block) {
                events.push(event);
            }
        }
        events
    }
}
