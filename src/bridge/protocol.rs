//! NDJSON wire protocol spoken with worker processes.
//!
//! One JSON object per line in each direction, camelCase field names. The
//! worker signals readiness with the literal line `INITIALIZED` before its
//! first response. Lines that are neither the ready marker nor a decodable
//! response are logged and dropped; a misbehaving worker can slow things
//! down but never crash the bridge.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Literal line a worker prints once its model is loaded.
pub const READY_LINE: &str = "INITIALIZED";

/// One inference request, serialized as a single NDJSON line to the
/// worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    /// Correlation id; echoed back as `requestId`.
    pub id: String,
    /// The prompt text, already clamped to the bridge's prompt limit.
    pub prompt: String,
    /// Generation cap, already clamped to the bridge's token limit.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// One worker response line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    /// Correlation id of the request this answers.
    pub request_id: String,
    /// Whether generation succeeded.
    pub success: bool,
    /// Generated text; present when `success` is true.
    #[serde(default)]
    pub text: Option<String>,
    /// Worker-side error description; present when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
    /// Name of the model that served the request.
    #[serde(default)]
    pub model: Option<String>,
    /// Worker's own confidence in the output, if it reports one.
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// A decoded line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    /// The `INITIALIZED` handshake.
    Ready,
    /// A response to an in-flight request.
    Response(WorkerResponse),
}

/// Decode one line of worker stdout.
///
/// Returns `None` for blank and malformed lines, which are dropped after a
/// log entry.
pub fn parse_line(line: &str) -> Option<WorkerLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == READY_LINE {
        return Some(WorkerLine::Ready);
    }
    match serde_json::from_str::<WorkerResponse>(trimmed) {
        Ok(response) => Some(WorkerLine::Response(response)),
        Err(e) => {
            warn!(error = %e, len = trimmed.len(), "dropping malformed worker line");
            None
        }
    }
}

/// Encode one request as an NDJSON line (no trailing newline).
pub fn encode_request(request: &WorkerRequest) -> Result<String, serde_json::Error> {
    serde_json::to_string(request)
}

/// Truncate a prompt to at most `max_chars` characters, respecting char
/// boundaries.
pub fn clamp_prompt(prompt: &str, max_chars: usize) -> String {
    if prompt.chars().count() <= max_chars {
        prompt.to_string()
    } else {
        prompt.chars().take(max_chars).collect()
    }
}
