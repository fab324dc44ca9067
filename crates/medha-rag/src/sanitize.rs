//! Removal of model "reasoning traces" (`<think>...</think>`) from raw output.
//!
//! Best effort only: when markers are unbalanced the raw text is kept.

use std::sync::LazyLock;

pub const TRACE_OPEN: &str = "<think>";
pub const TRACE_CLOSE: &str = "</think>";

static REASONING_TRACE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?s)<think>.*?</think>").expect("reasoning trace regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    /// Markers were present but unbalanced; `text` is the trimmed raw output.
    pub malformed: bool,
}

pub fn sanitize_model_output(raw: &str) -> Sanitized {
    let stripped = REASONING_TRACE_RE.replace_all(raw, "");
    if stripped.contains(TRACE_OPEN) || stripped.contains(TRACE_CLOSE) {
        return Sanitized {
            text: raw.trim().to_string(),
            malformed: true,
        };
    }
    Sanitized {
        text: stripped.trim().to_string(),
        malformed: false,
    }
}

/// Cleaned text, logging when the fallback kicks in.
pub fn strip_reasoning_trace(raw: &str) -> String {
    let sanitized = sanitize_model_output(raw);
    if sanitized.malformed {
        tracing::warn!(
            raw_len = raw.len(),
            "Unbalanced reasoning-trace markers in model output, keeping raw text"
        );
    }
    sanitized.text
}
