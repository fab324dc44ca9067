//! Prompt text for the reformulator and the answer generator.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::state::Message;

/// Stands in for the transcript when a thread has no history yet.
pub const EMPTY_HISTORY_MARKER: &str = "(no prior conversation)";

pub const MINIMAL_SYSTEM_PROMPT: &str =
    "You are Medha, a helpful assistant for the Computer Science department. \
Use only the context provided to answer accurately. \
If the context does not contain the answer, say so politely instead of guessing.";

/// Default template for the templated style. `{context}` and `{history}` are
/// substituted at generation time.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = r#"You are Medha, a helpful assistant for the Computer Science department.

Answer the user's question using ONLY the information in the context below.
- If the context does not contain the answer, say that you don't have that information.
- Keep answers short and factual. Quote names, emails and numbers exactly as they appear.
- Use the conversation so far to resolve references like "they" or "that course".

## Context
{context}

## Conversation so far
{history}"#;

/// One `Role: content` line per message, in order.
pub fn render_transcript(messages: &[Message]) -> String {
    if messages.is_empty() {
        return EMPTY_HISTORY_MARKER.to_string();
    }
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.label(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn reformulation_prompt(history: &[Message], question: &str) -> String {
    format!(
        "Given the conversation history and the user's latest question, rewrite the question \
so it can be understood without the history: replace every pronoun or reference with the \
entity it refers to. Do not answer it and do not add anything else. If the question is \
already self-contained, return it unchanged.\n\n\
Conversation history:\n{}\n\n\
User's latest question: {}\n\n\
Rewritten question:",
        render_transcript(history),
        question.trim()
    )
}

pub fn minimal_system_prompt(instructions: &str, context: &str) -> String {
    format!("{}\n\nContext:\n{}", instructions.trim(), context)
}

/// Fill `{context}` and `{history}` in one pass over the template, so braces
/// inside the substituted text are left alone. A template without a
/// `{context}` placeholder gets the context appended so answers stay grounded.
pub fn render_system_prompt(template: &str, context: &str, history: &[Message]) -> String {
    let transcript = render_transcript(history);
    let mut rendered = String::with_capacity(template.len() + context.len() + transcript.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let tail = &rest[open..];
        if let Some(after) = tail.strip_prefix("{context}") {
            rendered.push_str(context);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{history}") {
            rendered.push_str(&transcript);
            rest = after;
        } else {
            rendered.push('{');
            rest = &tail[1..];
        }
    }
    rendered.push_str(rest);

    if template.contains("{context}") {
        rendered
    } else {
        minimal_system_prompt(&rendered, context)
    }
}

/// Read a markdown prompt file, trimmed.
pub fn load_prompt(path: &Path) -> Result<String> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(anyhow!("Prompt file not found: {}", path.display()));
        }
        Err(e) => {
            let message = format!("Failed to read prompt file {}", path.display());
            return Err(e).context(message);
        }
    };
    let text = text.trim();
    if text.is_empty() {
        return Err(anyhow!("Prompt file is empty: {}", path.display()));
    }
    Ok(text.to_string())
}
