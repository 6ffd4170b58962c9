//! Prompt construction for grounded answering.
//!
//! The prompt is a fixed instruction, the retrieved context and the question:
//!
//! ```text
//! Answer based only on the provided context.
//!
//! Context:
//! {context}
//!
//! Q: {question}
//! A:
//! ```
//!
//! # Known limitation
//!
//! Context longer than `max_context_chars` is cut at that many characters,
//! keeping the prefix, and [`TRUNCATION_MARKER`] is appended. The cut is
//! purely positional: lower-ranked chunks at the end of the context are the
//! ones lost, and the last kept chunk may be cut mid-sentence.

/// Instruction placed at the top of every prompt.
pub const SYSTEM_INSTRUCTION: &str = "Answer based only on the provided context.";

/// Appended to context that was cut.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Separator between retrieved chunks in the context string.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Default character budget for the context block.
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 5000;

/// Join retrieved chunks into a single context block.
pub fn join_context<S: AsRef<str>>(chunks: &[S]) -> String {
    chunks
        .iter()
        .map(|c| c.as_ref())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

/// Cut `context` to `max_chars` characters, appending the truncation marker
/// when anything was removed. Returns the context and whether it was cut.
pub fn truncate_context(context: &str, max_chars: usize) -> (String, bool) {
    match context.char_indices().nth(max_chars) {
        Some((byte_pos, _)) => {
            let mut cut = String::with_capacity(byte_pos + TRUNCATION_MARKER.len());
            cut.push_str(&context[..byte_pos]);
            cut.push_str(TRUNCATION_MARKER);
            (cut, true)
        }
        None => (context.to_string(), false),
    }
}

/// Build the generation prompt. Deterministic for identical inputs.
///
/// An empty context is tolerated; the model then has nothing to ground on and
/// is expected to say so.
pub fn build_prompt(context: &str, question: &str, max_context_chars: usize) -> String {
    let (context, truncated) = truncate_context(context, max_context_chars);
    if truncated {
        tracing::warn!(
            max_context_chars,
            "context exceeded limit and was truncated"
        );
    }
    format!(
        "{}\n\nContext:\n{}\n\nQ: {}\nA:",
        SYSTEM_INSTRUCTION, context, question
    )
}
