//! Prompt assembly.
//!
//! Builds the user-content string sent to the completion service from the
//! knowledge blob, a window of recent turns, and the new question, plus the
//! system instruction for the configured [`PromptMode`].

use serde::Deserialize;

use crate::session::ChatTurn;

/// Exact reply the model must give in strict mode when the document does
/// not contain the answer.
pub const NOT_AVAILABLE: &str = "Information not available.";

const STRICT_INSTRUCTION: &str = "Answer only using the document. \
If the answer is not in the document, reply exactly: Information not available.";

const LENIENT_INSTRUCTION: &str = "Answer concisely using the document if possible. \
If the information is missing, respond in a helpful, friendly, or entertaining way. \
Never reply empty or 'Information not available'. Always engage the user.";

/// How closely answers must stick to the knowledge document.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    Strict,
    #[default]
    Lenient,
}

impl PromptMode {
    pub fn system_instruction(self) -> &'static str {
        match self {
            PromptMode::Strict => STRICT_INSTRUCTION,
            PromptMode::Lenient => LENIENT_INSTRUCTION,
        }
    }
}

/// Formats turns as alternating `User:` / `Bot:` lines.
pub fn format_transcript(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("User: {}\nBot: {}", t.question, t.answer))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assembles the three labeled sections in fixed order: document, recent
/// chat, question.
pub fn assemble(knowledge: &str, recent: &[ChatTurn], question: &str) -> String {
    format!(
        "Document:\n{}\n\nRecent chat:\n{}\n\nQuestion:\n{}",
        knowledge,
        format_transcript(recent),
        question
    )
}

/// Returns the trailing `n` turns of `turns`.
pub fn recent_window(turns: &[ChatTurn], n: usize) -> &[ChatTurn] {
    &turns[turns.len().saturating_sub(n)..]
}
