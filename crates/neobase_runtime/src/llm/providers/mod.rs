pub mod gemini;
pub mod ollama;
pub mod openai;

use crate::llm::render_history_content;
use crate::types::{LlmMessageRecord, MessageRole};

/// Flattens persisted history into (role, text) pairs, dropping records
/// with no replayable content.
pub(crate) fn shaped_history(history: &[LlmMessageRecord]) -> Vec<(MessageRole, String)> {
    history
        .iter()
        .filter_map(|record| render_history_content(record).map(|text| (record.role, text)))
        .collect()
}
