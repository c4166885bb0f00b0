use std::collections::HashSet;

use shared::models::{Message, Personality};

use super::chat_store::{ChatStore, StoreResult};

/// A freshly built system message and the documents it embeds.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemPrompt {
    /// Message to prepend to the transcript.
    pub message: Message,
    /// Personality and chat documents, deduplicated, personality first.
    pub document_ids: Vec<String>,
    /// Token count of those documents.
    pub token_count: u64,
}

/// Returns whether `current` names a document missing from `known`.
#[must_use]
pub fn has_new_documents(known: &HashSet<String>, current: &[String]) -> bool {
    current.iter().any(|id| !known.contains(id))
}

/// Builds the system message from the personality's instructions and the
/// text of its documents plus the chat's documents.
///
/// Returns `None` when the personality carries no instructions.
///
/// # Errors
/// Propagates store failures while reading documents.
pub async fn build_system_prompt(
    store: &dyn ChatStore,
    chat_id: &str,
    user_id: &str,
    personality: &Personality,
    chat_doc_ids: &[String],
) -> StoreResult<Option<SystemPrompt>> {
    let Some(instructions) = personality
        .instructions
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
    else {
        return Ok(None);
    };

    let mut seen = HashSet::new();
    let document_ids: Vec<String> = personality
        .doc_ids
        .iter()
        .chain(chat_doc_ids)
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();

    let (documents, token_count) = tokio::try_join!(
        store.read_documents(&document_ids),
        store.document_token_count(&document_ids),
    )?;

    let text = if documents.is_empty() {
        instructions.to_string()
    } else {
        format!("{instructions}\n\nDOCUMENTS:\n\n{}", documents.join("\n\n"))
    };

    Ok(Some(SystemPrompt {
        message: Message::system(chat_id, user_id, text),
        document_ids,
        token_count,
    }))
}
