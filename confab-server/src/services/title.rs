use futures::StreamExt;
use shared::models::{Message, MessageRole};
use tracing::warn;

use super::generator::{GenerationEvent, GenerationRequest, Generator};

const TITLE_INSTRUCTIONS: &str = "You generate concise, descriptive chat titles from the \
first two messages of a conversation. Capture the main topic or intent. Keep it under 8 words. \
Use natural language and avoid vague phrases. Do not mention \"User\" or \"AI\". If the topic \
is unclear, use the most informative keyword or phrase. Reply with the title only.";

const MAX_TITLE_CHARS: usize = 80;
const FALLBACK_WORDS: usize = 6;
const UNTITLED: &str = "New chat";

/// Asks `generator` for a short title summarising the first exchange.
///
/// Never fails: generation errors and empty answers fall back to the first
/// words of the user's message.
pub async fn derive_title(
    generator: &dyn Generator,
    model: &str,
    user_message: &Message,
    reply: &Message,
) -> String {
    let mut prompt = Message::system(&user_message.chat_id, &user_message.user_id, TITLE_INSTRUCTIONS);
    prompt.id = format!("{}-title", user_message.id);

    let mut question = user_message.clone();
    question.role = MessageRole::User;
    let mut answer = reply.clone();
    answer.role = MessageRole::Assistant;

    let request = GenerationRequest {
        conversation_id: user_message.chat_id.clone(),
        model: model.to_string(),
        history: vec![prompt, question, answer],
        tools: Vec::new(),
    };

    let mut raw = String::new();
    match generator.generate(request).await {
        Ok(mut stream) => {
            while let Some(event) = stream.next().await {
                match event {
                    Ok(GenerationEvent::Token(text)) => raw.push_str(&text),
                    Ok(_) => {}
                    Err(err) => {
                        warn!(chat_id = %user_message.chat_id, error = %err, "title generation failed mid-stream");
                        break;
                    }
                }
            }
        }
        Err(err) => {
            warn!(chat_id = %user_message.chat_id, error = %err, "title generation failed");
        }
    }

    clean_title(&raw).unwrap_or_else(|| fallback_title(user_message))
}

/// Normalises a model-produced title. `None` when nothing usable remains.
#[must_use]
pub fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().find(|line| !line.trim().is_empty())?;
    let line = line.trim();
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("title:"))
        .unwrap_or(line);
    let trimmed = line
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '#'))
        .trim()
        .trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    Some(truncate(trimmed))
}

/// Title built from the opening words of the user's message.
#[must_use]
pub fn fallback_title(user_message: &Message) -> String {
    let text = user_message.text();
    let words: Vec<&str> = text.split_whitespace().take(FALLBACK_WORDS).collect();
    if words.is_empty() {
        UNTITLED.to_string()
    } else {
        truncate(&words.join(" "))
    }
}

fn truncate(title: &str) -> String {
    title.chars().take(MAX_TITLE_CHARS).collect::<String>().trim_end().to_string()
}
