use futures::StreamExt;
use shared::models::Message;
use tracing::warn;

use super::generator::{GenerationEvent, GenerationRequest, Generator, ToolContext};

/// Instructions for the judging generation.
pub const FAITHFULNESS_INSTRUCTIONS: &str = "You check answers against retrieved context. \
Split the answer into its individual claims and count how many can be inferred from the \
context alone. Reply with a single number between 0 and 1: the supported claims divided by \
all claims. Reply with the number only.";

/// Scores how much of `reply` is supported by the tool output in `contexts`,
/// as a percentage.
///
/// `None` when there is no context, the judge fails or its answer holds no number.
pub async fn score_faithfulness(
    generator: &dyn Generator,
    model: &str,
    question: &Message,
    reply: &Message,
    contexts: &[ToolContext],
) -> Option<f64> {
    if contexts.is_empty() {
        return None;
    }

    let retrieved = contexts
        .iter()
        .map(|context| context.tool_output.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let sample = format!(
        "Question:\n{}\n\nContext:\n{retrieved}\n\nAnswer:\n{}",
        question.text(),
        reply.text()
    );

    let mut instructions =
        Message::system(&question.chat_id, &question.user_id, FAITHFULNESS_INSTRUCTIONS);
    instructions.id = format!("{}-faithfulness", reply.id);
    let request = GenerationRequest {
        conversation_id: question.chat_id.clone(),
        model: model.to_string(),
        history: vec![
            instructions,
            Message::user(&reply.id, &question.chat_id, &question.user_id, sample),
        ],
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
                        warn!(chat_id = %question.chat_id, error = %err, "faithfulness check failed mid-stream");
                        return None;
                    }
                }
            }
        }
        Err(err) => {
            warn!(chat_id = %question.chat_id, error = %err, "faithfulness check failed");
            return None;
        }
    }

    let score = parse_score(&raw);
    if score.is_none() {
        warn!(chat_id = %question.chat_id, answer = %raw, "faithfulness answer held no score");
    }
    score
}

/// First number in `raw`, clamped to `0..=1` and scaled to a percentage.
#[must_use]
pub fn parse_score(raw: &str) -> Option<f64> {
    raw.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|token| !token.is_empty())
        .find_map(|token| token.trim_end_matches('.').parse::<f64>().ok())
        .map(|score| score.clamp(0.0, 1.0) * 100.0)
}
