use crate::catalog::CatalogRecord;
use crate::llm::{ChatMessage, ContentBlock, ImageUrl, ProviderKind};
use crate::pipeline::vision::VisionPayload;

pub const CLOSING_INSTRUCTION: &str =
    "Return ONLY a single JSON object with the action plan, following the schema.";

pub fn fallback_user_prompt(sample: &[CatalogRecord]) -> String {
    let listing = serde_json::to_string(sample).unwrap_or_else(|_| String::from("[]"));
    format!("Catalog image sample:\n{listing}")
}

pub fn describe_image(payload: &VisionPayload<'_>) -> String {
    let record = payload.source;
    let id = record
        .id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| String::from("None"));
    let rating = record
        .rating()
        .map(|rating| rating.to_string())
        .unwrap_or_else(|| String::from("None"));
    format!(
        "Image ID={id} Path={} Rating={rating} Labels=[{}]",
        payload.path.display(),
        record.color_labels().join(",")
    )
}

/// Builds the conversation for one mode. Without images the sample itself
/// goes in as JSON text; with images each one becomes its own user message
/// in the shape the provider family expects.
pub fn build_messages(
    kind: ProviderKind,
    system_prompt: &str,
    sample: &[CatalogRecord],
    images: &[VisionPayload<'_>],
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];
    if images.is_empty() {
        messages.push(ChatMessage::user(fallback_user_prompt(sample)));
        return messages;
    }

    for payload in images {
        let description = describe_image(payload);
        let message = match kind {
            ProviderKind::Ollama => {
                ChatMessage::user_with_images(description, vec![payload.base64.clone()])
            }
            ProviderKind::OpenaiCompat => ChatMessage::user_blocks(vec![
                ContentBlock::Text { text: description },
                ContentBlock::ImageUrl {
                    image_url: ImageUrl {
                        url: payload.data_url.clone(),
                    },
                },
            ]),
        };
        messages.push(message);
    }
    messages.push(ChatMessage::user(CLOSING_INSTRUCTION));
    messages
}
