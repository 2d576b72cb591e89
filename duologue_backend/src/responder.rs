use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::conversation::Message;
use crate::llm_client::{strip_reasoning, ChatMessage, LlmClient};
use crate::persona::Persona;

/// How many recent messages are shown to the model.
pub const CONTEXT_WINDOW: usize = 10;

const SEED_PROMPT: &str = "You are meeting your conversation partner for the first time. \
                           Open the conversation with a thought or question that invites a reply.";

/// Served when every source fails so the conversation still advances.
pub const FALLBACK_LINES: &[&str] = &[
    "I lost my train of thought for a moment. Where were we?",
    "Let me sit with that before I answer. What made you think of it?",
    "Something about that idea keeps pulling at me. Say more?",
    "I'm not sure I follow yet. Can you put it another way?",
    "Hm. I want to come back to that. What's on your mind right now?",
];

pub struct ResponseRequest<'a> {
    pub speaker: &'a Persona,
    pub partner: &'a Persona,
    pub history: &'a [Message],
    pub allow_images: bool,
}

#[async_trait]
pub trait ResponseSource: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, request: &ResponseRequest<'_>) -> Result<String>;
}

/// Chat-completion backed source; one instance per configured endpoint.
pub struct LlmResponseSource {
    name: String,
    client: LlmClient,
}

impl LlmResponseSource {
    pub fn new(name: impl Into<String>, client: LlmClient) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

#[async_trait]
impl ResponseSource for LlmResponseSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &ResponseRequest<'_>) -> Result<String> {
        self.client.generate(build_prompt(request)).await
    }
}

pub fn build_system_prompt(speaker: &Persona, partner: &Persona, allow_images: bool) -> String {
    let mut prompt = format!(
        "You are {}. You are in an ongoing, open-ended conversation with {}.\n\n{}",
        speaker.name, partner.name, speaker.instructions
    );
    if !speaker.style.trim().is_empty() {
        prompt.push_str(&format!("\n\nYour voice: {}.", speaker.style.trim()));
    }
    prompt.push_str(
        "\n\nReply with a single message of one to three short paragraphs. \
         Do not prefix your reply with your name.",
    );
    if allow_images {
        prompt.push_str(
            "\n\nRarely, when a picture would add something, you may include one line of the form \
             [IMAGE: short visual description].",
        );
    }
    prompt
}

/// Own lines become `assistant`, everything else `user` with attribution.
pub fn build_prompt(request: &ResponseRequest<'_>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(build_system_prompt(
        request.speaker,
        request.partner,
        request.allow_images,
    ))];

    let start = request.history.len().saturating_sub(CONTEXT_WINDOW);
    for message in &request.history[start..] {
        if message.is_from(request.speaker) {
            messages.push(ChatMessage::assistant(message.content.clone()));
        } else if message.is_system() {
            messages.push(ChatMessage::user(format!("[system] {}", message.content)));
        } else {
            messages.push(ChatMessage::user(format!(
                "{}: {}",
                message.entity, message.content
            )));
        }
    }

    let awaiting_reply = messages
        .last()
        .map(|last| last.role == "user")
        .unwrap_or(false);
    if !awaiting_reply {
        if messages.len() == 1 {
            messages.push(ChatMessage::user(SEED_PROMPT));
        } else {
            messages.push(ChatMessage::user(format!(
                "Continue the conversation with {}.",
                request.partner.name
            )));
        }
    }
    messages
}

/// Trim reasoning blocks and a self-attribution prefix the model sometimes adds.
pub fn clean_response(raw: &str, speaker: &Persona) -> String {
    let text = strip_reasoning(raw).trim();
    let prefix = format!("{}:", speaker.name);
    let text = match text.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(&prefix) => text[prefix.len()..].trim_start(),
        _ => text,
    };
    text.to_string()
}

/// Ordered chain of sources ending in canned lines. Never fails.
pub struct ResponseGenerator {
    sources: Vec<Arc<dyn ResponseSource>>,
}

impl ResponseGenerator {
    pub fn new(sources: Vec<Arc<dyn ResponseSource>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn generate(&self, request: &ResponseRequest<'_>) -> String {
        for source in &self.sources {
            match source.generate(request).await {
                Ok(raw) => {
                    let text = clean_response(&raw, request.speaker);
                    if !text.is_empty() {
                        tracing::debug!(
                            "{} answered via '{}' ({} chars)",
                            request.speaker.name,
                            source.name(),
                            text.len()
                        );
                        return text;
                    }
                    tracing::warn!("Source '{}' returned an empty response", source.name());
                }
                Err(e) => {
                    tracing::warn!("Source '{}' failed: {:#}", source.name(), e);
                }
            }
        }

        tracing::warn!(
            "All response sources failed for {}; using a fallback line",
            request.speaker.name
        );
        fallback_line().to_string()
    }
}

pub fn fallback_line() -> &'static str {
    FALLBACK_LINES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FALLBACK_LINES[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::PersonaId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn persona(id: PersonaId, name: &str) -> Persona {
        Persona {
            id,
            name: name.to_string(),
            instructions: format!("Be {}.", name),
            style: "brief".to_string(),
        }
    }

    struct Scripted {
        name: &'static str,
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, reply: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ResponseSource for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, _request: &ResponseRequest<'_>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Some(reply) => Ok(reply.to_string()),
                None => anyhow::bail!("{} is down", self.name),
            }
        }
    }

    #[test]
    fn prompt_attributes_speakers() {
        let a = persona(PersonaId::A, "Aurora");
        let b = persona(PersonaId::B, "Basalt");
        let history = vec![
            Message::system("Conversation started"),
            Message::new("Aurora", "Hello", None),
            Message::new("Basalt", "Hi back", None),
        ];
        let prompt = build_prompt(&ResponseRequest {
            speaker: &a,
            partner: &b,
            history: &history,
            allow_images: false,
        });

        assert_eq!(prompt[0].role, "system");
        assert!(prompt[0].content.contains("You are Aurora"));
        assert!(!prompt[0].content.contains("[IMAGE:"));
        assert_eq!(prompt[1], ChatMessage::user("[system] Conversation started"));
        assert_eq!(prompt[2], ChatMessage::assistant("Hello"));
        assert_eq!(prompt[3], ChatMessage::user("Basalt: Hi back"));
        assert_eq!(prompt.len(), 4);
    }

    #[test]
    fn empty_history_uses_seed_prompt() {
        let a = persona(PersonaId::A, "Aurora");
        let b = persona(PersonaId::B, "Basalt");
        let prompt = build_prompt(&ResponseRequest {
            speaker: &a,
            partner: &b,
            history: &[],
            allow_images: true,
        });
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[1].content, SEED_PROMPT);
        assert!(prompt[0].content.contains("[IMAGE:"));
    }

    #[test]
    fn prompt_is_limited_to_context_window() {
        let a = persona(PersonaId::A, "Aurora");
        let b = persona(PersonaId::B, "Basalt");
        let history: Vec<Message> = (0..25)
            .map(|n| Message::new("Basalt", format!("m{}", n), None))
            .collect();
        let prompt = build_prompt(&ResponseRequest {
            speaker: &a,
            partner: &b,
            history: &history,
            allow_images: false,
        });
        assert_eq!(prompt.len(), 1 + CONTEXT_WINDOW);
        assert_eq!(prompt[1].content, "Basalt: m15");
    }

    #[test]
    fn clean_response_strips_name_and_reasoning() {
        let a = persona(PersonaId::A, "Aurora");
        assert_eq!(
            clean_response("<think>plan</think> aurora: The sky hums.", &a),
            "The sky hums."
        );
        assert_eq!(clean_response("  plain  ", &a), "plain");
    }

    #[tokio::test]
    async fn chain_falls_through_to_next_source() {
        let a = persona(PersonaId::A, "Aurora");
        let b = persona(PersonaId::B, "Basalt");
        let local = Scripted::new("local", None);
        let empty = Scripted::new("empty", Some("   "));
        let remote = Scripted::new("remote", Some("From the paid model"));
        let sources: Vec<Arc<dyn ResponseSource>> = vec![local.clone(), empty.clone(), remote.clone()];
        let generator = ResponseGenerator::new(sources);

        let text = generator
            .generate(&ResponseRequest {
                speaker: &a,
                partner: &b,
                history: &[],
                allow_images: false,
            })
            .await;

        assert_eq!(text, "From the paid model");
        assert_eq!(local.calls.load(Ordering::SeqCst), 1);
        assert_eq!(empty.calls.load(Ordering::SeqCst), 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_sources_failing_yields_canned_line() {
        let a = persona(PersonaId::A, "Aurora");
        let b = persona(PersonaId::B, "Basalt");
        let down: Arc<dyn ResponseSource> = Scripted::new("down", None);
        let generator = ResponseGenerator::new(vec![down]);
        let text = generator
            .generate(&ResponseRequest {
                speaker: &a,
                partner: &b,
                history: &[],
                allow_images: false,
            })
            .await;
        assert!(FALLBACK_LINES.contains(&text.as_str()));
    }
}
