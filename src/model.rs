//! Provider-agnostic data models: roles, content parts, messages, responses
//! and stream tokens.

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Role of the message sender.
///
/// The lowercase string form is the stable wire identity; adapters that use
/// a different dialect (e.g. Gemini's `"model"`) map it themselves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an attachment payload lives: a remote URL or inline base64 data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    Url { url: String },
    Base64 { media_type: String, data: String },
}

impl Source {
    pub fn url(url: impl Into<String>) -> Self {
        Source::Url { url: url.into() }
    }

    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Source::Base64 {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Exactly one of url/data is populated and non-empty.
    pub fn is_populated(&self) -> bool {
        match self {
            Source::Url { url } => !url.is_empty(),
            Source::Base64 { media_type, data } => !media_type.is_empty() && !data.is_empty(),
        }
    }
}

/// The content kind of a part, used for capability checks and error messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Audio,
    Video,
    File,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::Audio => "audio",
            ContentKind::Video => "video",
            ContentKind::File => "file",
        };
        f.write_str(s)
    }
}

/// One part of a message. The variant is the tag and carries exactly the
/// payload that tag allows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { source: Source },
    Audio { source: Source },
    Video { source: Source },
    File { source: Source },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(source: Source) -> Self {
        ContentPart::Image { source }
    }

    pub fn audio(source: Source) -> Self {
        ContentPart::Audio { source }
    }

    pub fn video(source: Source) -> Self {
        ContentPart::Video { source }
    }

    pub fn file(source: Source) -> Self {
        ContentPart::File { source }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            ContentPart::Text { .. } => ContentKind::Text,
            ContentPart::Image { .. } => ContentKind::Image,
            ContentPart::Audio { .. } => ContentKind::Audio,
            ContentPart::Video { .. } => ContentKind::Video,
            ContentPart::File { .. } => ContentKind::File,
        }
    }

    pub fn source(&self) -> Option<&Source> {
        match self {
            ContentPart::Text { .. } => None,
            ContentPart::Image { source }
            | ContentPart::Audio { source }
            | ContentPart::Video { source }
            | ContentPart::File { source } => Some(source),
        }
    }
}

/// A single message in a conversation: a role plus at least one content part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub parts: NonEmpty<ContentPart>,
}

impl Message {
    /// A message holding a single text part.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: NonEmpty::new(ContentPart::text(text)),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self::text(Role::Tool, text)
    }

    /// The common "text plus one attachment" shape.
    pub fn with_attachment(role: Role, text: impl Into<String>, attachment: ContentPart) -> Self {
        Self {
            role,
            parts: NonEmpty::from((ContentPart::text(text), vec![attachment])),
        }
    }

    /// Concatenated text parts, `None` when the message carries no text.
    pub fn content(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }

    /// Check the structural invariants of a conversation:
    /// a tool message must follow an assistant message, a system message
    /// carries a single text part, and every attachment source is populated.
    pub fn validate_sequence(messages: &[Message]) -> Result<(), String> {
        let mut prev: Option<Role> = None;
        for (i, msg) in messages.iter().enumerate() {
            if msg.role == Role::Tool && prev != Some(Role::Assistant) {
                return Err(format!(
                    "message {i}: tool message must follow an assistant message"
                ));
            }
            if msg.role == Role::System
                && (msg.parts.len() != 1 || msg.parts.first().kind() != ContentKind::Text)
            {
                return Err(format!(
                    "message {i}: system message must be a single text part"
                ));
            }
            for part in msg.parts.iter() {
                if let Some(source) = part.source() {
                    if !source.is_populated() {
                        return Err(format!("message {i}: {} source is empty", part.kind()));
                    }
                }
            }
            prev = Some(msg.role);
        }
        Ok(())
    }
}

/// Reason the backend stopped generating.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    /// Default state while a response is still being assembled. If this is
    /// what the caller sees, the stream was cut short.
    Unfinished,
}

impl FinishReason {
    /// Whether an empty `content` is expected under this reason.
    pub fn allows_empty(&self) -> bool {
        !matches!(self, FinishReason::Stop)
    }
}

/// Token usage counters reported by the backend.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

impl std::ops::Add for Usage {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            prompt_tokens: self
                .prompt_tokens
                .map(|v| v + other.prompt_tokens.unwrap_or(0))
                .or(other.prompt_tokens),
            completion_tokens: self
                .completion_tokens
                .map(|v| v + other.completion_tokens.unwrap_or(0))
                .or(other.completion_tokens),
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        *self = self.clone() + other;
    }
}

/// A completed generation: the assistant's text plus finish/usage metadata.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    pub content: String,
    pub finish: Option<FinishReason>,
    pub usage: Usage,
}

impl Response {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish: Some(FinishReason::Stop),
            usage: Usage::default(),
        }
    }

    /// Clear the record for reuse, keeping allocated capacity.
    pub(crate) fn reset(&mut self) {
        self.content.clear();
        self.finish = None;
        self.usage = Usage::default();
    }
}

/// One element of a streamed response.
///
/// Every stream ends with exactly one token whose `finished` flag is set,
/// as its last element.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub finished: bool,
}

impl Token {
    pub fn piece(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finished: false,
        }
    }

    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finished: true,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.text.clear();
        self.finished = false;
    }
}
