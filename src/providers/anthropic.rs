//! Anthropic Messages backend.
//!
//! See: <https://docs.anthropic.com/en/api/messages>

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::debug;

use crate::backend::{Backend, TokenStream};
use crate::cache::ConversionCache;
use crate::error::{classify_http, Error, ErrorKind, ProviderError, Result};
use crate::http::{add_extra_headers, build_http_client, RequestBuilderExt, ResponseExt};
use crate::model::{ContentKind, ContentPart, FinishReason, Message, Response, Role, Source, Usage};
use crate::options::{AnthropicOptions, CallOption, ProviderOptions, SecretString, TransportOptions};
use crate::pool::{response_pool, token_pool};
use crate::sse::SseResponseExt;

const BACKEND_NAME: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const SUPPORTED_KINDS: &[ContentKind] = &[ContentKind::Text, ContentKind::Image];

/// Anthropic backend over the Messages endpoint.
pub struct AnthropicBackend {
    api_key: SecretString,
    base_url: String,
    model: String,
    defaults: ProviderOptions,
    extra: AnthropicOptions,
    transport: TransportOptions,
    cache: ConversionCache<AnthropicConverted>,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<SecretString>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            defaults: ProviderOptions::default(),
            extra: AnthropicOptions::default(),
            transport: TransportOptions::default(),
            cache: ConversionCache::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_defaults(mut self, defaults: ProviderOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_extra(mut self, extra: AnthropicOptions) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache.hits()
    }

    pub fn cache_conversions(&self) -> u64 {
        self.cache.conversions()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn merged_options(&self, opts: &[CallOption]) -> (ProviderOptions, AnthropicOptions) {
        let mut common = self.defaults.clone();
        common.apply(opts);
        let mut extra = self.extra.clone();
        for opt in opts {
            opt.apply_anthropic(&mut extra);
        }
        (common, extra)
    }

    fn request_body(
        &self,
        messages: &[Message],
        opts: &[CallOption],
        stream: bool,
    ) -> Result<AnthropicRequest> {
        Message::validate_sequence(messages).map_err(Error::InvalidMessages)?;
        validate_content(messages)?;
        let converted = self.cache.get_or_convert(messages, convert_messages)?;
        let (common, extra) = self.merged_options(opts);

        Ok(AnthropicRequest {
            model: self.model.clone(),
            messages: converted.messages,
            // The Messages endpoint requires max_tokens on every request.
            max_tokens: common.max_tokens,
            system: converted.system,
            temperature: common.wire_temperature(),
            top_p: common.wire_top_p(),
            top_k: extra.top_k,
            stop_sequences: common.wire_stop_sequences(),
            stream: stream.then_some(true),
        })
    }

    fn build_request(
        &self,
        messages: &[Message],
        opts: &[CallOption],
        stream: bool,
    ) -> Result<reqwest::RequestBuilder> {
        let body = self.request_body(messages, opts, stream)?;

        let client = build_http_client(&self.transport)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.expose_secret())
                .map_err(|_| Error::Config("invalid API key".to_string()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));

        let url = format!("{}/messages", self.base_url);
        let mut req = client.post(&url).headers(headers);
        req = add_extra_headers(req, &self.transport);
        Ok(req.json_logged(&body))
    }

    fn error_from_body(status: u16, body: &str, operation: &'static str) -> Error {
        let message = serde_json::from_str::<AnthropicErrorResponse>(body)
            .map(|resp| resp.error.message)
            .unwrap_or_else(|_| body.to_string());
        classify_http(BACKEND_NAME, operation, status, &message).into()
    }
}

fn transport_error(operation: &'static str, err: reqwest::Error) -> Error {
    ProviderError::new(BACKEND_NAME, operation, ErrorKind::Unavailable, err.to_string()).into()
}

fn bad_response(operation: &'static str, detail: impl std::fmt::Display) -> Error {
    ProviderError::new(BACKEND_NAME, operation, ErrorKind::BadResponse, detail.to_string()).into()
}

fn validate_content(messages: &[Message]) -> Result<()> {
    for msg in messages {
        for part in msg.parts.iter() {
            if !SUPPORTED_KINDS.contains(&part.kind()) {
                return Err(ProviderError::unsupported_content(BACKEND_NAME, part.kind()).into());
            }
        }
    }
    Ok(())
}

/// System turns are lifted into the request's sibling `system` field; tool
/// turns become user turns since the dialect has no tool role, preserving
/// order.
fn convert_messages(messages: &[Message]) -> Result<AnthropicConverted> {
    let mut system_texts: Vec<String> = Vec::new();
    let mut wire_messages = Vec::new();

    for msg in messages {
        if msg.role == Role::System {
            if let Some(text) = msg.content() {
                system_texts.push(text);
            }
            continue;
        }

        let role = match msg.role {
            Role::Assistant => "assistant",
            _ => "user",
        };

        let mut blocks = Vec::new();
        for part in msg.parts.iter() {
            match part {
                ContentPart::Text { text } => {
                    blocks.push(AnthropicContentBlock::Text { text: text.clone() })
                }
                ContentPart::Image { source } => blocks.push(AnthropicContentBlock::Image {
                    source: convert_image_source(source),
                }),
                other => {
                    return Err(
                        ProviderError::unsupported_content(BACKEND_NAME, other.kind()).into()
                    )
                }
            }
        }
        wire_messages.push(AnthropicMessage {
            role: role.to_string(),
            content: blocks,
        });
    }

    let system = if system_texts.is_empty() {
        None
    } else {
        Some(system_texts.join("\n\n"))
    };
    Ok(AnthropicConverted {
        system,
        messages: wire_messages,
    })
}

fn convert_image_source(source: &Source) -> AnthropicImageSource {
    match source {
        Source::Url { url } => AnthropicImageSource::Url { url: url.clone() },
        Source::Base64 { media_type, data } => AnthropicImageSource::Base64 {
            media_type: media_type.clone(),
            data: data.clone(),
        },
    }
}

fn extract_response(wire: AnthropicResponse) -> Result<Response> {
    if wire.stop_reason.as_deref() == Some("refusal") {
        return Err(ProviderError::new(
            BACKEND_NAME,
            "generate_message",
            ErrorKind::ContentFiltered,
            "generation refused by the safety layer",
        )
        .into());
    }

    if wire.content.is_empty() {
        return Err(bad_response("generate_message", "empty candidate list"));
    }

    let mut response = response_pool().get();
    for block in &wire.content {
        if let AnthropicResponseBlock::Text { text } = block {
            response.content.push_str(text);
        }
    }
    response.finish = Some(match wire.stop_reason.as_deref() {
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Stop,
    });
    if let Some(usage) = wire.usage {
        response.usage = Usage {
            prompt_tokens: Some(usage.input_tokens),
            completion_tokens: Some(usage.output_tokens),
        };
    }
    Ok(response)
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn generate_message(
        &self,
        messages: &[Message],
        opts: &[CallOption],
    ) -> Result<Response> {
        let req = self.build_request(messages, opts, false)?;
        let response = req
            .send()
            .await
            .map_err(|err| transport_error("generate_message", err))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text_logged().await.unwrap_or_default();
            return Err(Self::error_from_body(status.as_u16(), &body, "generate_message"));
        }

        let wire: AnthropicResponse = response
            .json_logged()
            .await
            .map_err(|err| bad_response("generate_message", err))?;
        extract_response(wire)
    }

    async fn stream_message(
        &self,
        messages: &[Message],
        opts: &[CallOption],
    ) -> Result<TokenStream> {
        let req = self.build_request(messages, opts, true)?;
        let response = req
            .send()
            .await
            .map_err(|err| transport_error("stream_message", err))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text_logged().await.unwrap_or_default();
            return Err(Self::error_from_body(status.as_u16(), &body, "stream_message"));
        }

        let sse = response.sse();
        Ok(Box::pin(async_stream::stream! {
            let mut sse = Box::pin(sse);
            while let Some(event) = sse.next().await {
                let payload = match event {
                    Ok(payload) => payload,
                    Err(err) => {
                        debug!(error = %err, "stream read failed mid-flight");
                        let mut token = token_pool().get();
                        token.finished = true;
                        yield token;
                        return;
                    }
                };

                let event: AnthropicStreamEvent = match serde_json::from_str(&payload) {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(error = %err, "undecodable stream event");
                        let mut token = token_pool().get();
                        token.finished = true;
                        yield token;
                        return;
                    }
                };

                match event {
                    AnthropicStreamEvent::ContentBlockDelta { delta } => {
                        if let AnthropicDelta::TextDelta { text } = delta {
                            if !text.is_empty() {
                                let mut token = token_pool().get();
                                token.text.push_str(&text);
                                yield token;
                            }
                        }
                    }
                    AnthropicStreamEvent::MessageDelta { delta } => {
                        if delta.stop_reason.is_some() {
                            let mut token = token_pool().get();
                            token.finished = true;
                            yield token;
                            return;
                        }
                    }
                    AnthropicStreamEvent::MessageStop => {
                        let mut token = token_pool().get();
                        token.finished = true;
                        yield token;
                        return;
                    }
                    AnthropicStreamEvent::Other => {}
                }
            }

            let mut token = token_pool().get();
            token.finished = true;
            yield token;
        }))
    }
}

// --- Wire types ---

/// Cached conversion output: the lifted system text plus the wire messages.
#[derive(Debug, Clone)]
struct AnthropicConverted {
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    system: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    stop_sequences: Option<Vec<String>>,
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    ContentBlockDelta {
        delta: AnthropicDelta,
    },
    MessageDelta {
        delta: AnthropicMessageDelta,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> AnthropicBackend {
        AnthropicBackend::new("sk-ant-test", "claude-sonnet-4-20250514")
    }

    #[test]
    fn max_tokens_is_always_sent() {
        let body = backend()
            .request_body(&[Message::user("hi")], &[], false)
            .unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["max_tokens"], json!(1024));
        assert_eq!(value.get("temperature"), None);
    }

    #[test]
    fn system_message_is_lifted_to_sibling_field() {
        let body = backend()
            .request_body(
                &[Message::system("be terse"), Message::user("hi")],
                &[],
                false,
            )
            .unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["system"], json!("be terse"));
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
        assert_eq!(value["messages"][0]["role"], json!("user"));
    }

    #[test]
    fn tool_turn_becomes_user_turn_in_order() {
        let body = backend()
            .request_body(
                &[
                    Message::user("question"),
                    Message::assistant("using a tool"),
                    Message::tool("tool output"),
                ],
                &[],
                false,
            )
            .unwrap();
        let roles: Vec<_> = body.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
    }

    #[test]
    fn base64_image_becomes_source_block() {
        let messages = [Message::with_attachment(
            Role::User,
            "describe",
            ContentPart::image(Source::base64("image/jpeg", "QUJD")),
        )];
        let body = backend().request_body(&messages, &[], false).unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["content"][1]["type"], json!("image"));
        assert_eq!(
            value["messages"][0]["content"][1]["source"]["media_type"],
            json!("image/jpeg")
        );
    }

    #[test]
    fn video_content_is_rejected() {
        let backend = backend();
        let messages = [Message::with_attachment(
            Role::User,
            "watch",
            ContentPart::video(Source::url("https://example.com/clip.mp4")),
        )];
        let err = backend.request_body(&messages, &[], false).unwrap_err();
        assert!(err.matches(ErrorKind::UnsupportedContent));
    }

    #[test]
    fn repeated_conversion_hits_the_cache() {
        let backend = backend();
        let messages = [Message::system("be terse"), Message::user("hi")];
        backend.request_body(&messages, &[], false).unwrap();
        backend.request_body(&messages, &[], false).unwrap();
        assert_eq!(backend.cache_conversions(), 1);
        assert_eq!(backend.cache_hits(), 1);
    }

    #[test]
    fn refusal_stop_reason_is_content_filtered() {
        let wire = AnthropicResponse {
            content: vec![AnthropicResponseBlock::Text {
                text: "nope".into(),
            }],
            stop_reason: Some("refusal".into()),
            usage: None,
        };
        assert!(extract_response(wire).unwrap_err().is_content_filtered());
    }

    #[test]
    fn text_blocks_are_concatenated() {
        let wire = AnthropicResponse {
            content: vec![
                AnthropicResponseBlock::Text { text: "one ".into() },
                AnthropicResponseBlock::Other,
                AnthropicResponseBlock::Text { text: "two".into() },
            ],
            stop_reason: Some("end_turn".into()),
            usage: Some(AnthropicUsage {
                input_tokens: 5,
                output_tokens: 2,
            }),
        };
        let response = extract_response(wire).unwrap();
        assert_eq!(response.content, "one two");
        assert_eq!(response.finish, Some(FinishReason::Stop));
        assert_eq!(response.usage.prompt_tokens, Some(5));
    }

    #[test]
    fn empty_content_is_a_bad_response() {
        let wire = AnthropicResponse {
            content: vec![],
            stop_reason: None,
            usage: None,
        };
        assert!(extract_response(wire)
            .unwrap_err()
            .matches(ErrorKind::BadResponse));
    }
}
