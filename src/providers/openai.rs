//! OpenAI Chat Completions backend.
//!
//! See: <https://platform.openai.com/docs/api-reference/chat>

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::debug;

use crate::backend::{Backend, TokenStream};
use crate::cache::ConversionCache;
use crate::error::{classify_http, Error, ErrorKind, ProviderError, Result};
use crate::http::{add_extra_headers, build_http_client, RequestBuilderExt, ResponseExt};
use crate::model::{ContentKind, ContentPart, FinishReason, Message, Response, Source, Usage};
use crate::options::{CallOption, OpenAiOptions, ProviderOptions, SecretString, TransportOptions};
use crate::pool::{response_pool, token_pool};
use crate::sse::SseResponseExt;

const BACKEND_NAME: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const SUPPORTED_KINDS: &[ContentKind] = &[ContentKind::Text, ContentKind::Image];

/// OpenAI backend over the Chat Completions endpoint.
pub struct OpenAiBackend {
    api_key: SecretString,
    base_url: String,
    model: String,
    defaults: ProviderOptions,
    extra: OpenAiOptions,
    transport: TransportOptions,
    cache: ConversionCache<Vec<OpenAiMessage>>,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<SecretString>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            defaults: ProviderOptions::default(),
            extra: OpenAiOptions::default(),
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

    pub fn with_extra(mut self, extra: OpenAiOptions) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    /// Lookups served by the conversion cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache.hits()
    }

    /// Conversions that actually ran.
    pub fn cache_conversions(&self) -> u64 {
        self.cache.conversions()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn merged_options(&self, opts: &[CallOption]) -> (ProviderOptions, OpenAiOptions) {
        let mut common = self.defaults.clone();
        common.apply(opts);
        let mut extra = self.extra.clone();
        for opt in opts {
            opt.apply_openai(&mut extra);
        }
        (common, extra)
    }

    fn request_body(
        &self,
        messages: &[Message],
        opts: &[CallOption],
        stream: bool,
    ) -> Result<OpenAiRequest> {
        Message::validate_sequence(messages).map_err(Error::InvalidMessages)?;
        validate_content(messages)?;
        let wire_messages = self.cache.get_or_convert(messages, convert_messages)?;
        let (common, extra) = self.merged_options(opts);

        Ok(OpenAiRequest {
            model: self.model.clone(),
            messages: wire_messages,
            temperature: common.wire_temperature(),
            max_tokens: common.wire_max_tokens(),
            top_p: common.wire_top_p(),
            stop: common.wire_stop_sequences(),
            frequency_penalty: common.wire_frequency_penalty(),
            presence_penalty: common.wire_presence_penalty(),
            logit_bias: extra.logit_bias,
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
        let (_, extra) = self.merged_options(opts);

        let client = build_http_client(&self.transport)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key.expose_secret()))
                .map_err(|_| Error::Config("invalid API key".to_string()))?,
        );
        if let Some(org) = &extra.organization {
            headers.insert(
                "OpenAI-Organization",
                HeaderValue::from_str(org)
                    .map_err(|_| Error::Config("invalid organization id".to_string()))?,
            );
        }

        let url = format!("{}/chat/completions", self.base_url);
        let mut req = client.post(&url).headers(headers);
        req = add_extra_headers(req, &self.transport);
        Ok(req.json_logged(&body))
    }

    fn error_from_body(status: u16, body: &str, operation: &'static str) -> Error {
        let message = serde_json::from_str::<OpenAiErrorResponse>(body)
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

fn convert_messages(messages: &[Message]) -> Result<Vec<OpenAiMessage>> {
    messages.iter().map(convert_message).collect()
}

fn convert_message(msg: &Message) -> Result<OpenAiMessage> {
    let role = msg.role.as_str().to_string();

    // A single text part keeps the compact string form.
    if msg.parts.len() == 1 {
        if let ContentPart::Text { text } = msg.parts.first() {
            return Ok(OpenAiMessage {
                role,
                content: OpenAiContent::Text(text.clone()),
            });
        }
    }

    let mut parts = Vec::new();
    for part in msg.parts.iter() {
        match part {
            ContentPart::Text { text } => parts.push(OpenAiContentPart::Text { text: text.clone() }),
            ContentPart::Image { source } => parts.push(OpenAiContentPart::ImageUrl {
                image_url: OpenAiImageUrl {
                    url: image_url(source),
                },
            }),
            other => {
                return Err(ProviderError::unsupported_content(BACKEND_NAME, other.kind()).into())
            }
        }
    }
    Ok(OpenAiMessage {
        role,
        content: OpenAiContent::Parts(parts),
    })
}

fn image_url(source: &Source) -> String {
    match source {
        Source::Url { url } => url.clone(),
        Source::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
    }
}

fn extract_response(wire: OpenAiResponse) -> Result<Response> {
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| bad_response("generate_message", "empty candidate list"))?;

    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(ProviderError::new(
            BACKEND_NAME,
            "generate_message",
            ErrorKind::ContentFiltered,
            "generation stopped by the content filter",
        )
        .into());
    }

    let mut response = response_pool().get();
    if let Some(message) = choice.message {
        if let Some(content) = message.content {
            response.content.push_str(&content);
        }
    }
    response.finish = Some(match choice.finish_reason.as_deref() {
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    });
    if let Some(usage) = wire.usage {
        response.usage = Usage {
            prompt_tokens: Some(usage.prompt_tokens),
            completion_tokens: Some(usage.completion_tokens),
        };
    }
    Ok(response)
}

#[async_trait]
impl Backend for OpenAiBackend {
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

        let wire: OpenAiResponse = response
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

                let chunk: OpenAiStreamChunk = match serde_json::from_str(&payload) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        debug!(error = %err, "undecodable stream event");
                        let mut token = token_pool().get();
                        token.finished = true;
                        yield token;
                        return;
                    }
                };

                for choice in chunk.choices {
                    if let Some(delta) = choice.delta {
                        if let Some(text) = delta.content {
                            if !text.is_empty() {
                                let mut token = token_pool().get();
                                token.text.push_str(&text);
                                yield token;
                            }
                        }
                    }
                    if choice.finish_reason.is_some() {
                        let mut token = token_pool().get();
                        token.finished = true;
                        yield token;
                        return;
                    }
                }
            }

            // The feed ended on [DONE] without an explicit finish event.
            let mut token = token_pool().get();
            token.finished = true;
            yield token;
        }))
    }
}

// --- Wire types ---

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    stop: Option<Vec<String>>,
    frequency_penalty: Option<f32>,
    presence_penalty: Option<f32>,
    logit_bias: Option<HashMap<String, f64>>,
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct OpenAiMessage {
    role: String,
    content: OpenAiContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Clone, Serialize)]
struct OpenAiImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
}
