//! Google Gemini backend.
//!
//! See: <https://ai.google.dev/api/generate-content>

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
use crate::model::{ContentPart, FinishReason, Message, Response, Role, Source, Usage};
use crate::options::{CallOption, GeminiOptions, ProviderOptions, SafetySetting, SecretString, TransportOptions};
use crate::pool::{response_pool, token_pool};
use crate::sse::SseResponseExt;

const BACKEND_NAME: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini backend over `generateContent`.
///
/// Accepts every content kind: text plus inline or URI-referenced media.
pub struct GeminiBackend {
    api_key: SecretString,
    base_url: String,
    model: String,
    defaults: ProviderOptions,
    extra: GeminiOptions,
    transport: TransportOptions,
    cache: ConversionCache<GeminiConverted>,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<SecretString>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            defaults: ProviderOptions::default(),
            extra: GeminiOptions::default(),
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

    pub fn with_extra(mut self, extra: GeminiOptions) -> Self {
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

    fn merged_options(&self, opts: &[CallOption]) -> (ProviderOptions, GeminiOptions) {
        let mut common = self.defaults.clone();
        common.apply(opts);
        let mut extra = self.extra.clone();
        for opt in opts {
            opt.apply_gemini(&mut extra);
        }
        (common, extra)
    }

    fn request_body(&self, messages: &[Message], opts: &[CallOption]) -> Result<GeminiRequest> {
        Message::validate_sequence(messages).map_err(Error::InvalidMessages)?;
        let converted = self.cache.get_or_convert(messages, convert_messages)?;
        let (common, extra) = self.merged_options(opts);

        Ok(GeminiRequest {
            contents: converted.contents,
            system_instruction: converted.system_instruction,
            generation_config: GeminiGenerationConfig {
                temperature: common.wire_temperature(),
                top_p: common.wire_top_p(),
                top_k: extra.top_k,
                max_output_tokens: common.wire_max_tokens(),
                stop_sequences: common.wire_stop_sequences(),
                frequency_penalty: common.wire_frequency_penalty(),
                presence_penalty: common.wire_presence_penalty(),
            },
            safety_settings: extra.safety_settings,
        })
    }

    fn build_request(
        &self,
        messages: &[Message],
        opts: &[CallOption],
        stream: bool,
    ) -> Result<reqwest::RequestBuilder> {
        let body = self.request_body(messages, opts)?;

        let method = if stream {
            "streamGenerateContent?alt=sse&"
        } else {
            "generateContent?"
        };
        let url = format!(
            "{}/models/{}:{}key={}",
            self.base_url,
            self.model,
            method,
            self.api_key.expose_secret()
        );

        let client = build_http_client(&self.transport)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut req = client.post(&url).headers(headers);
        req = add_extra_headers(req, &self.transport);
        Ok(req.json_logged(&body))
    }

    fn error_from_body(status: u16, body: &str, operation: &'static str) -> Error {
        let message = serde_json::from_str::<GeminiErrorResponse>(body)
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

/// System turns go into `system_instruction`; assistant turns become the
/// dialect's `model` role and tool turns user turns, preserving order.
fn convert_messages(messages: &[Message]) -> Result<GeminiConverted> {
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents = Vec::new();

    for msg in messages {
        if msg.role == Role::System {
            if let Some(text) = msg.content() {
                system_texts.push(text);
            }
            continue;
        }

        let role = match msg.role {
            Role::Assistant => "model",
            _ => "user",
        };

        let parts = msg.parts.iter().map(convert_part).collect();
        contents.push(GeminiContent {
            role: role.to_string(),
            parts,
        });
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart::Text {
                text: system_texts.join("\n\n"),
            }],
        })
    };

    Ok(GeminiConverted {
        system_instruction,
        contents,
    })
}

fn convert_part(part: &ContentPart) -> GeminiPart {
    match part {
        ContentPart::Text { text } => GeminiPart::Text { text: text.clone() },
        other => match other.source() {
            Some(Source::Base64 { media_type, data }) => GeminiPart::InlineData {
                inline_data: GeminiInlineData {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                },
            },
            Some(Source::Url { url }) => GeminiPart::FileData {
                file_data: GeminiFileData {
                    file_uri: url.clone(),
                },
            },
            None => GeminiPart::Text {
                text: String::new(),
            },
        },
    }
}

fn extract_response(wire: GeminiResponse) -> Result<Response> {
    let candidate = wire
        .candidates
        .and_then(|mut candidates| {
            if candidates.is_empty() {
                None
            } else {
                Some(candidates.remove(0))
            }
        })
        .ok_or_else(|| {
            if let Some(feedback) = &wire.prompt_feedback {
                if let Some(reason) = &feedback.block_reason {
                    return Error::from(ProviderError::new(
                        BACKEND_NAME,
                        "generate_message",
                        ErrorKind::ContentFiltered,
                        format!("prompt blocked: {reason}"),
                    ));
                }
            }
            bad_response("generate_message", "empty candidate list")
        })?;

    if let Some(reason) = candidate.finish_reason.as_deref() {
        if matches!(reason, "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT") {
            return Err(ProviderError::new(
                BACKEND_NAME,
                "generate_message",
                ErrorKind::ContentFiltered,
                format!("generation stopped: {reason}"),
            )
            .into());
        }
    }

    let mut response = response_pool().get();
    if let Some(content) = candidate.content {
        for part in content.parts {
            if let Some(text) = part.text {
                response.content.push_str(&text);
            }
        }
    }
    response.finish = Some(match candidate.finish_reason.as_deref() {
        Some("MAX_TOKENS") => FinishReason::Length,
        _ => FinishReason::Stop,
    });
    if let Some(usage) = wire.usage_metadata {
        response.usage = Usage {
            prompt_tokens: Some(usage.prompt_token_count),
            completion_tokens: usage.candidates_token_count,
        };
    }
    Ok(response)
}

#[async_trait]
impl Backend for GeminiBackend {
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

        let wire: GeminiResponse = response
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

                let chunk: GeminiResponse = match serde_json::from_str(&payload) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        debug!(error = %err, "undecodable stream event");
                        let mut token = token_pool().get();
                        token.finished = true;
                        yield token;
                        return;
                    }
                };

                let Some(candidate) = chunk.candidates.and_then(|mut c| {
                    if c.is_empty() { None } else { Some(c.remove(0)) }
                }) else {
                    continue;
                };

                if let Some(content) = candidate.content {
                    for part in content.parts {
                        if let Some(text) = part.text {
                            if !text.is_empty() {
                                let mut token = token_pool().get();
                                token.text.push_str(&text);
                                yield token;
                            }
                        }
                    }
                }

                if candidate.finish_reason.is_some() {
                    let mut token = token_pool().get();
                    token.finished = true;
                    yield token;
                    return;
                }
            }

            let mut token = token_pool().get();
            token.finished = true;
            yield token;
        }))
    }
}

// --- Wire types ---

/// Cached conversion output.
#[derive(Debug, Clone)]
struct GeminiConverted {
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
    safety_settings: Option<Vec<SafetySetting>>,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    FileData {
        #[serde(rename = "fileData")]
        file_data: GeminiFileData,
    },
}

#[derive(Debug, Clone, Serialize)]
struct GeminiInlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiFileData {
    #[serde(rename = "fileUri")]
    file_uri: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    max_output_tokens: Option<u32>,
    stop_sequences: Option<Vec<String>>,
    frequency_penalty: Option<f32>,
    presence_penalty: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    parts: Vec<GeminiCandidatePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: u32,
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> GeminiBackend {
        GeminiBackend::new("test-key", "gemini-2.0-flash")
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let body = backend()
            .request_body(
                &[Message::user("hi"), Message::assistant("hello")],
                &[],
            )
            .unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["contents"][0]["role"], json!("user"));
        assert_eq!(value["contents"][1]["role"], json!("model"));
    }

    #[test]
    fn system_message_becomes_system_instruction() {
        let body = backend()
            .request_body(&[Message::system("be helpful"), Message::user("hi")], &[])
            .unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value["system_instruction"]["parts"][0]["text"],
            json!("be helpful")
        );
        assert_eq!(value["contents"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn default_generation_config_is_empty() {
        let body = backend().request_body(&[Message::user("hi")], &[]).unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["generation_config"], json!({}));
    }

    #[test]
    fn gemini_options_reach_generation_config() {
        let body = backend()
            .request_body(
                &[Message::user("hi")],
                &[
                    CallOption::TopK(40),
                    CallOption::Temperature(0.25),
                    CallOption::StopSequences(vec!["STOP".into()]),
                ],
            )
            .unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["generation_config"]["topK"], json!(40));
        assert_eq!(value["generation_config"]["temperature"], json!(0.25));
        assert_eq!(value["generation_config"]["stopSequences"], json!(["STOP"]));
    }

    #[test]
    fn media_attachments_are_accepted() {
        let messages = [Message::with_attachment(
            Role::User,
            "what is playing?",
            ContentPart::audio(Source::base64("audio/mp3", "QUJD")),
        )];
        let body = backend().request_body(&messages, &[]).unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value["contents"][0]["parts"][1]["inlineData"]["mimeType"],
            json!("audio/mp3")
        );
    }

    #[test]
    fn url_attachment_becomes_file_data() {
        let messages = [Message::with_attachment(
            Role::User,
            "summarize",
            ContentPart::file(Source::url("https://example.com/doc.pdf")),
        )];
        let body = backend().request_body(&messages, &[]).unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value["contents"][0]["parts"][1]["fileData"]["fileUri"],
            json!("https://example.com/doc.pdf")
        );
    }

    #[test]
    fn repeated_conversion_hits_the_cache() {
        let backend = backend();
        let messages = [Message::user("hi")];
        backend.request_body(&messages, &[]).unwrap();
        backend.request_body(&messages, &[]).unwrap();
        assert_eq!(backend.cache_conversions(), 1);
        assert_eq!(backend.cache_hits(), 1);
    }

    #[test]
    fn safety_finish_is_content_filtered() {
        let wire = GeminiResponse {
            candidates: Some(vec![GeminiCandidate {
                content: None,
                finish_reason: Some("SAFETY".into()),
            }]),
            prompt_feedback: None,
            usage_metadata: None,
        };
        assert!(extract_response(wire).unwrap_err().is_content_filtered());
    }

    #[test]
    fn blocked_prompt_is_content_filtered() {
        let wire = GeminiResponse {
            candidates: None,
            prompt_feedback: Some(GeminiPromptFeedback {
                block_reason: Some("SAFETY".into()),
            }),
            usage_metadata: None,
        };
        assert!(extract_response(wire).unwrap_err().is_content_filtered());
    }

    #[test]
    fn missing_candidates_without_feedback_is_bad_response() {
        let wire = GeminiResponse {
            candidates: Some(vec![]),
            prompt_feedback: None,
            usage_metadata: None,
        };
        assert!(extract_response(wire)
            .unwrap_err()
            .matches(ErrorKind::BadResponse));
    }

    #[test]
    fn candidate_text_parts_are_concatenated() {
        let wire = GeminiResponse {
            candidates: Some(vec![GeminiCandidate {
                content: Some(GeminiCandidateContent {
                    parts: vec![
                        GeminiCandidatePart {
                            text: Some("first ".into()),
                        },
                        GeminiCandidatePart { text: None },
                        GeminiCandidatePart {
                            text: Some("second".into()),
                        },
                    ],
                }),
                finish_reason: Some("STOP".into()),
            }]),
            prompt_feedback: None,
            usage_metadata: Some(GeminiUsageMetadata {
                prompt_token_count: 4,
                candidates_token_count: Some(6),
            }),
        };
        let response = extract_response(wire).unwrap();
        assert_eq!(response.content, "first second");
        assert_eq!(response.usage.completion_tokens, Some(6));
    }
}
