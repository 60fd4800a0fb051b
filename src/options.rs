//! Per-call option model: a defaults record mutated by `CallOption` values,
//! plus transport configuration and the secret-string wrapper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A secret string type for sensitive data like API keys.
/// Prevents accidental logging or display of secrets.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TOP_P: f32 = 1.0;

/// The common per-call knobs, held as concrete values over documented
/// defaults. A knob equal to its default is omitted from the wire so the
/// backend applies its own; `max_tokens` is still sent where a backend
/// requires the field.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: DEFAULT_TOP_P,
            stop_sequences: Vec::new(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl ProviderOptions {
    /// Fold call options over `self`, last write wins.
    pub fn apply(&mut self, opts: &[CallOption]) {
        for opt in opts {
            opt.apply_common(self);
        }
    }

    /// Defaults mutated by the given call options.
    pub fn with_options(opts: &[CallOption]) -> Self {
        let mut merged = Self::default();
        merged.apply(opts);
        merged
    }

    pub fn wire_temperature(&self) -> Option<f32> {
        (self.temperature != DEFAULT_TEMPERATURE).then_some(self.temperature)
    }

    pub fn wire_top_p(&self) -> Option<f32> {
        (self.top_p != DEFAULT_TOP_P).then_some(self.top_p)
    }

    pub fn wire_max_tokens(&self) -> Option<u32> {
        (self.max_tokens != DEFAULT_MAX_TOKENS).then_some(self.max_tokens)
    }

    pub fn wire_stop_sequences(&self) -> Option<Vec<String>> {
        (!self.stop_sequences.is_empty()).then(|| self.stop_sequences.clone())
    }

    pub fn wire_frequency_penalty(&self) -> Option<f32> {
        (self.frequency_penalty != 0.0).then_some(self.frequency_penalty)
    }

    pub fn wire_presence_penalty(&self) -> Option<f32> {
        (self.presence_penalty != 0.0).then_some(self.presence_penalty)
    }
}

/// A Gemini safety filter setting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

/// OpenAI-specific knobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenAiOptions {
    pub organization: Option<String>,
    pub logit_bias: Option<HashMap<String, f64>>,
}

/// Anthropic-specific knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnthropicOptions {
    pub top_k: Option<u32>,
}

/// Gemini-specific knobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeminiOptions {
    pub top_k: Option<u32>,
    pub safety_settings: Option<Vec<SafetySetting>>,
}

/// One per-call option mutation.
///
/// Backend-specific variants expose one `apply_*` facet per backend kind;
/// a backend folds only the facet it understands and silently ignores the
/// rest, so a generic option list can be handed to any backend.
#[derive(Debug, Clone)]
pub enum CallOption {
    Temperature(f32),
    MaxTokens(u32),
    TopP(f32),
    StopSequences(Vec<String>),
    FrequencyPenalty(f32),
    PresencePenalty(f32),
    /// Per-call deadline; consumed by the dispatcher's timeout policy.
    Timeout(Duration),
    /// Recognized by Gemini and Anthropic.
    TopK(u32),
    /// Recognized by Gemini.
    SafetySettings(Vec<SafetySetting>),
    /// Recognized by OpenAI.
    Organization(String),
    /// Recognized by OpenAI.
    LogitBias(HashMap<String, f64>),
}

impl CallOption {
    pub fn apply_common(&self, opts: &mut ProviderOptions) {
        match self {
            CallOption::Temperature(v) => opts.temperature = *v,
            CallOption::MaxTokens(v) => opts.max_tokens = *v,
            CallOption::TopP(v) => opts.top_p = *v,
            CallOption::StopSequences(v) => opts.stop_sequences = v.clone(),
            CallOption::FrequencyPenalty(v) => opts.frequency_penalty = *v,
            CallOption::PresencePenalty(v) => opts.presence_penalty = *v,
            _ => {}
        }
    }

    pub fn apply_openai(&self, extra: &mut OpenAiOptions) {
        match self {
            CallOption::Organization(v) => extra.organization = Some(v.clone()),
            CallOption::LogitBias(v) => extra.logit_bias = Some(v.clone()),
            _ => {}
        }
    }

    pub fn apply_anthropic(&self, extra: &mut AnthropicOptions) {
        if let CallOption::TopK(v) = self {
            extra.top_k = Some(*v);
        }
    }

    pub fn apply_gemini(&self, extra: &mut GeminiOptions) {
        match self {
            CallOption::TopK(v) => extra.top_k = Some(*v),
            CallOption::SafetySettings(v) => extra.safety_settings = Some(v.clone()),
            _ => {}
        }
    }
}

/// The explicit per-call deadline, if any; last one wins.
pub fn resolve_timeout(opts: &[CallOption]) -> Option<Duration> {
    opts.iter().rev().find_map(|o| match o {
        CallOption::Timeout(d) => Some(*d),
        _ => None,
    })
}

/// Transport configuration shared by the HTTP adapters.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Request timeout applied at the HTTP client level.
    pub timeout: Option<Duration>,

    /// HTTP proxy URL.
    pub proxy: Option<String>,

    /// Additional HTTP headers to include in requests.
    pub extra_headers: Option<HashMap<String, String>>,
}

impl TransportOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.extra_headers
            .get_or_insert_with(HashMap::new)
            .insert(key, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_omitted_from_wire() {
        let opts = ProviderOptions::default();
        assert_eq!(opts.wire_temperature(), None);
        assert_eq!(opts.wire_top_p(), None);
        assert_eq!(opts.wire_max_tokens(), None);
        assert_eq!(opts.wire_stop_sequences(), None);
        assert_eq!(opts.wire_frequency_penalty(), None);
        assert_eq!(opts.wire_presence_penalty(), None);
    }

    #[test]
    fn non_defaults_reach_the_wire() {
        let opts = ProviderOptions::with_options(&[
            CallOption::Temperature(0.2),
            CallOption::MaxTokens(64),
            CallOption::StopSequences(vec!["END".into()]),
        ]);
        assert_eq!(opts.wire_temperature(), Some(0.2));
        assert_eq!(opts.wire_max_tokens(), Some(64));
        assert_eq!(opts.wire_stop_sequences(), Some(vec!["END".to_string()]));
        assert_eq!(opts.wire_top_p(), None);
    }

    #[test]
    fn last_mutation_wins() {
        let opts = ProviderOptions::with_options(&[
            CallOption::Temperature(0.1),
            CallOption::Temperature(0.9),
        ]);
        assert_eq!(opts.temperature, 0.9);
    }

    #[test]
    fn backend_facets_ignore_foreign_options() {
        let all = [
            CallOption::TopK(40),
            CallOption::Organization("org-1".into()),
            CallOption::SafetySettings(vec![SafetySetting {
                category: "HARM_CATEGORY_HARASSMENT".into(),
                threshold: "BLOCK_ONLY_HIGH".into(),
            }]),
        ];

        let mut openai = OpenAiOptions::default();
        let mut anthropic = AnthropicOptions::default();
        let mut gemini = GeminiOptions::default();
        for opt in &all {
            opt.apply_openai(&mut openai);
            opt.apply_anthropic(&mut anthropic);
            opt.apply_gemini(&mut gemini);
        }

        assert_eq!(openai.organization.as_deref(), Some("org-1"));
        assert_eq!(openai.logit_bias, None);
        assert_eq!(anthropic.top_k, Some(40));
        assert_eq!(gemini.top_k, Some(40));
        assert!(gemini.safety_settings.is_some());
    }

    #[test]
    fn timeout_resolution_takes_last() {
        let opts = [
            CallOption::Timeout(Duration::from_secs(5)),
            CallOption::Temperature(0.3),
            CallOption::Timeout(Duration::from_secs(9)),
        ];
        assert_eq!(resolve_timeout(&opts), Some(Duration::from_secs(9)));
        assert_eq!(resolve_timeout(&[CallOption::TopK(1)]), None);
    }
}
