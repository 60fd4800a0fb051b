//! The uniform capability set every concrete backend exposes.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::error::{ErrorKind, ProviderError, Result};
use crate::model::{Message, Response, Token};
use crate::options::CallOption;
use crate::schema::{parse_first_json, schema_prompt};

/// A lazy, finite, single-pass sequence of stream tokens.
///
/// Always terminates with exactly one token whose `finished` flag is set, as
/// its last element. Dropping the stream cancels the producing call.
pub type TokenStream = Pin<Box<dyn Stream<Item = Token> + Send>>;

/// One concrete LLM backend.
///
/// The five operations take zero or more [`CallOption`] mutators; a
/// backend folds the common knobs plus the facet it recognizes and ignores
/// the rest. Deadlines ride in as [`CallOption::Timeout`] and cancellation
/// is dropping the returned future or stream.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable name used in outcomes and error messages.
    fn name(&self) -> &str;

    /// Send the full conversation and return the assistant's reply.
    async fn generate_message(
        &self,
        messages: &[Message],
        opts: &[CallOption],
    ) -> Result<Response>;

    /// Open a token stream for the full conversation. Establishment
    /// failures are the returned `Err`; mid-stream failures terminate the
    /// stream with a final finished token.
    async fn stream_message(
        &self,
        messages: &[Message],
        opts: &[CallOption],
    ) -> Result<TokenStream>;

    /// One-shot text generation: shorthand for a single user turn through
    /// [`generate_message`](Backend::generate_message).
    async fn generate(&self, prompt: &str, opts: &[CallOption]) -> Result<String> {
        let response = self
            .generate_message(&[Message::user(prompt)], opts)
            .await?;
        Ok(response.content)
    }

    /// One-shot streaming: shorthand for a single user turn through
    /// [`stream_message`](Backend::stream_message).
    async fn stream(&self, prompt: &str, opts: &[CallOption]) -> Result<TokenStream> {
        self.stream_message(&[Message::user(prompt)], opts).await
    }

    /// Schema-constrained generation: the prompt is augmented with a
    /// schema preamble and the first JSON value of the reply is parsed out.
    /// The value is not validated against the schema here; that is the
    /// caller's structured processor's concern.
    async fn generate_with_schema(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &[CallOption],
    ) -> Result<Value> {
        let augmented = schema_prompt(prompt, schema);
        let reply = self.generate(&augmented, opts).await?;
        parse_first_json(&reply).map_err(|err| {
            ProviderError::new(
                self.name().to_string(),
                "generate_with_schema",
                ErrorKind::BadResponse,
                format!("reply carried no parsable JSON value: {err}"),
            )
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedBackend {
        reply: String,
    }

    #[async_trait]
    impl Backend for CannedBackend {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate_message(
            &self,
            _messages: &[Message],
            _opts: &[CallOption],
        ) -> Result<Response> {
            Ok(Response::new(self.reply.clone()))
        }

        async fn stream_message(
            &self,
            _messages: &[Message],
            _opts: &[CallOption],
        ) -> Result<TokenStream> {
            let reply = self.reply.clone();
            Ok(Box::pin(futures::stream::iter([
                Token::piece(reply),
                Token::finished(""),
            ])))
        }
    }

    #[tokio::test]
    async fn generate_routes_through_generate_message() {
        let backend = CannedBackend {
            reply: "hi there".into(),
        };
        assert_eq!(backend.generate("hello", &[]).await.unwrap(), "hi there");
    }

    #[tokio::test]
    async fn schema_generation_parses_first_json() {
        let backend = CannedBackend {
            reply: "Sure thing:\n```json\n{\"city\": \"Paris\"}\n```".into(),
        };
        let schema = serde_json::json!({"type": "object"});
        let value = backend
            .generate_with_schema("Where?", &schema, &[])
            .await
            .unwrap();
        assert_eq!(value["city"], "Paris");
    }

    #[tokio::test]
    async fn schema_generation_flags_unparsable_replies() {
        let backend = CannedBackend {
            reply: "I would rather not.".into(),
        };
        let schema = serde_json::json!({"type": "object"});
        let err = backend
            .generate_with_schema("Where?", &schema, &[])
            .await
            .unwrap_err();
        assert!(err.matches(ErrorKind::BadResponse));
    }
}
