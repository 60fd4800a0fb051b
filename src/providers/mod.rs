//! Concrete backend implementations.

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicBackend;
pub use gemini::GeminiBackend;
pub use openai::OpenAiBackend;
