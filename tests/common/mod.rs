#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ensemble::error::{Error, ErrorKind, ProviderError};
use ensemble::{Backend, CallOption, Message, Response, Result, Token, TokenStream};

pub enum Behavior {
    Reply(String),
    Fail(ErrorKind),
    Deadline,
}

/// In-process backend with configurable latency and failure mode, plus call
/// counters for asserting dispatch order.
pub struct MockBackend {
    name: String,
    behavior: Behavior,
    delay: Duration,
    endless: bool,
    calls: AtomicUsize,
    stream_calls: AtomicUsize,
    streamed_tokens: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn replying(name: &str, reply: &str) -> Self {
        Self::new(name, Behavior::Reply(reply.to_string()))
    }

    pub fn failing(name: &str, kind: ErrorKind) -> Self {
        Self::new(name, Behavior::Fail(kind))
    }

    pub fn deadline(name: &str) -> Self {
        Self::new(name, Behavior::Deadline)
    }

    fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            delay: Duration::ZERO,
            endless: false,
            calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            streamed_tokens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Stream tokens forever instead of terminating; used to observe
    /// cancellation.
    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn streamed_tokens(&self) -> Arc<AtomicUsize> {
        self.streamed_tokens.clone()
    }

    fn failure(&self, kind: ErrorKind, operation: &'static str) -> Error {
        ProviderError::new(self.name.clone(), operation, kind, "mock failure").into()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_message(
        &self,
        _messages: &[Message],
        _opts: &[CallOption],
    ) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.behavior {
            Behavior::Reply(text) => Ok(Response::new(text.clone())),
            Behavior::Fail(kind) => Err(self.failure(*kind, "generate_message")),
            Behavior::Deadline => Err(Error::DeadlineExceeded),
        }
    }

    async fn stream_message(
        &self,
        _messages: &[Message],
        _opts: &[CallOption],
    ) -> Result<TokenStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let text = match &self.behavior {
            Behavior::Reply(text) => text.clone(),
            Behavior::Fail(kind) => return Err(self.failure(*kind, "stream_message")),
            Behavior::Deadline => return Err(Error::DeadlineExceeded),
        };

        let counter = self.streamed_tokens.clone();
        if self.endless {
            Ok(Box::pin(async_stream::stream! {
                loop {
                    counter.fetch_add(1, Ordering::SeqCst);
                    yield Token::piece("tick ");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }))
        } else {
            let pieces: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
            Ok(Box::pin(async_stream::stream! {
                for piece in pieces {
                    counter.fetch_add(1, Ordering::SeqCst);
                    yield Token::piece(piece);
                }
                yield Token::finished("");
            }))
        }
    }
}
