//! Multi-backend dispatch: the same five-operation surface as a single
//! backend, distributed over a weighted list of concrete backends under a
//! selection strategy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{Backend, TokenStream};
use crate::consensus::{self, ConsensusConfig, Vote};
use crate::error::{AggregateError, Error, Result};
use crate::model::{Message, Response, Token};
use crate::options::{resolve_timeout, CallOption};
use crate::pool::channel_pool;
use crate::schema::canonical_json;

/// Applied when the caller passes no explicit deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Applied when the caller's deadline is already spent, so the call still
/// runs once and surfaces a deadline error instead of being silently
/// skipped.
const MINIMAL_TIMEOUT: Duration = Duration::from_millis(1);

/// Text of the synthetic finished token emitted when no streaming source
/// could be established.
pub const ALL_PROVIDERS_FAILED: &str = "[ERROR: All providers failed]";

/// How the dispatcher selects among its backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// All backends in parallel; the first success wins.
    #[default]
    Fastest,
    /// Strictly sequential from the primary index; secondaries run only
    /// after the backends before them errored.
    Primary,
    /// All backends in parallel; a consensus sub-strategy picks the winner
    /// among the successes.
    Consensus,
}

struct BackendEntry {
    backend: Arc<dyn Backend>,
    weight: f64,
    name: String,
}

/// What running one backend for one call produced.
struct Outcome<T> {
    name: String,
    weight: f64,
    elapsed: Duration,
    result: Result<T>,
}

/// One `Backend` surface over many concrete backends.
pub struct Dispatcher {
    backends: Vec<BackendEntry>,
    strategy: Strategy,
    default_timeout: Duration,
    primary: usize,
    consensus: ConsensusConfig,
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backends", &self.backends)
            .field("strategy", &self.strategy)
            .field("default_timeout", &self.default_timeout)
            .field("primary", &self.primary)
            .field("consensus", &self.consensus)
            .finish()
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|e| e.name.as_str()).collect()
    }

    fn ensure_backends(&self) -> Result<()> {
        if self.backends.is_empty() {
            Err(Error::NoBackends)
        } else {
            Ok(())
        }
    }

    /// Explicit deadline if the caller set one, otherwise the dispatcher
    /// default. A zero deadline still runs with a minimal timeout.
    fn effective_timeout(&self, opts: &[CallOption]) -> Duration {
        match resolve_timeout(opts) {
            Some(explicit) if explicit.is_zero() => MINIMAL_TIMEOUT,
            Some(explicit) => explicit,
            None => self.default_timeout,
        }
    }

    /// List order starting at the primary index, wrapping around.
    fn primary_order(&self) -> Vec<usize> {
        (self.primary..self.backends.len())
            .chain(0..self.primary)
            .collect()
    }

    /// One worker per backend, each reporting into a channel bounded by the
    /// backend count. Workers observe the shared deadline through their own
    /// timeout of the same duration.
    fn spawn_workers<T, F>(&self, timeout: Duration, call: &F) -> mpsc::Receiver<Outcome<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Backend>) -> BoxFuture<'static, Result<T>>,
    {
        let (tx, rx) = mpsc::channel(self.backends.len());
        for entry in &self.backends {
            let fut = call(entry.backend.clone());
            let name = entry.name.clone();
            let weight = entry.weight;
            let tx = tx.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::DeadlineExceeded),
                };
                let outcome = Outcome {
                    name,
                    weight,
                    elapsed: started.elapsed(),
                    result,
                };
                let _ = tx.send(outcome).await;
            });
        }
        rx
    }

    async fn run_fastest<T, F>(&self, timeout: Duration, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Backend>) -> BoxFuture<'static, Result<T>>,
    {
        let mut rx = self.spawn_workers(timeout, &call);

        let mut failures = Vec::new();
        let mut winner = None;
        while winner.is_none() {
            match rx.recv().await {
                Some(outcome) => match outcome.result {
                    Ok(value) => {
                        debug!(backend = %outcome.name, elapsed = ?outcome.elapsed, "first success wins");
                        winner = Some(value);
                    }
                    Err(err) => {
                        debug!(backend = %outcome.name, error = %err, "backend failed");
                        failures.push((outcome.name, err));
                    }
                },
                None => break,
            }
        }

        match winner {
            Some(value) => {
                // Stragglers keep running under the shared deadline; their
                // outcomes are still collected, for reporting only.
                tokio::spawn(async move {
                    while let Some(outcome) = rx.recv().await {
                        debug!(
                            backend = %outcome.name,
                            success = outcome.result.is_ok(),
                            elapsed = ?outcome.elapsed,
                            "straggler outcome discarded"
                        );
                    }
                });
                Ok(value)
            }
            None => Err(AggregateError::new(failures).into()),
        }
    }

    async fn run_sequential<T, F>(&self, timeout: Duration, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn Backend>) -> BoxFuture<'static, Result<T>>,
    {
        let run = async {
            let mut failures = Vec::new();
            for idx in self.primary_order() {
                let entry = &self.backends[idx];
                let started = Instant::now();
                match call(entry.backend.clone()).await {
                    Ok(value) => {
                        debug!(backend = %entry.name, elapsed = ?started.elapsed(), "sequential call succeeded");
                        return Ok(value);
                    }
                    Err(err) => {
                        warn!(backend = %entry.name, error = %err, "sequential call failed, falling back");
                        failures.push((entry.name.clone(), err));
                    }
                }
            }
            Err(Error::AllFailed(AggregateError::new(failures)))
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    async fn run_consensus<T, F>(
        &self,
        timeout: Duration,
        call: F,
        to_content: impl Fn(&T) -> String,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Backend>) -> BoxFuture<'static, Result<T>>,
    {
        let mut rx = self.spawn_workers(timeout, &call);

        let mut successes: Vec<(T, Vote)> = Vec::new();
        let mut failures = Vec::new();
        while let Some(outcome) = rx.recv().await {
            match outcome.result {
                Ok(value) => {
                    let vote = Vote::new(to_content(&value), outcome.weight, outcome.elapsed);
                    successes.push((value, vote));
                }
                Err(err) => {
                    debug!(backend = %outcome.name, error = %err, "backend failed");
                    failures.push((outcome.name, err));
                }
            }
        }

        if successes.is_empty() {
            return Err(AggregateError::new(failures).into());
        }

        let votes: Vec<Vote> = successes.iter().map(|(_, vote)| vote.clone()).collect();
        let winner = consensus::select(&votes, &self.consensus)?;

        // Map the winning content back to its original value; first success
        // as the fallback when the mapping fails.
        let idx = successes
            .iter()
            .position(|(_, vote)| vote.content == winner)
            .unwrap_or(0);
        Ok(successes.swap_remove(idx).0)
    }
}

fn message_call(
    messages: &[Message],
    opts: &[CallOption],
) -> impl Fn(Arc<dyn Backend>) -> BoxFuture<'static, Result<Response>> {
    let messages: Arc<[Message]> = messages.into();
    let opts: Arc<[CallOption]> = opts.into();
    move |backend| {
        let messages = messages.clone();
        let opts = opts.clone();
        Box::pin(async move { backend.generate_message(&messages, &opts).await })
    }
}

fn schema_call(
    prompt: &str,
    schema: &Value,
    opts: &[CallOption],
) -> impl Fn(Arc<dyn Backend>) -> BoxFuture<'static, Result<Value>> {
    let prompt: Arc<str> = prompt.into();
    let schema = Arc::new(schema.clone());
    let opts: Arc<[CallOption]> = opts.into();
    move |backend| {
        let prompt = prompt.clone();
        let schema = schema.clone();
        let opts = opts.clone();
        Box::pin(async move { backend.generate_with_schema(&prompt, &schema, &opts).await })
    }
}

#[async_trait]
impl Backend for Dispatcher {
    fn name(&self) -> &str {
        "ensemble"
    }

    async fn generate_message(
        &self,
        messages: &[Message],
        opts: &[CallOption],
    ) -> Result<Response> {
        self.ensure_backends()?;
        let timeout = self.effective_timeout(opts);
        let call = message_call(messages, opts);
        match self.strategy {
            Strategy::Primary => self.run_sequential(timeout, call).await,
            Strategy::Fastest => self.run_fastest(timeout, call).await,
            Strategy::Consensus => {
                self.run_consensus(timeout, call, |response: &Response| {
                    response.content.clone()
                })
                .await
            }
        }
    }

    async fn generate_with_schema(
        &self,
        prompt: &str,
        schema: &Value,
        opts: &[CallOption],
    ) -> Result<Value> {
        self.ensure_backends()?;
        let timeout = self.effective_timeout(opts);
        let call = schema_call(prompt, schema, opts);
        match self.strategy {
            Strategy::Primary => self.run_sequential(timeout, call).await,
            Strategy::Fastest => self.run_fastest(timeout, call).await,
            // Consensus over structured values runs on their canonical JSON
            // strings, then maps the winner back.
            Strategy::Consensus => self.run_consensus(timeout, call, canonical_json).await,
        }
    }

    /// Streaming is not fanned out: one source backend is chosen up front
    /// and its tokens are forwarded verbatim. Remaining backends are tried
    /// in list order only when establishment fails.
    async fn stream_message(
        &self,
        messages: &[Message],
        opts: &[CallOption],
    ) -> Result<TokenStream> {
        self.ensure_backends()?;
        let timeout = self.effective_timeout(opts);

        let order = match self.strategy {
            Strategy::Primary => self.primary_order(),
            _ => (0..self.backends.len()).collect(),
        };

        let mut upstream: Option<TokenStream> = None;
        for idx in order {
            let entry = &self.backends[idx];
            match tokio::time::timeout(timeout, entry.backend.stream_message(messages, opts)).await
            {
                Ok(Ok(stream)) => {
                    debug!(backend = %entry.name, "stream source established");
                    upstream = Some(stream);
                    break;
                }
                Ok(Err(err)) => {
                    warn!(backend = %entry.name, error = %err, "stream source failed, trying next");
                }
                Err(_) => {
                    warn!(backend = %entry.name, "stream establishment timed out, trying next");
                }
            }
        }

        // The channel comes from the shared pool but is never returned:
        // termination closes it, which makes it unreusable.
        let channel = channel_pool().get();
        let (tx, mut rx) = (channel.tx, channel.rx);

        match upstream {
            Some(mut stream) => {
                tokio::spawn(async move {
                    while let Some(token) = stream.next().await {
                        let finished = token.finished;
                        if tx.send(token).await.is_err() {
                            // Consumer cancelled; stop reading upstream.
                            break;
                        }
                        if finished {
                            break;
                        }
                    }
                });
            }
            None => {
                let _ = tx.try_send(Token::finished(ALL_PROVIDERS_FAILED));
            }
        }

        Ok(Box::pin(async_stream::stream! {
            while let Some(token) = rx.recv().await {
                let finished = token.finished;
                yield token;
                if finished {
                    return;
                }
            }
        }))
    }
}

/// Builds a [`Dispatcher`].
pub struct DispatcherBuilder {
    entries: Vec<BackendEntry>,
    strategy: Strategy,
    default_timeout: Duration,
    primary: usize,
    consensus: ConsensusConfig,
}

impl DispatcherBuilder {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            strategy: Strategy::default(),
            default_timeout: DEFAULT_TIMEOUT,
            primary: 0,
            consensus: ConsensusConfig::default(),
        }
    }

    /// Register a backend with the default weight of 1.0.
    pub fn backend(self, backend: Arc<dyn Backend>) -> Self {
        self.weighted_backend(backend, 1.0)
    }

    /// Register a backend with a weight in `[0, 1]`. A zero or negative
    /// weight counts as unset and becomes 1.0.
    pub fn weighted_backend(mut self, backend: Arc<dyn Backend>, weight: f64) -> Self {
        let weight = if weight <= 0.0 { 1.0 } else { weight.min(1.0) };
        let name = backend.name().to_string();
        self.entries.push(BackendEntry {
            backend,
            weight,
            name,
        });
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Index of the backend the Primary strategy starts from.
    pub fn primary(mut self, index: usize) -> Self {
        self.primary = index;
        self
    }

    pub fn consensus(mut self, config: ConsensusConfig) -> Self {
        self.consensus = config;
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        if !self.entries.is_empty() && self.primary >= self.entries.len() {
            return Err(Error::Config(format!(
                "primary index {} out of range for {} backends",
                self.primary,
                self.entries.len()
            )));
        }
        Ok(Dispatcher {
            backends: self.entries,
            strategy: self.strategy,
            default_timeout: self.default_timeout,
            primary: self.primary,
            consensus: self.consensus,
        })
    }
}
