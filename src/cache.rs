//! Per-adapter cache from a message-sequence digest to that backend's
//! already-converted wire form.
//!
//! Sits on the hot path of every request: a hit skips all conversion work.
//! Growth is unbounded here; callers that care invoke [`ConversionCache::clear`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::hash::digest_messages;
use crate::model::Message;

pub struct ConversionCache<W> {
    entries: RwLock<HashMap<u64, W>>,
    hits: AtomicU64,
    conversions: AtomicU64,
}

impl<W: Clone> ConversionCache<W> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            conversions: AtomicU64::new(0),
        }
    }

    /// Return the cached wire form for `messages`, or run `convert` and
    /// remember its result.
    pub fn get_or_convert<E>(
        &self,
        messages: &[Message],
        convert: impl FnOnce(&[Message]) -> Result<W, E>,
    ) -> Result<W, E> {
        let key = digest_messages(messages);

        if let Some(cached) = self.entries.read().expect("poisoned lock").get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }

        let converted = convert(messages)?;
        self.conversions.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .expect("poisoned lock")
            .insert(key, converted.clone());
        Ok(converted)
    }

    /// Drop every cached conversion.
    pub fn clear(&self) {
        self.entries.write().expect("poisoned lock").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lookups served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of times the conversion closure actually ran.
    pub fn conversions(&self) -> u64 {
        self.conversions.load(Ordering::Relaxed)
    }
}

impl<W: Clone> Default for ConversionCache<W> {
    fn default() -> Self {
        Self::new()
    }
}
