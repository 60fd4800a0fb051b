//! Token-set text similarity with a bounded pair cache, plus the group
//! cache used by similarity-based consensus.

use std::collections::{HashMap, HashSet};
use std::sync::{LazyLock, RwLock};

use rand::seq::IteratorRandom;

use crate::hash::digest_str;

/// Score for pairs rejected by the length-ratio filter.
const LENGTH_RATIO_SCORE: f64 = 0.3;
/// Score when either side has no tokens left after stopword filtering.
const NO_TOKENS_SCORE: f64 = 0.2;
/// Upper bound on memoized pair scores; a random entry is evicted beyond it.
const PAIR_CACHE_MAX: usize = 128;

static PAIR_CACHE: LazyLock<RwLock<HashMap<(u64, u64), f64>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Similarity of two strings in `[0, 1]`.
///
/// Equal strings (including case-insensitive equality) score 1.0. When the
/// shorter string is under half the length of the longer, the pair scores a
/// flat low constant without tokenizing. Otherwise the score is the Jaccard
/// coefficient over lowercased whitespace tokens longer than two characters.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b || a.eq_ignore_ascii_case(b) {
        return 1.0;
    }

    let key = pair_key(a, b);
    if let Some(score) = PAIR_CACHE.read().expect("poisoned lock").get(&key) {
        return *score;
    }

    let score = compute(a, b);

    let mut cache = PAIR_CACHE.write().expect("poisoned lock");
    if cache.len() >= PAIR_CACHE_MAX {
        if let Some(victim) = cache.keys().copied().choose(&mut rand::rng()) {
            cache.remove(&victim);
        }
    }
    cache.insert(key, score);
    score
}

/// Order-independent cache key.
fn pair_key(a: &str, b: &str) -> (u64, u64) {
    let (x, y) = (digest_str(a), digest_str(b));
    if x <= y {
        (x, y)
    } else {
        (y, x)
    }
}

fn compute(a: &str, b: &str) -> f64 {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if short.len() * 2 < long.len() {
        return LENGTH_RATIO_SCORE;
    }

    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return NO_TOKENS_SCORE;
    }

    let intersection = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - intersection;
    intersection as f64 / union as f64
}

fn tokens(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .filter(|t| t.chars().count() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

struct GroupState {
    threshold: f64,
    representatives: Vec<String>,
    by_digest: HashMap<u64, usize>,
}

/// Greedy similarity groups keyed by content digest.
///
/// A content string joins the first existing group whose representative it
/// matches at or above the active threshold, otherwise it founds a new group
/// and becomes its representative. Changing the threshold wipes the whole
/// cache; incremental invalidation is not attempted.
pub struct GroupCache {
    state: RwLock<GroupState>,
}

impl GroupCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GroupState {
                threshold: f64::NAN,
                representatives: Vec::new(),
                by_digest: HashMap::new(),
            }),
        }
    }

    /// Group index for `content` under `threshold`.
    pub fn group_for(&self, content: &str, threshold: f64) -> usize {
        let digest = digest_str(content);

        {
            let state = self.state.read().expect("poisoned lock");
            if state.threshold == threshold {
                if let Some(&idx) = state.by_digest.get(&digest) {
                    return idx;
                }
            }
        }

        let mut state = self.state.write().expect("poisoned lock");
        if state.threshold != threshold {
            state.representatives.clear();
            state.by_digest.clear();
            state.threshold = threshold;
        }
        if let Some(&idx) = state.by_digest.get(&digest) {
            return idx;
        }

        let found = state
            .representatives
            .iter()
            .position(|rep| similarity(content, rep) >= threshold);
        let idx = match found {
            Some(idx) => idx,
            None => {
                state.representatives.push(content.to_string());
                state.representatives.len() - 1
            }
        };
        state.by_digest.insert(digest, idx);
        idx
    }

    pub fn group_count(&self) -> usize {
        self.state
            .read()
            .expect("poisoned lock")
            .representatives
            .len()
    }
}

impl Default for GroupCache {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED_GROUPS: LazyLock<GroupCache> = LazyLock::new(GroupCache::new);

/// The process-wide group cache used by the consensus selector.
pub fn shared_group_cache() -> &'static GroupCache {
    &SHARED_GROUPS
}
