//! Consensus selection over the successful outcomes of a fanned-out call.

use std::collections::HashMap;
use std::time::Duration;

use itertools::Itertools;

use crate::error::{AggregateError, Error, Result};
use crate::similarity::{shared_group_cache, similarity, GroupCache};

/// Weight share above which an exact-content bucket wins outright.
const DOMINANT_WEIGHT_SHARE: f64 = 0.70;
/// Fixed threshold for the weighted strategy's similarity pass.
const WEIGHTED_SIMILARITY_THRESHOLD: f64 = 0.65;

const SCORE_EPSILON: f64 = 1e-9;

/// One successful outcome, reduced to what selection needs.
#[derive(Debug, Clone)]
pub struct Vote {
    pub content: String,
    pub weight: f64,
    pub elapsed: Duration,
}

impl Vote {
    pub fn new(content: impl Into<String>, weight: f64, elapsed: Duration) -> Self {
        Self {
            content: content.into(),
            weight,
            elapsed,
        }
    }
}

/// The rule for picking a winner out of several successful outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsensusStrategy {
    /// Exact-string multiplicity.
    #[default]
    Majority,
    /// Similarity grouping; the largest group wins.
    Similarity,
    /// Weight aggregation per exact content, with a similarity pass when no
    /// bucket dominates.
    Weighted,
}

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub strategy: ConsensusStrategy,
    /// Grouping threshold for [`ConsensusStrategy::Similarity`].
    pub similarity_threshold: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            strategy: ConsensusStrategy::default(),
            similarity_threshold: 0.7,
        }
    }
}

/// Pick the winning content among `votes`.
///
/// A single vote is returned untouched without any grouping work; an empty
/// slate is the "no successful calls" error.
pub fn select(votes: &[Vote], config: &ConsensusConfig) -> Result<String> {
    match votes {
        [] => Err(Error::AllFailed(AggregateError::new(Vec::new()))),
        [only] => Ok(only.content.clone()),
        _ => Ok(match config.strategy {
            ConsensusStrategy::Majority => majority(votes),
            ConsensusStrategy::Similarity => {
                by_similarity(shared_group_cache(), votes, config.similarity_threshold)
            }
            ConsensusStrategy::Weighted => weighted(votes),
        }),
    }
}

/// Most frequent exact content; ties go to the earliest vote.
fn majority(votes: &[Vote]) -> String {
    let counts = votes.iter().map(|v| v.content.as_str()).counts();

    let mut best: Option<(&str, usize)> = None;
    for vote in votes {
        let count = counts[vote.content.as_str()];
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((&vote.content, count));
        }
    }
    best.map(|(content, _)| content.to_string()).unwrap_or_default()
}

/// Assign each vote to a similarity group and return the best member of the
/// largest group, where best means shortest non-empty content. Grouping
/// stops early once one group holds more than half the votes.
fn by_similarity(cache: &GroupCache, votes: &[Vote], threshold: f64) -> String {
    let half = votes.len() / 2;
    let mut assigned: Vec<(usize, &Vote)> = Vec::with_capacity(votes.len());
    let mut counts: HashMap<usize, usize> = HashMap::new();
    let mut leader: Option<usize> = None;

    for vote in votes {
        let group = cache.group_for(&vote.content, threshold);
        assigned.push((group, vote));
        let count = counts.entry(group).or_insert(0);
        *count += 1;
        if *count > half {
            leader = Some(group);
            break;
        }
    }

    let winner = leader.unwrap_or_else(|| {
        // Largest group; ties go to the group seen first.
        let mut best: Option<(usize, usize)> = None;
        for (group, _) in &assigned {
            let count = counts[group];
            if best.map_or(true, |(_, best_count)| count > best_count) {
                best = Some((*group, count));
            }
        }
        best.map(|(group, _)| group).unwrap_or(0)
    });

    assigned
        .iter()
        .filter(|(group, vote)| *group == winner && !vote.content.is_empty())
        .min_by_key(|(_, vote)| vote.content.len())
        .or_else(|| assigned.iter().find(|(group, _)| *group == winner))
        .map(|(_, vote)| vote.content.clone())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct Bucket {
    content: String,
    weight: f64,
    count: usize,
    elapsed_total: Duration,
}

impl Bucket {
    fn average_elapsed(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.elapsed_total / self.count as u32
        }
    }
}

/// Aggregate weights per exact content. A bucket holding more than 70% of
/// the total weight wins outright; otherwise every bucket absorbs the
/// weight of its similar peers scaled by their similarity, and ties break
/// on bucket multiplicity, then on faster average elapsed time.
fn weighted(votes: &[Vote]) -> String {
    if votes.iter().all(|v| v.weight == 0.0) {
        return majority(votes);
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut buckets: Vec<Bucket> = Vec::new();
    for vote in votes {
        let idx = *index.entry(&vote.content).or_insert_with(|| {
            buckets.push(Bucket {
                content: vote.content.clone(),
                ..Bucket::default()
            });
            buckets.len() - 1
        });
        buckets[idx].weight += vote.weight;
        buckets[idx].count += 1;
        buckets[idx].elapsed_total += vote.elapsed;
    }

    let total_weight: f64 = votes.iter().map(|v| v.weight).sum();
    if let Some(dominant) = buckets
        .iter()
        .find(|b| b.weight / total_weight > DOMINANT_WEIGHT_SHARE)
    {
        return dominant.content.clone();
    }

    let scores: Vec<f64> = buckets
        .iter()
        .map(|bucket| {
            let mut score = bucket.weight;
            for other in &buckets {
                if std::ptr::eq(bucket, other) {
                    continue;
                }
                let sim = similarity(&bucket.content, &other.content);
                if sim >= WEIGHTED_SIMILARITY_THRESHOLD {
                    score += other.weight * sim;
                }
            }
            score
        })
        .collect();

    let mut winner = 0;
    for idx in 1..buckets.len() {
        let (candidate, best) = (&buckets[idx], &buckets[winner]);
        let diff = scores[idx] - scores[winner];
        let better = if diff > SCORE_EPSILON {
            true
        } else if diff < -SCORE_EPSILON {
            false
        } else if candidate.count != best.count {
            candidate.count > best.count
        } else {
            candidate.average_elapsed() < best.average_elapsed()
        };
        if better {
            winner = idx;
        }
    }
    buckets[winner].content.clone()
}
