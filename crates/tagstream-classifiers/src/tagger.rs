//! Compiled tag models
//!
//! Clue probabilities follow Robinson's method: for each token the biased
//! ratio of its positive and negative pool frequencies is smoothed towards
//! 0.5 by how often the token was seen. Items are scored by combining their
//! strongest clues with Fisher's inverse chi-square.

use crate::definition::TagDefinition;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tagstream_core::{Error, Item, ItemId, Result, TokenId, TokenPool};
use tagstream_store::ItemCache;
use tracing::{debug, info};

/// Weight of the 0.5 prior when smoothing clue probabilities
const PRIOR_STRENGTH: f64 = 1.0;
const PRIOR_PROBABILITY: f64 = 0.5;

/// Clues closer to 0.5 than this carry too little signal to keep
const MIN_CLUE_STRENGTH: f64 = 0.1;

/// Number of strongest clues combined when scoring one item
pub const MAX_CLUES: usize = 150;

/// A token's contribution to classification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clue {
    pub token_id: TokenId,
    pub probability: f64,
}

impl Clue {
    pub fn strength(&self) -> f64 {
        (self.probability - PRIOR_PROBABILITY).abs()
    }
}

/// Immutable model for one tag
#[derive(Debug, Clone)]
pub struct Tagger {
    definition: TagDefinition,
    clues: HashMap<TokenId, f64>,
    resolved_examples: Vec<ItemId>,
    missing_examples: usize,
    built_at: DateTime<Utc>,
}

impl Tagger {
    /// Build a tagger by resolving the definition's examples in the item cache.
    ///
    /// Examples missing from the cache are skipped. When the tag has no
    /// negative examples the cache's random background stands in for them.
    pub fn build(definition: TagDefinition, items: &ItemCache) -> Result<Self> {
        let mut missing = 0;
        let mut resolved = Vec::new();
        let mut resolve = |ids: &[ItemId]| -> Vec<Arc<Item>> {
            ids.iter()
                .filter_map(|id| {
                    let item = items.fetch_item(*id);
                    match item {
                        Some(_) => resolved.push(*id),
                        None => missing += 1,
                    }
                    item
                })
                .collect()
        };
        let positives = resolve(&definition.positive_examples);
        let negatives = resolve(&definition.negative_examples);

        if positives.is_empty() {
            return Err(Error::validation(format!(
                "tag {} has no positive examples in the item cache",
                definition.tag_id
            )));
        }

        let positive_pool: TokenPool = positives.iter().map(Arc::as_ref).collect();
        let negative_pool: Arc<TokenPool> = if negatives.is_empty() {
            items.random_background().unwrap_or_default()
        } else {
            Arc::new(negatives.iter().map(Arc::as_ref).collect())
        };

        let mut tagger = Self::from_pools(definition, &positive_pool, &negative_pool);
        tagger.resolved_examples = resolved;
        tagger.missing_examples = missing;
        info!(
            tag_id = %tagger.definition.tag_id,
            positives = positives.len(),
            negatives = negatives.len(),
            missing,
            clues = tagger.clues.len(),
            "Tagger built"
        );
        Ok(tagger)
    }

    /// Build a tagger directly from positive and negative token pools
    pub fn from_pools(definition: TagDefinition, positive: &TokenPool, negative: &TokenPool) -> Self {
        let bias = definition.bias;
        let pos_total = positive.total_tokens() as f64;
        let neg_total = negative.total_tokens() as f64;

        let ids: BTreeSet<TokenId> = positive
            .tokens()
            .chain(negative.tokens())
            .map(|t| t.id)
            .collect();

        let mut clues = HashMap::new();
        for id in ids {
            let pos_count = positive.token_frequency(id) as f64;
            let neg_count = negative.token_frequency(id) as f64;
            let pf = if pos_total > 0.0 { pos_count / pos_total } else { 0.0 };
            let nf = if neg_total > 0.0 { neg_count / neg_total } else { 0.0 };

            let denominator = bias * pf + nf;
            if denominator <= 0.0 {
                continue;
            }
            let p = bias * pf / denominator;
            let n = pos_count + neg_count;
            let probability = (PRIOR_STRENGTH * PRIOR_PROBABILITY + n * p) / (PRIOR_STRENGTH + n);

            if (probability - PRIOR_PROBABILITY).abs() >= MIN_CLUE_STRENGTH {
                clues.insert(id, probability);
            }
        }

        Self {
            definition,
            clues,
            resolved_examples: Vec::new(),
            missing_examples: 0,
            built_at: Utc::now(),
        }
    }

    /// Probability in [0, 1] that `item` belongs to the tag
    pub fn classify(&self, item: &Item) -> f64 {
        let clues = self.clues_for(item);
        if clues.is_empty() {
            return PRIOR_PROBABILITY;
        }

        let n = clues.len();
        let (sum_ln_p, sum_ln_not_p) = clues.iter().fold((0.0, 0.0), |(a, b), clue| {
            (a + clue.probability.ln(), b + (1.0 - clue.probability).ln())
        });
        let h = chi2q(-2.0 * sum_ln_p, 2 * n);
        let s = chi2q(-2.0 * sum_ln_not_p, 2 * n);
        let score = (1.0 + h - s) / 2.0;
        debug!(item_id = item.id(), clues = n, score, "Item classified");
        score.clamp(0.0, 1.0)
    }

    /// Clues present in `item`, strongest first, at most `MAX_CLUES`
    pub fn clues_for(&self, item: &Item) -> Vec<Clue> {
        let mut clues: Vec<Clue> = item
            .tokens()
            .iter()
            .filter_map(|t| {
                self.clues.get(&t.id).map(|&probability| Clue {
                    token_id: t.id,
                    probability,
                })
            })
            .collect();
        clues.sort_by(|a, b| {
            b.strength()
                .total_cmp(&a.strength())
                .then(a.token_id.cmp(&b.token_id))
        });
        clues.truncate(MAX_CLUES);
        clues
    }

    pub fn clue(&self, token_id: TokenId) -> Option<f64> {
        self.clues.get(&token_id).copied()
    }

    pub fn num_clues(&self) -> usize {
        self.clues.len()
    }

    pub fn definition(&self) -> &TagDefinition {
        &self.definition
    }

    pub fn tag_id(&self) -> &str {
        &self.definition.tag_id
    }

    pub fn term(&self) -> &str {
        &self.definition.term
    }

    pub fn scheme(&self) -> &str {
        &self.definition.scheme
    }

    pub fn bias(&self) -> f64 {
        self.definition.bias
    }

    pub fn training_url(&self) -> Option<&str> {
        self.definition.training_url.as_deref()
    }

    pub fn classifier_taggings_url(&self) -> Option<&str> {
        self.definition.classifier_taggings_url.as_deref()
    }

    pub fn last_classified(&self) -> Option<DateTime<Utc>> {
        self.definition.last_classified
    }

    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.definition.updated
    }

    pub fn positive_examples(&self) -> &[ItemId] {
        &self.definition.positive_examples
    }

    pub fn negative_examples(&self) -> &[ItemId] {
        &self.definition.negative_examples
    }

    /// Training examples that were found in the item cache at build time
    pub fn resolved_examples(&self) -> &[ItemId] {
        &self.resolved_examples
    }

    /// Examples that were not in the item cache at build time
    pub fn missing_examples(&self) -> usize {
        self.missing_examples
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}

/// Upper tail of the chi-square distribution with an even number of degrees
/// of freedom
fn chi2q(x2: f64, degrees: usize) -> f64 {
    let m = x2 / 2.0;
    let mut term = (-m).exp();
    let mut sum = term;
    for i in 1..degrees / 2 {
        term *= m / i as f64;
        sum += term;
    }
    sum.min(1.0)
}
