//! Inverted index with Okapi BM25 scoring.
//!
//! State per engine: term → postings, term → document frequency, per-doc
//! token counts, and the running token total for average-length
//! normalization. Ids are the caller's 64-bit vector ids.

use crate::config;
use crate::error::{Error, Result};
use crate::types::VectorId;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use super::tokenizer::tokenize;

/// Tokenizer and scoring parameters.
#[derive(Debug, Clone)]
pub struct Bm25Config {
    /// Term frequency saturation. Standard 1.2.
    pub k1: f32,
    /// Document length normalization. Standard 0.75.
    pub b: f32,
    /// Tokens shorter than this are dropped.
    pub min_term_length: usize,
    /// Lowercase tokens before indexing.
    pub lowercase: bool,
    /// Apply the light suffix stemmer.
    pub stemming: bool,
    /// Remove stop words.
    pub strip_stop_words: bool,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            k1: config::BM25_K1,
            b: config::BM25_B,
            min_term_length: config::BM25_MIN_TERM_LENGTH,
            lowercase: true,
            stemming: true,
            strip_stop_words: true,
        }
    }
}

/// One entry in a term's postings list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub id: VectorId,
    pub term_frequency: u32,
}

/// BM25 scoring engine over an inverted index.
#[derive(Debug)]
pub struct Bm25Engine {
    config: Bm25Config,
    postings: HashMap<String, Vec<Posting>>,
    doc_frequency: HashMap<String, u32>,
    doc_lengths: BTreeMap<VectorId, u32>,
    total_terms: u64,
}

impl Bm25Engine {
    /// Create an empty engine.
    pub fn new(config: Bm25Config) -> Self {
        Self {
            config,
            postings: HashMap::new(),
            doc_frequency: HashMap::new(),
            doc_lengths: BTreeMap::new(),
            total_terms: 0,
        }
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    /// `true` when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    /// Number of distinct terms.
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// `true` if the id has been indexed.
    pub fn contains(&self, id: VectorId) -> bool {
        self.doc_lengths.contains_key(&id)
    }

    /// Mean document length in tokens.
    pub fn average_doc_length(&self) -> f32 {
        if self.doc_lengths.is_empty() {
            return 0.0;
        }
        self.total_terms as f32 / self.doc_lengths.len() as f32
    }

    /// Index a document's text under the given id.
    ///
    /// Duplicate ids are `AlreadyExists`; content that tokenizes to
    /// nothing is `InvalidArgument`.
    pub fn add(&mut self, id: VectorId, content: &str) -> Result<()> {
        if self.doc_lengths.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("document {id} is already indexed")));
        }
        let tokens = tokenize(content, &self.config);
        if tokens.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "document {id} has no indexable terms"
            )));
        }

        let mut tf: HashMap<&str, u32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.as_str()).or_insert(0) += 1;
        }
        for (term, count) in tf {
            self.postings.entry(term.to_string()).or_default().push(Posting {
                id,
                term_frequency: count,
            });
            *self.doc_frequency.entry(term.to_string()).or_insert(0) += 1;
        }
        self.doc_lengths.insert(id, tokens.len() as u32);
        self.total_terms += tokens.len() as u64;
        Ok(())
    }

    /// Remove a document. Decrements the document frequency of every term
    /// it contributed to and erases it from the affected postings lists.
    /// Returns `false` if the id was never indexed.
    pub fn remove(&mut self, id: VectorId) -> bool {
        let Some(length) = self.doc_lengths.remove(&id) else {
            return false;
        };
        self.total_terms -= length as u64;
        self.postings.retain(|term, list| {
            let before = list.len();
            list.retain(|p| p.id != id);
            if list.len() < before {
                match self.doc_frequency.get_mut(term) {
                    Some(df) if *df > 1 => *df -= 1,
                    _ => {
                        self.doc_frequency.remove(term);
                    }
                }
            }
            !list.is_empty()
        });
        true
    }

    /// Replace a document's content: remove then re-add. The new content
    /// is validated first so a rejected update leaves the old document in
    /// place.
    pub fn update(&mut self, id: VectorId, content: &str) -> Result<()> {
        if !self.contains(id) {
            return Err(Error::NotFound(format!("document {id} is not indexed")));
        }
        if tokenize(content, &self.config).is_empty() {
            return Err(Error::InvalidArgument(format!(
                "document {id} has no indexable terms"
            )));
        }
        self.remove(id);
        self.add(id, content)
    }

    /// Score documents against a query.
    ///
    /// Returns up to `k` `(id, score)` pairs with score ≥ `min_score`,
    /// descending by score, ties ascending by id.
    pub fn search(&self, query: &str, k: usize, min_score: f32) -> Vec<(VectorId, f32)> {
        if k == 0 || self.doc_lengths.is_empty() {
            return Vec::new();
        }
        let terms = tokenize(query, &self.config);
        if terms.is_empty() {
            return Vec::new();
        }

        let n = self.doc_lengths.len() as f32;
        let avgdl = self.average_doc_length();
        let k1 = self.config.k1;
        let b = self.config.b;

        let mut scores: HashMap<VectorId, f32> = HashMap::new();
        for term in &terms {
            let Some(list) = self.postings.get(term.as_str()) else {
                continue;
            };
            let df = self.doc_frequency.get(term.as_str()).copied().unwrap_or(0) as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for posting in list {
                let dl = self.doc_lengths.get(&posting.id).copied().unwrap_or(0) as f32;
                let tf = posting.term_frequency as f32;
                let tf_norm = (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * dl / avgdl));
                *scores.entry(posting.id).or_insert(0.0) += idf * tf_norm;
            }
        }

        // Bounded top-k: evict the lowest score, largest id first.
        let mut heap: std::collections::BinaryHeap<Reverse<(OrderedFloat<f32>, Reverse<VectorId>)>> =
            std::collections::BinaryHeap::with_capacity(k + 1);
        for (id, score) in scores {
            if score < min_score {
                continue;
            }
            heap.push(Reverse((OrderedFloat(score), Reverse(id))));
            if heap.len() > k {
                heap.pop();
            }
        }
        let mut results: Vec<(VectorId, f32)> = heap
            .into_iter()
            .map(|Reverse((score, Reverse(id)))| (id, score.0))
            .collect();
        results.sort_unstable_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results
    }
}

impl Default for Bm25Engine {
    fn default() -> Self {
        Self::new(Bm25Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Bm25Engine {
        let mut engine = Bm25Engine::default();
        engine.add(1, "gold prices rose sharply today").unwrap();
        engine.add(2, "silver prices fell today").unwrap();
        engine.add(3, "gold mining output expanded").unwrap();
        engine.add(4, "weather was mild").unwrap();
        engine
    }

    #[test]
    fn test_add_and_counts() {
        let engine = corpus();
        assert_eq!(engine.len(), 4);
        assert!(engine.contains(1));
        assert!(!engine.contains(9));
        assert!(engine.average_doc_length() > 0.0);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut engine = corpus();
        assert!(matches!(
            engine.add(1, "again"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_empty_content_rejected() {
        let mut engine = Bm25Engine::default();
        assert!(matches!(
            engine.add(1, "..."),
            Err(Error::InvalidArgument(_))
        ));
        // Stop words and short tokens only is just as empty
        assert!(matches!(
            engine.add(1, "the a an"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!engine.contains(1));
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn test_rejected_update_keeps_old_content() {
        let mut engine = Bm25Engine::default();
        engine.add(1, "gold prices").unwrap();
        assert!(matches!(
            engine.update(1, "..."),
            Err(Error::InvalidArgument(_))
        ));
        // The old document survives the failed update
        assert!(engine.contains(1));
        assert_eq!(engine.search("gold", 10, 0.0).len(), 1);
    }

    #[test]
    fn test_search_finds_matches() {
        let engine = corpus();
        let results = engine.search("gold", 10, 0.0);
        let ids: Vec<VectorId> = results.iter().map(|&(id, _)| id).collect();
        assert!(ids.contains(&1));
        assert!(ids.contains(&3));
        assert!(!ids.contains(&2));
    }

    #[test]
    fn test_search_empty_query() {
        let engine = corpus();
        assert!(engine.search("", 10, 0.0).is_empty());
        assert!(engine.search("the", 10, 0.0).is_empty()); // stop word only
    }

    #[test]
    fn test_search_no_match() {
        let engine = corpus();
        assert!(engine.search("xylophone", 10, 0.0).is_empty());
    }

    #[test]
    fn test_higher_tf_ranks_first() {
        let mut engine = Bm25Engine::default();
        engine.add(1, "gold gold gold").unwrap();
        engine.add(2, "gold and copper").unwrap();
        let results = engine.search("gold", 10, 0.0);
        assert_eq!(results[0].0, 1);
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn test_min_score_filters() {
        let engine = corpus();
        let all = engine.search("gold prices", 10, 0.0);
        let top = engine.search("gold prices", 10, all[0].1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, all[0].0);
    }

    #[test]
    fn test_k_truncation() {
        let engine = corpus();
        let results = engine.search("prices today gold", 2, 0.0);
        assert!(results.len() <= 2);
    }

    #[test]
    fn test_tie_breaks_ascending_id() {
        let mut engine = Bm25Engine::default();
        // Identical documents score identically
        engine.add(7, "copper wire").unwrap();
        engine.add(2, "copper wire").unwrap();
        let results = engine.search("copper", 10, 0.0);
        assert_eq!(results[0].0, 2);
        assert_eq!(results[1].0, 7);
        assert!((results[0].1 - results[1].1).abs() < 1e-6);
    }

    #[test]
    fn test_remove_updates_df_and_postings() {
        let mut engine = corpus();
        let df_before = engine.search("gold", 10, 0.0).len();
        assert_eq!(df_before, 2);
        assert!(engine.remove(1));
        assert!(!engine.remove(1));
        let after = engine.search("gold", 10, 0.0);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].0, 3);
        // Terms unique to doc 1 disappear entirely
        assert!(engine.search("sharply", 10, 0.0).is_empty());
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn test_df_monotonicity_reshapes_idf() {
        let mut engine = Bm25Engine::default();
        engine.add(1, "rust language").unwrap();
        engine.add(2, "go language").unwrap();
        let lone = engine.search("rust", 10, 0.0)[0].1;
        // Adding another "rust" document raises df(rust) by exactly one and
        // lowers the idf contribution for an identical document
        engine.add(3, "rust compiler").unwrap();
        let crowded = engine.search("rust", 10, 0.0)[0].1;
        assert!(crowded < lone, "idf should shrink as df grows: {lone} -> {crowded}");
    }

    #[test]
    fn test_update_replaces_content() {
        let mut engine = corpus();
        engine.update(4, "gold reserves grew").unwrap();
        let ids: Vec<VectorId> = engine.search("gold", 10, 0.0).iter().map(|&(id, _)| id).collect();
        assert!(ids.contains(&4));
        assert!(engine.search("weather", 10, 0.0).is_empty());
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let mut engine = Bm25Engine::default();
        assert!(matches!(
            engine.update(5, "text"),
            Err(Error::NotFound(_))
        ));
    }
}
