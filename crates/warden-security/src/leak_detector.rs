//! Prompt-leak detector.
//!
//! Measures how much of the confidential system policy a model response
//! reproduces: the fraction of the policy's word n-grams that also occur in
//! the response. Words are lowercased alphanumeric runs, so punctuation and
//! formatting changes do not hide a verbatim leak.

use std::collections::HashSet;

/// Lexical-overlap leak detector.
#[derive(Debug, Clone)]
pub struct LeakDetector {
    ngram_size: usize,
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self::new(3)
    }
}

impl LeakDetector {
    /// Detector over word n-grams of the given size (at least 1).
    pub fn new(ngram_size: usize) -> Self {
        Self {
            ngram_size: ngram_size.max(1),
        }
    }

    /// Fraction of policy n-grams present in `response`, in [0, 1].
    ///
    /// A policy shorter than the n-gram size is compared as a single n-gram of
    /// its full length. An empty policy never leaks.
    pub fn overlap_ratio(&self, response: &str, policy: &str) -> f64 {
        let policy_words = extract_words(policy);
        if policy_words.is_empty() {
            return 0.0;
        }
        let n = self.ngram_size.min(policy_words.len());

        let policy_grams = ngrams(&policy_words, n);
        let response_grams = ngrams(&extract_words(response), n);

        let shared = policy_grams.intersection(&response_grams).count();
        shared as f64 / policy_grams.len() as f64
    }
}

fn extract_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn ngrams(words: &[String], n: usize) -> HashSet<String> {
    if words.len() < n {
        return HashSet::new();
    }
    words.windows(n).map(|w| w.join(" ")).collect()
}
