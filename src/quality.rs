//! Heuristic response scoring.
//!
//! `score` is a pure function of the text: a weighted mean of four components,
//! each in [0, 1]. Only used to rank responses against each other, so the
//! absolute values carry no meaning.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

const SENTENCE_MIN_WORDS: usize = 5;
const SENTENCE_MAX_WORDS: usize = 35;
/// Specific-token density that already earns full specificity.
const SPECIFICITY_SATURATION: f64 = 0.2;
const LONG_WORD_LETTERS: usize = 9;

const HEDGE_WORDS: &[&str] = &[
    "maybe", "perhaps", "possibly", "probably", "might", "arguably", "unclear", "presumably",
];

const HEDGE_PHRASES: &[(&str, &str)] = &[
    ("i", "think"),
    ("i", "believe"),
    ("i", "guess"),
    ("it", "seems"),
    ("not", "sure"),
    ("could", "be"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub length: f64,
    pub coherence: f64,
    pub specificity: f64,
    pub confidence: f64,
    pub min_words: usize,
    pub max_words: usize,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            length: 0.25,
            coherence: 0.25,
            specificity: 0.25,
            confidence: 0.25,
            min_words: 40,
            max_words: 1_500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct QualityBreakdown {
    pub length: f64,
    pub coherence: f64,
    pub specificity: f64,
    pub confidence: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct QualityEvaluator {
    weights: QualityWeights,
}

impl QualityEvaluator {
    pub fn new(weights: QualityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    pub fn score(&self, text: &str) -> f64 {
        self.breakdown(text).score
    }

    pub fn breakdown(&self, text: &str) -> QualityBreakdown {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return QualityBreakdown::default();
        }

        let length = length_adequacy(words.len(), self.weights.min_words, self.weights.max_words);
        let coherence = coherence(text);
        let specificity = specificity(&words);
        let confidence = confidence(&words);

        let w = &self.weights;
        let parts = [
            (w.length.max(0.0), length),
            (w.coherence.max(0.0), coherence),
            (w.specificity.max(0.0), specificity),
            (w.confidence.max(0.0), confidence),
        ];
        let total: f64 = parts.iter().map(|(w, _)| w).sum();
        let score = if total > 0.0 {
            (parts.iter().map(|(w, v)| w * v).sum::<f64>() / total).clamp(0.0, 1.0)
        } else {
            0.0
        };

        QualityBreakdown {
            length,
            coherence,
            specificity,
            confidence,
            score,
        }
    }
}

fn length_adequacy(words: usize, min_words: usize, max_words: usize) -> f64 {
    let min_words = min_words.max(1);
    let max_words = max_words.max(min_words);
    if words < min_words {
        words as f64 / min_words as f64
    } else if words > max_words {
        max_words as f64 / words as f64
    } else {
        1.0
    }
}

/// Split on `.`, `!` or `?` followed by whitespace (or end), and on newlines.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        let terminal = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };
        if terminal {
            let end = idx + c.len_utf8();
            let piece = text[start..end].trim();
            if !piece.is_empty() {
                out.push(piece);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn coherence(text: &str) -> f64 {
    let sentences = sentences(text);
    if sentences.is_empty() {
        return 0.0;
    }

    let length_score: f64 = sentences
        .iter()
        .map(|s| {
            let n = s.split_whitespace().count();
            if n < SENTENCE_MIN_WORDS {
                n as f64 / SENTENCE_MIN_WORDS as f64
            } else if n > SENTENCE_MAX_WORDS {
                SENTENCE_MAX_WORDS as f64 / n as f64
            } else {
                1.0
            }
        })
        .sum::<f64>()
        / sentences.len() as f64;

    let distinct: HashSet<String> = sentences
        .iter()
        .map(|s| {
            s.split_whitespace()
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    let non_repetition = distinct.len() as f64 / sentences.len() as f64;

    (length_score + non_repetition) / 2.0
}

fn strip_punct(word: &str) -> &str {
    word.trim_matches(|c: char| matches!(c, ',' | ';' | '!' | '?' | '"' | '\'' | '`'))
        .trim_end_matches(['.', ':'])
}

fn is_specific(word: &str) -> bool {
    let core = strip_punct(word);
    if core.is_empty() {
        return false;
    }
    if core.chars().any(|c| c.is_ascii_digit()) {
        return true;
    }
    if core.contains("::") || core.contains("()") || core.contains('_') || core.contains('/') {
        return true;
    }
    let trimmed = core.trim_matches('.');
    if trimmed.len() > 2 && trimmed.contains('.') {
        return true;
    }
    core.chars().filter(|c| c.is_alphabetic()).count() >= LONG_WORD_LETTERS
}

fn specificity(words: &[&str]) -> f64 {
    let specific = words.iter().filter(|w| is_specific(w)).count();
    let density = specific as f64 / words.len() as f64;
    (density / SPECIFICITY_SATURATION).min(1.0)
}

fn confidence(words: &[&str]) -> f64 {
    let normalized: Vec<String> = words
        .iter()
        .map(|w| strip_punct(w).to_lowercase())
        .collect();

    let mut hedges = normalized
        .iter()
        .filter(|w| HEDGE_WORDS.contains(&w.as_str()))
        .count();
    hedges += normalized
        .windows(2)
        .filter(|pair| {
            HEDGE_PHRASES
                .iter()
                .any(|(a, b)| pair[0] == *a && pair[1] == *b)
        })
        .count();

    let per_100 = hedges as f64 * 100.0 / words.len() as f64;
    1.0 / (1.0 + per_100 / 2.0)
}
