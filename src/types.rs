//! Core types for tuneloop - the iterative decoder weight-tuning loop.
//!
//! Design decisions:
//! - `WeightVector` is replacement-only: components are never mutated in
//!   place, every iteration produces a fresh vector. This keeps the
//!   per-iteration history trivially correct.
//! - `Hypothesis` is immutable once parsed from decoder output. Duplicate
//!   identity is (sentence index, surface text, feature tuple) with
//!   bit-exact feature comparison: the same surface string with shifted
//!   feature values is a *different* hypothesis, because feature values
//!   legitimately move between decoder runs under different weights.

use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// A flat, ordered vector of real-valued model weights.
///
/// Length is fixed at run start from the decoder's initial configuration
/// and never changes. The vector is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector(Vec<f64>);

impl WeightVector {
    /// Wrap a weight list. An empty list is a configuration error.
    pub fn new(weights: Vec<f64>) -> Result<Self> {
        if weights.is_empty() {
            bail!("weight vector must not be empty");
        }
        Ok(Self(weights))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Return a copy scaled so the maximum absolute component is 1.0.
    ///
    /// A degenerate all-zero vector is returned unchanged rather than
    /// divided by zero.
    pub fn normalized(&self) -> Self {
        let mx = self.0.iter().fold(0.0_f64, |acc, w| acc.max(w.abs()));
        if mx == 0.0 {
            return self.clone();
        }
        Self(self.0.iter().map(|w| w / mx).collect())
    }

    /// Mean absolute component-wise difference from `other`.
    ///
    /// `other` may be shorter (in particular, empty on the first
    /// iteration when there is no previous vector); missing components
    /// are skipped but the divisor stays `self.len()`, so iteration 1
    /// reports a delta of 0.0.
    pub fn mean_abs_diff(&self, other: &[f64]) -> f64 {
        let sum: f64 = self
            .0
            .iter()
            .zip(other.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        sum / self.0.len() as f64
    }

    /// Render as a single space-separated line for the weight history file.
    pub fn to_line(&self) -> String {
        self.0
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parse a space-separated weight line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let weights = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>()
                    .map_err(|e| anyhow::anyhow!("bad weight token {:?}: {}", tok, e))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(weights)
    }
}

impl fmt::Display for WeightVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line())
    }
}

/// One candidate translation for one source sentence.
///
/// `feats` has the same dimensionality as the run's `WeightVector`.
/// `pal` is the optional phrase-alignment annotation emitted by the
/// decoder alongside the hypothesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Source-sentence index (0-based)
    pub sent: usize,
    /// Surface text of the candidate translation
    pub text: String,
    /// Per-feature scores underlying the model score
    pub feats: Vec<f64>,
    /// Phrase-alignment annotation, if the decoder produced one
    pub pal: Option<String>,
}

impl Hypothesis {
    /// Duplicate check: same sentence, same surface text, bit-identical
    /// feature tuple. The alignment annotation does not participate.
    pub fn same_candidate(&self, other: &Hypothesis) -> bool {
        self.sent == other.sent
            && self.text == other.text
            && self.feats.len() == other.feats.len()
            && self
                .feats
                .iter()
                .zip(other.feats.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// One line of the append-only iteration history.
///
/// `prev_optimizer_score` and `prev_aggregate_size` describe the state
/// *going into* this iteration's decode, mirroring the history-file
/// convention: iteration 1 reports 0 for both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Iteration number (0-based)
    pub iter: usize,
    /// Corpus BLEU of this iteration's 1-best decode
    pub decode_score: f64,
    /// Internal score reported by the previous iteration's optimizer
    pub prev_optimizer_score: f64,
    /// Accumulated hypothesis count before this iteration's merge
    pub prev_aggregate_size: usize,
    /// Mean absolute weight change from the previous iteration
    pub avg_weight_delta: f64,
}

/// The best-scoring iteration seen so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestResult {
    /// Iteration index (0-based) of the best decode score
    pub iter: usize,
    /// The best decode score
    pub score: f64,
    /// Weights that produced it
    pub weights: WeightVector,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wv(v: &[f64]) -> WeightVector {
        WeightVector::new(v.to_vec()).unwrap()
    }

    #[test]
    fn test_empty_weights_rejected() {
        assert!(WeightVector::new(vec![]).is_err());
    }

    #[test]
    fn test_normalize_max_abs() {
        let w = wv(&[2.0, -4.0, 1.0]).normalized();
        assert_eq!(w.as_slice(), &[0.5, -1.0, 0.25]);
        let max_abs = w.as_slice().iter().fold(0.0_f64, |a, x| a.max(x.abs()));
        assert!((max_abs - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_degenerate_zero() {
        let w = wv(&[0.0, 0.0]).normalized();
        assert_eq!(w.as_slice(), &[0.0, 0.0]);
    }

    #[test]
    fn test_mean_abs_diff() {
        let a = wv(&[1.0, 2.0, 3.0]);
        let b = [1.5, 1.0, 3.0];
        assert!((a.mean_abs_diff(&b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mean_abs_diff_no_previous() {
        // First iteration: no previous vector, delta reported as 0.0
        let a = wv(&[1.0, 2.0]);
        assert_eq!(a.mean_abs_diff(&[]), 0.0);
    }

    #[test]
    fn test_line_round_trip() {
        let a = wv(&[0.25, -1.5, 3.0]);
        let b = WeightVector::parse_line(&a.to_line()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_same_candidate_feature_sensitivity() {
        let h1 = Hypothesis {
            sent: 0,
            text: "the cat".into(),
            feats: vec![1.0, 2.0],
            pal: None,
        };
        let mut h2 = h1.clone();
        assert!(h1.same_candidate(&h2));
        h2.feats[1] = 2.0 + 1e-9;
        assert!(!h1.same_candidate(&h2));
        // alignment annotation does not affect identity
        h2.feats[1] = 2.0;
        h2.pal = Some("0-1".into());
        assert!(h1.same_candidate(&h2));
    }
}
