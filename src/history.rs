//! Append-only run history and best-iteration bookkeeping.
//!
//! Two line-parallel files record every iteration: a summary line
//! (decode score, previous optimizer score, previous accumulation
//! size, mean weight delta) and the full weight vector. Lines are only
//! ever appended - a record is never rewritten once an iteration
//! completes, so the files double as the run's audit trail and as
//! input for cross-run stability summaries.

use std::path::Path;

use anyhow::Result;

use crate::context::RunContext;
use crate::types::{BestResult, IterationRecord, WeightVector};

/// Writer for the summary/weight history pair.
pub struct HistoryLog<'a> {
    ctx: &'a RunContext,
}

impl<'a> HistoryLog<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Append one iteration's record and its weight vector.
    pub fn append(&self, record: &IterationRecord, weights: &WeightVector) -> Result<()> {
        self.ctx
            .log_line(&self.ctx.history_file(), &format_record(record))?;
        self.ctx
            .log_line(&self.ctx.weight_history_file(), &weights.to_line())?;
        Ok(())
    }
}

/// Render a record as the canonical history line.
pub fn format_record(r: &IterationRecord) -> String {
    format!(
        "decode-score={} prev-optimizer-score={} prev-nbest-size={} avg-wt-diff={}",
        r.decode_score, r.prev_optimizer_score, r.prev_aggregate_size, r.avg_weight_delta
    )
}

/// Parse the decode score back out of a history line.
pub fn parse_decode_score(line: &str) -> Option<f64> {
    line.split_whitespace()
        .find_map(|tok| tok.strip_prefix("decode-score="))
        .and_then(|v| v.parse::<f64>().ok())
}

/// Read all decode scores from a history file, in iteration order.
pub fn read_decode_scores(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().filter_map(parse_decode_score).collect())
}

/// Tracks the best-scoring iteration across the run.
///
/// Updates only on a strictly greater score, so ties keep the earliest
/// iteration.
#[derive(Debug, Default)]
pub struct BestTracker {
    best: Option<BestResult>,
}

impl BestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer one iteration's score; records it if strictly better.
    pub fn observe(&mut self, iter: usize, score: f64, weights: &WeightVector) {
        let better = match &self.best {
            None => true,
            Some(b) => score > b.score,
        };
        if better {
            self.best = Some(BestResult {
                iter,
                score,
                weights: weights.clone(),
            });
        }
    }

    pub fn best(&self) -> Option<&BestResult> {
        self.best.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wv(v: &[f64]) -> WeightVector {
        WeightVector::new(v.to_vec()).unwrap()
    }

    #[test]
    fn test_best_tracking_sequence() {
        let scores = [0.20, 0.25, 0.22, 0.30, 0.28];
        let mut tracker = BestTracker::new();
        for (i, &s) in scores.iter().enumerate() {
            tracker.observe(i, s, &wv(&[i as f64]));
        }
        let best = tracker.best().unwrap();
        assert_eq!(best.iter, 3);
        assert_eq!(best.score, 0.30);
        assert_eq!(best.weights.as_slice(), &[3.0]);
    }

    #[test]
    fn test_ties_keep_earliest() {
        let mut tracker = BestTracker::new();
        tracker.observe(0, 0.25, &wv(&[0.0]));
        tracker.observe(1, 0.25, &wv(&[1.0]));
        assert_eq!(tracker.best().unwrap().iter, 0);
    }

    #[test]
    fn test_record_line_round_trip() {
        let r = IterationRecord {
            iter: 2,
            decode_score: 0.2815,
            prev_optimizer_score: 0.3,
            prev_aggregate_size: 4200,
            avg_weight_delta: 0.05,
        };
        let line = format_record(&r);
        assert!(line.starts_with("decode-score=0.2815 "));
        assert_eq!(parse_decode_score(&line), Some(0.2815));
    }

    #[test]
    fn test_history_files_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::context::RunContext::for_tests(dir.path());
        ctx.init().unwrap();
        let log = HistoryLog::new(&ctx);
        for i in 0..3 {
            let r = IterationRecord {
                iter: i,
                decode_score: 0.1 * (i + 1) as f64,
                prev_optimizer_score: 0.0,
                prev_aggregate_size: 0,
                avg_weight_delta: 0.0,
            };
            log.append(&r, &wv(&[i as f64, 1.0])).unwrap();
        }
        let scores = read_decode_scores(&ctx.history_file()).unwrap();
        assert_eq!(scores.len(), 3);
        assert!((scores[2] - 0.3).abs() < 1e-12);
        let wts = std::fs::read_to_string(ctx.weight_history_file()).unwrap();
        assert_eq!(wts.lines().count(), 3);
        assert_eq!(wts.lines().next().unwrap(), "0 1");
    }
}
