//! The iteration controller: decode, merge, score, optimize, repeat.
//!
//! Iterations are strictly sequential; all parallelism lives inside
//! one iteration (decode fan-out, shard workers). Per iteration i:
//!
//! 1. Decode the corpus with the current weights.
//! 2. Merge decode output into the cumulative accumulation (n-best
//!    strategies only) and note how many hypotheses were novel.
//! 3. BLEU-score the 1-best output.
//! 4. Append the iteration record to the history, update the best
//!    result (strictly-greater), and check the stopping rules.
//! 5. Run the optimizer strategy and replace the weight vector.
//!
//! Stopping: zero novel hypotheses means another decode with any
//! weights the optimizer could produce from the same data cannot add
//! information, so the loop ends; lattice strategies never report a
//! novel count and only stop on the iteration cap. Failures from the
//! decoder, scorer, or optimizer abort the run - by the time an
//! external step has died, weight state is not trustworthy enough to
//! continue.

use anyhow::{bail, Context, Result};

use crate::aggregate::AggregateState;
use crate::context::RunContext;
use crate::decode;
use crate::history::{BestTracker, HistoryLog};
use crate::optimize::OptimizerStrategy;
use crate::progress::TuneProgress;
use crate::score;
use crate::types::{BestResult, IterationRecord, WeightVector};

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The decode produced nothing the accumulation had not seen
    Exhausted,
    /// The iteration cap was reached
    MaxIterations,
}

/// Decide whether iteration `iter` is the run's last.
///
/// `novel` is `None` for strategies without n-best aggregation; those
/// never stop on exhaustion.
pub fn should_stop(novel: Option<usize>, iter: usize, max_iters: usize) -> Option<StopReason> {
    if novel == Some(0) {
        return Some(StopReason::Exhausted);
    }
    if iter + 1 == max_iters {
        return Some(StopReason::MaxIterations);
    }
    None
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct TuneOutcome {
    pub best: BestResult,
    pub final_weights: WeightVector,
    pub iterations_run: usize,
    pub stop_reason: StopReason,
}

/// The top-level tuning loop.
pub struct Tuner<'a> {
    ctx: &'a RunContext,
    strategy: Box<dyn OptimizerStrategy>,
    pub progress: TuneProgress,
}

impl<'a> Tuner<'a> {
    pub fn new(ctx: &'a RunContext, strategy: Box<dyn OptimizerStrategy>) -> Self {
        Self {
            ctx,
            strategy,
            progress: TuneProgress::new(),
        }
    }

    /// Run up to `max_iters` iterations from `initial` weights.
    pub fn run(&mut self, max_iters: usize, initial: WeightVector) -> Result<TuneOutcome> {
        if max_iters == 0 {
            bail!("maximum iterations must be at least 1");
        }
        let ctx = self.ctx;
        let n_sents = decode::count_source_sentences(&ctx.src)?;
        if n_sents == 0 {
            bail!("source corpus {} is empty", ctx.src.display());
        }

        let mut aggregate = AggregateState::new(n_sents);
        let history = HistoryLog::new(ctx);
        let mut best = BestTracker::new();

        let mut weights = initial;
        let mut prev_weights: Vec<f64> = Vec::new();
        let mut optimizer_score = 0.0;
        let mut prev_aggregate_size = 0;

        for iter in 0..max_iters {
            self.log_all(&format!("starting loop {}", iter + 1))?;

            decode::decode(ctx, &weights, self.strategy.decode_mode(ctx))
                .with_context(|| format!("decode failed on iteration {}", iter + 1))?;

            let novel = if self.strategy.aggregates_nbest() {
                if ctx.no_aggregate {
                    aggregate.clear();
                }
                let lists = decode::read_nbest_lists(ctx, n_sents, weights.len())?;
                let n = aggregate.merge(lists)?;
                aggregate.write_files(&ctx.all_nbests(), &ctx.all_ffvals())?;
                ctx.log_line(
                    &ctx.aggregate_log(),
                    &format!(
                        "iteration {}: {} novel hyps, {} total",
                        iter + 1,
                        n,
                        aggregate.len()
                    ),
                )?;
                Some(n)
            } else {
                None
            };

            let score = score::bleu_file(ctx, &ctx.decoder_1best())
                .with_context(|| format!("scoring failed on iteration {}", iter + 1))?;

            let delta = weights.mean_abs_diff(&prev_weights);
            let record = IterationRecord {
                iter,
                decode_score: score,
                prev_optimizer_score: optimizer_score,
                prev_aggregate_size,
                avg_weight_delta: delta,
            };
            history.append(&record, &weights)?;
            best.observe(iter, score, &weights);
            self.progress.record(score, novel, delta);

            if let Some(reason) = should_stop(novel, iter, max_iters) {
                match reason {
                    StopReason::Exhausted => println!(
                        "Stopping - no new hypotheses found on iteration {}",
                        iter + 1
                    ),
                    StopReason::MaxIterations => {
                        println!("Maximum iterations ({}) reached.", max_iters)
                    }
                }
                let best = best
                    .best()
                    .cloned()
                    .context("no iteration completed")?;
                return Ok(TuneOutcome {
                    best,
                    final_weights: weights,
                    iterations_run: iter + 1,
                    stop_reason: reason,
                });
            }

            prev_aggregate_size = aggregate.len();
            if self.strategy.needs_bleu_table() {
                score::nbest_bleu_table(ctx)
                    .with_context(|| format!("BLEU table failed on iteration {}", iter + 1))?;
            }

            prev_weights = weights.as_slice().to_vec();
            let (raw, opt_score) = self
                .strategy
                .optimize(ctx, iter, &weights)
                .with_context(|| format!("optimizer failed on iteration {}", iter + 1))?;
            if raw.len() != weights.len() {
                bail!(
                    "optimizer changed the weight dimension: {} -> {}",
                    weights.len(),
                    raw.len()
                );
            }
            weights = if self.strategy.normalizes_weights() {
                raw.normalized()
            } else {
                raw
            };
            optimizer_score = opt_score;
        }

        // max_iters >= 1, so the cap check always returns from inside
        // the loop.
        bail!("tuning loop exited without a stop reason")
    }

    fn log_all(&self, line: &str) -> Result<()> {
        for log in [
            self.ctx.decode_log(),
            self.ctx.eval_log(),
            self.ctx.aggregate_log(),
            self.ctx.optimize_log(),
        ] {
            self.ctx.log_line(&log, line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_on_exhaustion() {
        // novel == 0 stops regardless of remaining iterations
        assert_eq!(should_stop(Some(0), 2, 15), Some(StopReason::Exhausted));
    }

    #[test]
    fn test_no_stop_with_novelty() {
        assert_eq!(should_stop(Some(42), 2, 15), None);
    }

    #[test]
    fn test_lattice_strategies_ignore_exhaustion() {
        // no novel count reported: only the cap stops the loop
        assert_eq!(should_stop(None, 2, 15), None);
        assert_eq!(should_stop(None, 14, 15), Some(StopReason::MaxIterations));
    }

    #[test]
    fn test_cap_wins_on_last_iteration() {
        assert_eq!(should_stop(Some(10), 14, 15), Some(StopReason::MaxIterations));
    }

    #[test]
    fn test_exhaustion_checked_before_cap() {
        assert_eq!(should_stop(Some(0), 14, 15), Some(StopReason::Exhausted));
    }
}
