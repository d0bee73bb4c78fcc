//! Lattice MIRA: trains on the decode's pruned lattices directly.
//!
//! Unlike the batch n-best learners there is no cumulative n-best
//! accumulation - the lattices already encode the hypothesis space -
//! so the strategy opts out of aggregation and the exhaustion stopping
//! rule. Cross-iteration memory lives in the hypothesis-memory file the
//! external trainer maintains itself.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::context::RunContext;
use crate::decode::DecodeMode;
use crate::external::{self, scrape_last_score};
use crate::types::WeightVector;

use super::{
    derived_seed, learner_cmd, path_str, promote_model_out, ref_glob, stage_model_in, ArgCursor,
    OptimizerStrategy,
};

static LMIRA_SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Best BLEU found on it# \d+, score ([\d.]+)").unwrap());

/// Lattice MIRA over the current iteration's lattices.
#[derive(Debug, Clone)]
pub struct LatticeMiraStrategy {
    c: f64,
    decay: f64,
    background: String,
    density: f64,
    iters: u32,
}

impl LatticeMiraStrategy {
    pub fn from_args(args: &[&str]) -> Result<Self> {
        let mut cur = ArgCursor::new("lmira", args);
        let s = Self {
            c: cur.take_f64(0.01)?,
            decay: cur.take_f64(0.999)?,
            background: cur.take_str("Oracle"),
            density: cur.take_f64(50.0)?,
            iters: cur.take_u32(30)?,
        };
        cur.finish()?;
        Ok(s)
    }
}

impl OptimizerStrategy for LatticeMiraStrategy {
    fn name(&self) -> &'static str {
        "lmira"
    }

    fn decode_mode(&self, ctx: &RunContext) -> DecodeMode {
        DecodeMode::Lattice {
            density: ctx.density,
        }
    }

    fn aggregates_nbest(&self) -> bool {
        false
    }

    fn optimize(
        &mut self,
        ctx: &RunContext,
        iter: usize,
        _weights: &WeightVector,
    ) -> Result<(WeightVector, f64)> {
        stage_model_in(ctx, iter)?;
        learner_cmd(ctx, "MiraTrainLattice")
            .arg(path_str(&ctx.optimizer_model_in()))
            .arg(path_str(&ctx.workdir))
            .arg(ref_glob(ctx))
            .arg(path_str(&ctx.src))
            .arg(path_str(&ctx.hyp_mem()))
            .arg(self.c.to_string())
            .arg(self.decay.to_string())
            .arg(self.background.clone())
            .arg(self.density.to_string())
            .arg(self.iters.to_string())
            .arg(ctx.bleu_order.to_string())
            .arg(derived_seed(ctx, iter).to_string())
            .stdout_file(ctx.optimizer_model_out())
            .run_logged(&ctx.optimize_log(), ctx.verbose)?;

        let new_weights = external::read_model(&ctx.optimizer_model_out())?;
        promote_model_out(ctx)?;
        let score = scrape_last_score(&ctx.optimize_log(), &LMIRA_SCORE)?;
        Ok((new_weights, score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lmira_defaults() {
        let l = LatticeMiraStrategy::from_args(&[]).unwrap();
        assert_eq!(l.c, 0.01);
        assert_eq!(l.decay, 0.999);
        assert_eq!(l.background, "Oracle");
        assert_eq!(l.density, 50.0);
        assert_eq!(l.iters, 30);
        assert!(!l.aggregates_nbest());
        assert!(!l.needs_bleu_table());
    }

    #[test]
    fn test_lmira_arity() {
        assert!(LatticeMiraStrategy::from_args(&["0.1", "0.9", "Model", "200", "10"]).is_ok());
        assert!(
            LatticeMiraStrategy::from_args(&["0.1", "0.9", "Model", "200", "10", "x"]).is_err()
        );
    }
}
