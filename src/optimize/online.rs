//! Online lattice MIRA: per-shard decode+optimize with end-of-iteration
//! combination.
//!
//! The corpus is sharded once, on the first optimize call. Every
//! iteration thereafter, each shard runs one external training step
//! that decodes its slice and updates its running model against its
//! own background BLEU counts; the steps run concurrently on a pool
//! sized to the shard count. When all shards report:
//!
//! - per-shard models are merged in-process by the configured
//!   [`CombinePolicy`] (order-independent by construction),
//! - per-shard background counts are summed into the combined count
//!   file, and the combined counts are handed to the external count
//!   scorer for the iteration's optimizer score.
//!
//! Each shard writes only its own files, so the workers share nothing
//! mutable; the combine step is the only reader of all of them and
//! runs after the pool has joined.

use std::fs::File;
use std::io::Write;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;

use crate::context::RunContext;
use crate::decode::DecodeMode;
use crate::external::{self, CONFIGTOOL_BIN, DECODER_BIN};
use crate::shard::{self, CombinePolicy, Shard, ShardSet};
use crate::types::WeightVector;

use super::{learner_cmd, path_str, ArgCursor, OptimizerStrategy};

/// Online (sharded) lattice MIRA.
#[derive(Debug)]
pub struct OnlineMiraStrategy {
    c: f64,
    decay: f64,
    background: String,
    density: f64,
    combine_counts: bool,
    policy: CombinePolicy,
    shards: Option<ShardSet>,
}

impl OnlineMiraStrategy {
    pub fn from_args(args: &[&str]) -> Result<Self> {
        let mut cur = ArgCursor::new("olmira", args);
        let c = cur.take_f64(0.01)?;
        let decay = cur.take_f64(0.999)?;
        let background = cur.take_str("Oracle");
        let density = cur.take_f64(1000.0)?;
        let combine_counts = cur.take_bool(false)?;
        let policy = match cur.take_str("uniform").as_str() {
            "uniform" => CombinePolicy::Uniform,
            "corpus" => CombinePolicy::CorpusWeighted,
            other => bail!(
                "olmira: combine policy must be `uniform` or `corpus`, got {:?}",
                other
            ),
        };
        cur.finish()?;
        Ok(Self {
            c,
            decay,
            background,
            density,
            combine_counts,
            policy,
            shards: None,
        })
    }

    /// Write one shard's step configuration for this iteration.
    fn write_step_config(
        &self,
        ctx: &RunContext,
        shard: &Shard,
        iter: usize,
    ) -> Result<()> {
        // The previous iteration's combined model seeds every shard;
        // background counts stay per-shard unless count combination is
        // on.
        let model_in = if iter == 0 {
            "empty".to_string()
        } else {
            path_str(&ctx.shard_tag("mira.model", Some(iter - 1), None))
        };
        let count_in = if iter == 0 {
            "empty".to_string()
        } else if self.combine_counts {
            path_str(&ctx.shard_tag("mira.count", Some(iter - 1), None))
        } else {
            path_str(&shard.count_out(ctx, iter - 1))
        };

        let decode_config = shard.decode_config(ctx);
        let decode_cmd = format!(
            "{} -f {} -ffvals -palign -lattice {}",
            DECODER_BIN,
            decode_config.display(),
            shard.lattice_tmp(ctx).display()
        );
        let weight_cmd = format!(
            "{} set-weights-rm:- {} {}",
            CONFIGTOOL_BIN,
            ctx.base_config.display(),
            decode_config.display()
        );
        let ref_files = shard
            .refs
            .iter()
            .map(|r| r.display().to_string())
            .collect::<Vec<_>>()
            .join(",");

        let path = shard.step_config(ctx);
        let mut f =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        writeln!(f, "modelInFile = {}", model_in)?;
        writeln!(f, "modelOutFile = {}", path_str(&shard.model_out(ctx, iter)))?;
        writeln!(f, "portageIniWeights = {}", path_str(&ctx.optimizer_model_in()))?;
        writeln!(f, "bleuCountInFile = {}", count_in)?;
        writeln!(f, "bleuCountOutFile = {}", path_str(&shard.count_out(ctx, iter)))?;
        writeln!(f, "decodeCmd = {}", decode_cmd)?;
        writeln!(f, "weightCmd = {}", weight_cmd)?;
        writeln!(f, "srcFile = {}", path_str(&shard.src))?;
        writeln!(f, "refFiles = {}", ref_files)?;
        writeln!(f, "latticeTmpFile = {}", path_str(&shard.lattice_tmp(ctx)))?;
        writeln!(f, "C = {}", self.c)?;
        writeln!(f, "decay = {}", self.decay)?;
        writeln!(f, "background = {}", self.background)?;
        writeln!(f, "density = {}", self.density)?;
        Ok(())
    }
}

impl OptimizerStrategy for OnlineMiraStrategy {
    fn name(&self) -> &'static str {
        "olmira"
    }

    fn decode_mode(&self, _ctx: &RunContext) -> DecodeMode {
        // Shard steps decode their own slices; the top-level decode
        // only produces the 1-best output for scoring.
        DecodeMode::SentencesOnly
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
        if self.shards.is_none() {
            self.shards = Some(ShardSet::create(ctx, ctx.parallel_jobs)?);
        }
        let shards = self
            .shards
            .as_ref()
            .context("shard set missing after creation")?;

        for shard in &shards.shards {
            self.write_step_config(ctx, shard, iter)?;
        }

        // One worker per shard; each step blocks on external processes.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(shards.len())
            .build()
            .context("building shard worker pool")?;
        pool.install(|| {
            shards
                .shards
                .par_iter()
                .map(|shard| {
                    learner_cmd(ctx, "MiraLatticeStep")
                        .arg(path_str(&shard.step_config(ctx)))
                        .arg(iter.to_string())
                        .run_logged(&ctx.optimize_log(), ctx.verbose)
                })
                .collect::<Result<Vec<_>>>()
        })
        .context("per-shard optimization failed")?;

        // Combine models under the configured policy.
        let models = shards
            .shards
            .iter()
            .map(|s| {
                external::read_model(&s.model_out(ctx, iter)).map(|m| (m, s.n_sents))
            })
            .collect::<Result<Vec<_>>>()?;
        let combined = shard::combine_weights(&models, self.policy)?;

        let names = external::read_model_names(&shards.shards[0].model_out(ctx, iter))?;
        let combined_model = ctx.shard_tag("mira.model", Some(iter), None);
        external::write_model(&combined_model, &names, &combined)?;
        external::write_model(&ctx.optimizer_model_out(), &names, &combined)?;

        // Combine background counts (separately from weights) and let
        // the external scorer read the iteration's score off them.
        let counts = shards
            .shards
            .iter()
            .map(|s| shard::read_counts(&s.count_out(ctx, iter)))
            .collect::<Result<Vec<_>>>()?;
        let combined_counts = shard::combine_counts(&counts)?;
        let combined_count_file = ctx.shard_tag("mira.count", Some(iter), None);
        shard::write_counts(&combined_count_file, &combined_counts)?;

        let out = learner_cmd(ctx, "ScoreCountFile")
            .arg(path_str(&combined_count_file))
            .capture(&ctx.optimize_log(), ctx.verbose)?;
        let score = out
            .split_whitespace()
            .next()
            .context("empty output from count scorer")?
            .parse::<f64>()
            .context("unparsable score from count scorer")?;

        Ok((combined, score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_olmira_defaults() {
        let o = OnlineMiraStrategy::from_args(&[]).unwrap();
        assert_eq!(o.c, 0.01);
        assert_eq!(o.decay, 0.999);
        assert_eq!(o.background, "Oracle");
        assert_eq!(o.density, 1000.0);
        assert!(!o.combine_counts);
        assert_eq!(o.policy, CombinePolicy::Uniform);
        assert!(!o.aggregates_nbest());
    }

    #[test]
    fn test_olmira_combine_policy_arg() {
        let o = OnlineMiraStrategy::from_args(&["0.1", "0.9", "Model", "500", "true", "corpus"])
            .unwrap();
        assert!(o.combine_counts);
        assert_eq!(o.policy, CombinePolicy::CorpusWeighted);
        assert!(OnlineMiraStrategy::from_args(&["0.1", "0.9", "M", "500", "true", "median"])
            .is_err());
    }

    #[test]
    fn test_step_config_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::context::RunContext::for_tests(dir.path());
        std::fs::write(&ctx.src, "s0\ns1\ns2\ns3\n").unwrap();
        std::fs::write(&ctx.refs[0], "r0\nr1\nr2\nr3\n").unwrap();
        ctx.init().unwrap();

        let strat = OnlineMiraStrategy::from_args(&[]).unwrap();
        let set = ShardSet::create(&ctx, 2).unwrap();
        strat.write_step_config(&ctx, &set.shards[1], 0).unwrap();
        let text = std::fs::read_to_string(set.shards[1].step_config(&ctx)).unwrap();
        assert!(text.contains("modelInFile = empty"));
        assert!(text.contains("bleuCountInFile = empty"));
        assert!(text.contains("C = 0.01"));
        assert!(text.contains("srcFile = "));

        // Later iterations seed from the previous combined model and
        // their own count file.
        strat.write_step_config(&ctx, &set.shards[1], 3).unwrap();
        let text = std::fs::read_to_string(set.shards[1].step_config(&ctx)).unwrap();
        assert!(text.contains("mira.model.i02.sxx"));
        assert!(text.contains("mira.count.i02.s01"));
    }
}
