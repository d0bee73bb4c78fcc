//! Batch optimizers over the cumulative n-best accumulation.
//!
//! Five algorithms share one shape: hand the external learner the
//! cumulative n-best / ffvals / per-hypothesis BLEU files plus a
//! starting model, collect a model file back, and scrape the learner's
//! reported score out of the optimize log. They differ only in binary,
//! hyperparameters, and the score pattern - which is why each one is a
//! thin typed config over the shared plumbing in the parent module.
//!
//! Powell is the odd one out: it drives its own line search through a
//! per-iteration weight-record file, takes passthrough switches rather
//! than fixed positional hyperparameters, and its weights stay in the
//! decoder's native scale (no normalization).

use std::fs;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::context::RunContext;
use crate::decode::DecodeMode;
use crate::external::{self, scrape_last_score, ToolCommand, POWELL_BIN};
use crate::types::WeightVector;

use super::{
    derived_seed, learner_cmd, path_str, promote_model_out, ref_glob, stage_model_in, ArgCursor,
    OptimizerStrategy,
};

static MIRA_SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Best BLEU found on it# \d+, score ([\d.]+)").unwrap());
static SVM_SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Best obj found on it# \d+, score it\s+\d+ : BLEU = ([\d.]+)").unwrap());
static PRO_SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Best BLEU found \(samp=\d+\) : ([\d.]+)").unwrap());
static EXPSB_SCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\d.]+)$").unwrap());

/// Powell line search over the accumulated n-best lists.
///
/// Arguments are passed through to the external trainer verbatim.
#[derive(Debug, Clone)]
pub struct PowellStrategy {
    extra_args: Vec<String>,
}

impl PowellStrategy {
    pub fn from_args(args: &[&str]) -> Result<Self> {
        Ok(Self {
            extra_args: args.iter().map(|s| s.to_string()).collect(),
        })
    }
}

impl OptimizerStrategy for PowellStrategy {
    fn name(&self) -> &'static str {
        "powell"
    }

    fn decode_mode(&self, ctx: &RunContext) -> DecodeMode {
        DecodeMode::Nbest {
            size: ctx.nbest_size,
        }
    }

    fn normalizes_weights(&self) -> bool {
        false
    }

    fn optimize(
        &mut self,
        ctx: &RunContext,
        iter: usize,
        _weights: &WeightVector,
    ) -> Result<(WeightVector, f64)> {
        let wts_in = ctx.powell_wts(iter);
        let wts_out = ctx.powell_wts(iter + 1);
        if iter == 0 && !wts_in.exists() {
            fs::write(&wts_in, "")
                .with_context(|| format!("creating {}", wts_in.display()))?;
        }

        let seed = ctx.seed * 10_000 + iter as u64;
        let mut cmd = ToolCommand::new(POWELL_BIN)
            .args(["-n", "-r", "15", "-dyn", "-win", "5"])
            .arg("-s")
            .arg(seed.to_string())
            .arg("-wi")
            .arg(path_str(&wts_in))
            .arg("-wo")
            .arg(path_str(&wts_out))
            .args(self.extra_args.iter().cloned())
            .arg(path_str(&ctx.optimizer_model_in()))
            .arg(path_str(&ctx.optimizer_model_out()))
            .arg(path_str(&ctx.src))
            .arg(path_str(&ctx.all_nbests()));
        for r in &ctx.refs {
            cmd = cmd.arg(path_str(r));
        }
        cmd.run_logged(&ctx.optimize_log(), ctx.verbose)?;

        let new_weights = external::read_model(&ctx.optimizer_model_out())?;

        // The line-search score is the third token of the weight
        // record's first line.
        let record = fs::read_to_string(&wts_out)
            .with_context(|| format!("reading {}", wts_out.display()))?;
        let score = record
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(2))
            .with_context(|| format!("no score in weight record {}", wts_out.display()))?
            .parse::<f64>()
            .with_context(|| format!("bad score in weight record {}", wts_out.display()))?;

        Ok((new_weights, score))
    }
}

/// MIRA over the accumulated n-best lists.
#[derive(Debug, Clone)]
pub struct MiraStrategy {
    c: f64,
    iters: u32,
    neg_examples: u32,
    bleu_col: i32,
    hope_update: bool,
    background: String,
    decay: f64,
}

impl MiraStrategy {
    pub fn from_args(args: &[&str]) -> Result<Self> {
        let mut cur = ArgCursor::new("mira", args);
        let s = Self {
            c: cur.take_f64(1e-2)?,
            iters: cur.take_u32(30)?,
            neg_examples: cur.take_u32(1)?,
            bleu_col: cur.take_i32(-4)?,
            hope_update: cur.take_bool(true)?,
            background: cur.take_str("Oracle"),
            decay: cur.take_f64(0.999)?,
        };
        cur.finish()?;
        Ok(s)
    }
}

impl OptimizerStrategy for MiraStrategy {
    fn name(&self) -> &'static str {
        "mira"
    }

    fn decode_mode(&self, ctx: &RunContext) -> DecodeMode {
        DecodeMode::Nbest {
            size: ctx.nbest_size,
        }
    }

    fn needs_bleu_table(&self) -> bool {
        true
    }

    fn optimize(
        &mut self,
        ctx: &RunContext,
        iter: usize,
        _weights: &WeightVector,
    ) -> Result<(WeightVector, f64)> {
        stage_model_in(ctx, iter)?;
        learner_cmd(ctx, "MiraTrainNbestDecay")
            .arg(path_str(&ctx.optimizer_model_in()))
            .arg(path_str(&ctx.all_ffvals()))
            .arg(path_str(&ctx.all_bleus()))
            .arg(path_str(&ctx.all_nbests()))
            .arg(ref_glob(ctx))
            .arg(self.c.to_string())
            .arg(self.iters.to_string())
            .arg(self.neg_examples.to_string())
            .arg(self.bleu_col.to_string())
            .arg(self.hope_update.to_string())
            .arg(self.background.clone())
            .arg(self.decay.to_string())
            .arg(ctx.bleu_order.to_string())
            .arg(derived_seed(ctx, iter).to_string())
            .stdout_file(ctx.optimizer_model_out())
            .run_logged(&ctx.optimize_log(), ctx.verbose)?;

        let new_weights = external::read_model(&ctx.optimizer_model_out())?;
        promote_model_out(ctx)?;
        let score = scrape_last_score(&ctx.optimize_log(), &MIRA_SCORE)?;
        Ok((new_weights, score))
    }
}

/// Pairwise ranking optimization over the accumulated n-best lists.
#[derive(Debug, Clone)]
pub struct ProStrategy {
    learner: String,
    current_weight: f64,
    bleu_col: i32,
    single_sample: bool,
    regularization: f64,
}

impl ProStrategy {
    pub fn from_args(args: &[&str]) -> Result<Self> {
        let mut cur = ArgCursor::new("pro", args);
        let s = Self {
            learner: cur.take_str("MaxentZero"),
            current_weight: cur.take_f64(0.1)?,
            bleu_col: cur.take_i32(-2)?,
            single_sample: cur.take_bool(false)?,
            regularization: cur.take_f64(1e-4)?,
        };
        cur.finish()?;
        Ok(s)
    }
}

impl OptimizerStrategy for ProStrategy {
    fn name(&self) -> &'static str {
        "pro"
    }

    fn decode_mode(&self, ctx: &RunContext) -> DecodeMode {
        DecodeMode::Nbest {
            size: ctx.nbest_size,
        }
    }

    fn needs_bleu_table(&self) -> bool {
        true
    }

    fn optimize(
        &mut self,
        ctx: &RunContext,
        iter: usize,
        _weights: &WeightVector,
    ) -> Result<(WeightVector, f64)> {
        stage_model_in(ctx, iter)?;
        // PRO writes its model to the named output file; stdout is
        // progress only.
        learner_cmd(ctx, "ProTrainNbest")
            .arg(path_str(&ctx.optimizer_model_in()))
            .arg(path_str(&ctx.all_ffvals()))
            .arg(path_str(&ctx.all_bleus()))
            .arg(path_str(&ctx.all_nbests()))
            .arg(ref_glob(ctx))
            .arg(self.learner.clone())
            .arg(self.single_sample.to_string())
            .arg(self.current_weight.to_string())
            .arg(self.bleu_col.to_string())
            .arg(self.regularization.to_string())
            .arg(iter.to_string())
            .arg(path_str(&ctx.optimizer_model_out()))
            .run_logged(&ctx.optimize_log(), ctx.verbose)?;

        let new_weights = external::read_model(&ctx.optimizer_model_out())?;
        promote_model_out(ctx)?;
        let score = scrape_last_score(&ctx.optimize_log(), &PRO_SCORE)?;
        Ok((new_weights, score))
    }
}

/// Multiclass SVM training over the accumulated n-best lists.
#[derive(Debug, Clone)]
pub struct SvmStrategy {
    c: f64,
    bleu_col: i32,
    mode: String,
}

impl SvmStrategy {
    pub fn from_args(args: &[&str]) -> Result<Self> {
        let mut cur = ArgCursor::new("svm", args);
        let s = Self {
            c: cur.take_f64(1e-3)?,
            bleu_col: cur.take_i32(-1)?,
            mode: cur.take_str("cut"),
        };
        cur.finish()?;
        if s.mode != "cut" && s.mode != "full" {
            bail!("svm: mode must be `cut` or `full`, got {:?}", s.mode);
        }
        Ok(s)
    }
}

impl OptimizerStrategy for SvmStrategy {
    fn name(&self) -> &'static str {
        "svm"
    }

    fn decode_mode(&self, ctx: &RunContext) -> DecodeMode {
        DecodeMode::Nbest {
            size: ctx.nbest_size,
        }
    }

    fn needs_bleu_table(&self) -> bool {
        true
    }

    fn optimize(
        &mut self,
        ctx: &RunContext,
        iter: usize,
        _weights: &WeightVector,
    ) -> Result<(WeightVector, f64)> {
        stage_model_in(ctx, iter)?;
        learner_cmd(ctx, "SvmTrainNbest")
            .arg(path_str(&ctx.optimizer_model_in()))
            .arg(path_str(&ctx.all_ffvals()))
            .arg(path_str(&ctx.all_bleus()))
            .arg(path_str(&ctx.all_nbests()))
            .arg(ref_glob(ctx))
            .arg(self.c.to_string())
            .arg(self.bleu_col.to_string())
            .arg(self.mode.clone())
            .stdout_file(ctx.optimizer_model_out())
            .run_logged(&ctx.optimize_log(), ctx.verbose)?;

        let new_weights = external::read_model(&ctx.optimizer_model_out())?;
        promote_model_out(ctx)?;
        let score = scrape_last_score(&ctx.optimize_log(), &SVM_SCORE)?;
        Ok((new_weights, score))
    }
}

/// Expected sentence-BLEU maximization over the accumulated n-best
/// lists.
#[derive(Debug, Clone)]
pub struct ExpSbStrategy {
    smooth: f64,
    bfgs: bool,
}

impl ExpSbStrategy {
    pub fn from_args(args: &[&str]) -> Result<Self> {
        let mut cur = ArgCursor::new("expsb", args);
        let s = Self {
            smooth: cur.take_f64(50.0)?,
            bfgs: cur.take_bool(false)?,
        };
        cur.finish()?;
        Ok(s)
    }
}

impl OptimizerStrategy for ExpSbStrategy {
    fn name(&self) -> &'static str {
        "expsb"
    }

    fn decode_mode(&self, ctx: &RunContext) -> DecodeMode {
        DecodeMode::Nbest {
            size: ctx.nbest_size,
        }
    }

    fn needs_bleu_table(&self) -> bool {
        true
    }

    fn optimize(
        &mut self,
        ctx: &RunContext,
        iter: usize,
        _weights: &WeightVector,
    ) -> Result<(WeightVector, f64)> {
        stage_model_in(ctx, iter)?;
        learner_cmd(ctx, "ExpLinGainNbest")
            .arg(path_str(&ctx.optimizer_model_in()))
            .arg(path_str(&ctx.all_ffvals()))
            .arg(path_str(&ctx.all_bleus()))
            .arg(path_str(&ctx.all_nbests()))
            .arg(ref_glob(ctx))
            .arg(self.smooth.to_string())
            .arg(self.bfgs.to_string())
            .stdout_file(ctx.optimizer_model_out())
            .run_logged(&ctx.optimize_log(), ctx.verbose)?;

        let new_weights = external::read_model(&ctx.optimizer_model_out())?;
        promote_model_out(ctx)?;
        let score = scrape_last_score(&ctx.optimize_log(), &EXPSB_SCORE)?;
        Ok((new_weights, score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mira_defaults() {
        let m = MiraStrategy::from_args(&[]).unwrap();
        assert_eq!(m.c, 1e-2);
        assert_eq!(m.iters, 30);
        assert_eq!(m.neg_examples, 1);
        assert_eq!(m.bleu_col, -4);
        assert!(m.hope_update);
        assert_eq!(m.background, "Oracle");
        assert_eq!(m.decay, 0.999);
    }

    #[test]
    fn test_mira_overrides_and_arity() {
        let m = MiraStrategy::from_args(&["1e-4", "50", "4"]).unwrap();
        assert_eq!(m.c, 1e-4);
        assert_eq!(m.iters, 50);
        assert_eq!(m.neg_examples, 4);
        assert_eq!(m.bleu_col, -4, "unset args keep defaults");

        let err =
            MiraStrategy::from_args(&["1", "2", "3", "4", "true", "Model", "0.9", "extra"])
                .unwrap_err();
        assert!(format!("{:#}", err).contains("trailing"));
    }

    #[test]
    fn test_pro_defaults() {
        let p = ProStrategy::from_args(&[]).unwrap();
        assert_eq!(p.learner, "MaxentZero");
        assert_eq!(p.current_weight, 0.1);
        assert_eq!(p.bleu_col, -2);
        assert!(!p.single_sample);
        assert_eq!(p.regularization, 1e-4);
    }

    #[test]
    fn test_svm_mode_validated() {
        assert!(SvmStrategy::from_args(&["0.01", "-1", "full"]).is_ok());
        assert!(SvmStrategy::from_args(&["0.01", "-1", "chunky"]).is_err());
    }

    #[test]
    fn test_powell_takes_passthrough_switches() {
        let p = PowellStrategy::from_args(&["-float-init", "-p", "4"]).unwrap();
        assert_eq!(p.extra_args, vec!["-float-init", "-p", "4"]);
        assert!(!p.normalizes_weights());
    }

    #[test]
    fn test_score_patterns() {
        assert_eq!(
            &MIRA_SCORE.captures("Best BLEU found on it# 12, score 0.3071").unwrap()[1],
            "0.3071"
        );
        assert_eq!(
            &SVM_SCORE
                .captures("Best obj found on it# 3, score it   7 : BLEU = 0.2810")
                .unwrap()[1],
            "0.2810"
        );
        assert_eq!(
            &PRO_SCORE.captures("Best BLEU found (samp=5) : 0.2954").unwrap()[1],
            "0.2954"
        );
        assert_eq!(&EXPSB_SCORE.captures("final objective 0.1234").unwrap()[1], "0.1234");
    }
}
