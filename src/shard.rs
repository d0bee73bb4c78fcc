//! Corpus sharding for the online lattice training strategy.
//!
//! The corpus is partitioned exactly once, before iteration 1, into N
//! disjoint contiguous slices. Each shard owns its slice of the source
//! and of every reference file, plus per-iteration running-model and
//! background BLEU-count files that accumulate for the whole run.
//! Shards decode and optimize independently and concurrently, so the
//! end-of-iteration combine step must not care what order shards
//! finished in: weight combination averages element-wise and count
//! combination sums element-wise, both order-independent.
//!
//! The weighting scheme for model combination is a policy, not a
//! constant: uniform averaging and corpus-size weighting are both
//! defensible, and which one the external pipeline expects is a site
//! decision.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::context::RunContext;
use crate::types::WeightVector;

/// How per-shard models are merged into one weight vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinePolicy {
    /// Plain average of per-shard weights
    Uniform,
    /// Average weighted by each shard's sentence count
    CorpusWeighted,
}

/// One disjoint slice of the corpus, alive for the whole run.
#[derive(Debug, Clone)]
pub struct Shard {
    /// Shard index (0-based)
    pub id: usize,
    /// This shard's slice of the source corpus
    pub src: PathBuf,
    /// This shard's slice of each reference file
    pub refs: Vec<PathBuf>,
    /// Sentences in this shard
    pub n_sents: usize,
}

impl Shard {
    /// Running-model file this shard writes at `iter`.
    pub fn model_out(&self, ctx: &RunContext, iter: usize) -> PathBuf {
        ctx.shard_tag("mira.model", Some(iter), Some(self.id))
    }

    /// Background BLEU-count file this shard writes at `iter`.
    pub fn count_out(&self, ctx: &RunContext, iter: usize) -> PathBuf {
        ctx.shard_tag("mira.count", Some(iter), Some(self.id))
    }

    /// Per-shard decoder configuration for the current iteration.
    pub fn decode_config(&self, ctx: &RunContext) -> PathBuf {
        ctx.shard_tag("decode-config", None, Some(self.id))
    }

    /// Per-shard optimizer step configuration.
    pub fn step_config(&self, ctx: &RunContext) -> PathBuf {
        ctx.shard_tag("mira-config", None, Some(self.id))
    }

    /// Per-shard lattice scratch file.
    pub fn lattice_tmp(&self, ctx: &RunContext) -> PathBuf {
        ctx.shard_tag("lat", None, Some(self.id))
    }
}

/// The run's full shard partition.
#[derive(Debug, Clone)]
pub struct ShardSet {
    pub shards: Vec<Shard>,
}

impl ShardSet {
    /// Partition source and references into `n` contiguous slices under
    /// the workdir. Invoked once per run; if the slice files already
    /// exist they are reused unchanged, so repeated calls are
    /// idempotent and every iteration sees the same boundaries.
    pub fn create(ctx: &RunContext, n: usize) -> Result<Self> {
        if n == 0 {
            bail!("shard count must be at least 1");
        }
        let src_lines = read_lines(&ctx.src)?;
        if src_lines.len() < n {
            bail!(
                "cannot split {} sentences into {} shards",
                src_lines.len(),
                n
            );
        }
        let ref_lines: Vec<Vec<String>> = ctx
            .refs
            .iter()
            .map(|r| read_lines(r))
            .collect::<Result<_>>()?;
        for (r, lines) in ctx.refs.iter().zip(&ref_lines) {
            if lines.len() != src_lines.len() {
                bail!(
                    "reference {} has {} lines, source has {}",
                    r.display(),
                    lines.len(),
                    src_lines.len()
                );
            }
        }

        let bounds = slice_bounds(src_lines.len(), n);
        let mut shards = Vec::with_capacity(n);
        for (id, &(start, len)) in bounds.iter().enumerate() {
            let src_path = ctx.shard_tag("src", None, Some(id));
            write_slice_once(&src_path, &src_lines[start..start + len])?;
            let mut refs = Vec::with_capacity(ctx.refs.len());
            for (ri, lines) in ref_lines.iter().enumerate() {
                let ref_path = ctx.shard_tag(&format!("ref.{}", ri), None, Some(id));
                write_slice_once(&ref_path, &lines[start..start + len])?;
                refs.push(ref_path);
            }
            shards.push(Shard {
                id,
                src: src_path,
                refs,
                n_sents: len,
            });
        }
        Ok(Self { shards })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Contiguous (start, len) slices covering `n_sents` in order.
fn slice_bounds(n_sents: usize, n: usize) -> Vec<(usize, usize)> {
    let base = n_sents / n;
    let extra = n_sents % n;
    let mut bounds = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        bounds.push((start, len));
        start += len;
    }
    bounds
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    BufReader::new(f)
        .lines()
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("reading {}", path.display()))
}

fn write_slice_once(path: &Path, lines: &[String]) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let mut f =
        File::create(path).with_context(|| format!("creating shard slice {}", path.display()))?;
    for line in lines {
        writeln!(f, "{}", line)?;
    }
    Ok(())
}

/// Merge per-shard weight vectors into one, according to policy.
///
/// Both policies are plain weighted sums, so the result is independent
/// of shard completion order.
pub fn combine_weights(
    models: &[(WeightVector, usize)],
    policy: CombinePolicy,
) -> Result<WeightVector> {
    if models.is_empty() {
        bail!("no shard models to combine");
    }
    let dim = models[0].0.len();
    for (m, _) in models {
        if m.len() != dim {
            bail!(
                "shard models disagree on dimension: {} vs {}",
                m.len(),
                dim
            );
        }
    }

    let weight_of = |n_sents: usize| -> f64 {
        match policy {
            CombinePolicy::Uniform => 1.0,
            CombinePolicy::CorpusWeighted => n_sents as f64,
        }
    };
    let total: f64 = models.iter().map(|(_, n)| weight_of(*n)).sum();
    if total == 0.0 {
        bail!("degenerate shard weighting: total weight is zero");
    }

    let mut combined = vec![0.0; dim];
    for (model, n_sents) in models {
        let w = weight_of(*n_sents) / total;
        for (c, v) in combined.iter_mut().zip(model.as_slice()) {
            *c += w * v;
        }
    }
    WeightVector::new(combined)
}

/// Element-wise sum of per-shard background count vectors.
///
/// Background statistics only ever accumulate; summation is associative
/// and commutative, so shard completion order cannot matter.
pub fn combine_counts(counts: &[Vec<f64>]) -> Result<Vec<f64>> {
    if counts.is_empty() {
        bail!("no shard counts to combine");
    }
    let dim = counts[0].len();
    for c in counts {
        if c.len() != dim {
            bail!("shard counts disagree on dimension: {} vs {}", c.len(), dim);
        }
    }
    let mut sum = vec![0.0; dim];
    for c in counts {
        for (s, v) in sum.iter_mut().zip(c) {
            *s += v;
        }
    }
    Ok(sum)
}

/// Read a whitespace-separated count vector file.
pub fn read_counts(path: &Path) -> Result<Vec<f64>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading count file {}", path.display()))?;
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .with_context(|| format!("bad count token {:?} in {}", tok, path.display()))
        })
        .collect()
}

/// Write a count vector as one whitespace-separated line.
pub fn write_counts(path: &Path, counts: &[f64]) -> Result<()> {
    let line = counts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    fs::write(path, format!("{}\n", line))
        .with_context(|| format!("writing count file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;

    fn wv(v: &[f64]) -> WeightVector {
        WeightVector::new(v.to_vec()).unwrap()
    }

    #[test]
    fn test_slice_bounds_cover_corpus() {
        let b = slice_bounds(10, 3);
        assert_eq!(b, vec![(0, 4), (4, 3), (7, 3)]);
        let total: usize = b.iter().map(|(_, l)| l).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_combine_uniform_order_independent() {
        let a = (wv(&[1.0, 0.0]), 10);
        let b = (wv(&[0.0, 3.0]), 20);
        let c = (wv(&[2.0, 3.0]), 30);

        let abc = combine_weights(&[a.clone(), b.clone(), c.clone()], CombinePolicy::Uniform)
            .unwrap();
        let cab = combine_weights(&[c, a, b], CombinePolicy::Uniform).unwrap();
        for (x, y) in abc.as_slice().iter().zip(cab.as_slice()) {
            assert!((x - y).abs() < 1e-12);
        }
        assert!((abc.as_slice()[0] - 1.0).abs() < 1e-12);
        assert!((abc.as_slice()[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_combine_corpus_weighted() {
        let a = (wv(&[1.0]), 1);
        let b = (wv(&[4.0]), 3);
        let m = combine_weights(&[a, b], CombinePolicy::CorpusWeighted).unwrap();
        // (1*1 + 4*3) / 4 = 3.25
        assert!((m.as_slice()[0] - 3.25).abs() < 1e-12);
    }

    #[test]
    fn test_combine_dimension_mismatch_is_fatal() {
        let a = (wv(&[1.0]), 1);
        let b = (wv(&[1.0, 2.0]), 1);
        assert!(combine_weights(&[a, b], CombinePolicy::Uniform).is_err());
    }

    #[test]
    fn test_combine_counts_sums() {
        let s = combine_counts(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![0.5, 0.5]]).unwrap();
        assert_eq!(s, vec![4.5, 6.5]);
    }

    #[test]
    fn test_shard_create_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::for_tests(dir.path());
        std::fs::write(&ctx.src, "s0\ns1\ns2\ns3\ns4\n").unwrap();
        std::fs::write(&ctx.refs[0], "r0\nr1\nr2\nr3\nr4\n").unwrap();
        ctx.init().unwrap();

        let set = ShardSet::create(&ctx, 2).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.shards[0].n_sents, 3);
        assert_eq!(set.shards[1].n_sents, 2);
        let first = std::fs::read_to_string(&set.shards[0].src).unwrap();
        assert_eq!(first, "s0\ns1\ns2\n");

        // Scribble on a slice, recreate: boundaries and contents reused.
        std::fs::write(&set.shards[0].src, "scribble\n").unwrap();
        let again = ShardSet::create(&ctx, 2).unwrap();
        let reused = std::fs::read_to_string(&again.shards[0].src).unwrap();
        assert_eq!(reused, "scribble\n");
    }

    #[test]
    fn test_too_many_shards_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::for_tests(dir.path());
        std::fs::write(&ctx.src, "s0\n").unwrap();
        std::fs::write(&ctx.refs[0], "r0\n").unwrap();
        ctx.init().unwrap();
        assert!(ShardSet::create(&ctx, 2).is_err());
    }
}
