//! Decode dispatcher: fan the corpus out to parallel decoder jobs.
//!
//! The external decoder is an opaque binary. Given a weight
//! configuration and source sentences on stdin it emits, per sentence,
//! an ordered n-best list with feature values (or a pruned lattice).
//! This module owns the fan-out/reassembly choreography:
//!
//! 1. Write the iteration's decoder config from the current weights.
//! 2. Split the source into contiguous sentence ranges, one per job.
//! 3. Run one decoder process per range on a rayon pool; any job
//!    failure aborts the whole iteration.
//! 4. Renumber job-local per-sentence output files to global sentence
//!    indices and concatenate the 1-best streams in range order, so
//!    downstream consumers see a single ordered-by-sentence result.
//!
//! Parsing of the paired n-best/ffvals files also lives here. The two
//! files must agree line-for-line; disagreement is the fatal
//! "inconsistent n-best/ffvals files" error, never silently patched up.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;

use crate::context::RunContext;
use crate::external::{ToolCommand, DECODER_BIN, ONEBEST_FILTER_BIN};
use crate::types::{Hypothesis, WeightVector};

/// What kind of output the decoder is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeMode {
    /// Per-sentence n-best lists plus feature values
    Nbest { size: usize },
    /// Per-sentence pruned lattices (density < 0 disables pruning)
    Lattice { density: f64 },
    /// 1-best only; no hypothesis files are produced
    SentencesOnly,
}

/// A contiguous range of source sentences assigned to one decoder job.
#[derive(Debug, Clone, Copy)]
struct JobRange {
    job: usize,
    start: usize,
    len: usize,
}

/// Split `n_sents` sentences into at most `jobs` contiguous ranges.
fn job_ranges(n_sents: usize, jobs: usize) -> Vec<JobRange> {
    let jobs = jobs.clamp(1, n_sents.max(1));
    let base = n_sents / jobs;
    let extra = n_sents % jobs;
    let mut ranges = Vec::with_capacity(jobs);
    let mut start = 0;
    for job in 0..jobs {
        let len = base + usize::from(job < extra);
        if len == 0 {
            break;
        }
        ranges.push(JobRange { job, start, len });
        start += len;
    }
    ranges
}

/// Count the sentences in the source corpus.
pub fn count_source_sentences(src: &Path) -> Result<usize> {
    let f = File::open(src).with_context(|| format!("opening source {}", src.display()))?;
    Ok(BufReader::new(f).lines().count())
}

/// Decode the full source corpus with the given weights.
///
/// On return the workdir holds the 1-best file and, depending on
/// `mode`, per-sentence n-best/ffvals or lattice files numbered by
/// global sentence index.
pub fn decode(ctx: &RunContext, weights: &WeightVector, mode: DecodeMode) -> Result<()> {
    crate::external::weights_to_config(
        weights,
        &ctx.base_config,
        &ctx.decode_config(),
        &ctx.decode_log(),
        ctx.verbose,
    )?;

    let src_lines: Vec<String> = {
        let f = File::open(&ctx.src)
            .with_context(|| format!("opening source {}", ctx.src.display()))?;
        BufReader::new(f)
            .lines()
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("reading source {}", ctx.src.display()))?
    };
    if src_lines.is_empty() {
        bail!("source corpus {} is empty", ctx.src.display());
    }

    let ranges = job_ranges(src_lines.len(), ctx.parallel_jobs);

    // Decoder jobs block on external processes, so size the pool to the
    // job count rather than the CPU count.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ranges.len())
        .build()
        .context("building decode worker pool")?;
    pool.install(|| {
        ranges
            .par_iter()
            .map(|range| decode_range(ctx, range, &src_lines, mode))
            .collect::<Result<Vec<_>>>()
    })
    .context("parallel decode failed")?;

    // Reassemble 1-best output in range order.
    let mut onebest = File::create(ctx.decoder_1best())
        .with_context(|| format!("creating {}", ctx.decoder_1best().display()))?;
    for range in &ranges {
        let part = job_path(ctx, "out", range.job);
        let mut text = String::new();
        File::open(&part)
            .with_context(|| format!("missing decoder job output {}", part.display()))?
            .read_to_string(&mut text)?;
        onebest.write_all(text.as_bytes())?;
        fs::remove_file(&part)?;
    }

    // Renumber job-local per-sentence files to global indices.
    for range in &ranges {
        for local in 0..range.len {
            let global = range.start + local;
            match mode {
                DecodeMode::Nbest { size } => {
                    let nb = ctx
                        .workdir
                        .join(format!("nbest.job{}.{:04}.{}best", range.job, local, size));
                    let ff = ctx.workdir.join(format!(
                        "nbest.job{}.{:04}.{}best.ffvals",
                        range.job, local, size
                    ));
                    rename_required(&nb, &ctx.nbest_file(global))?;
                    rename_required(&ff, &ctx.ffvals_file(global))?;
                }
                DecodeMode::Lattice { .. } => {
                    let lat = ctx
                        .workdir
                        .join(format!("lat.job{}.{:04}", range.job, local));
                    rename_required(&lat, &ctx.lattice_file(global))?;
                }
                DecodeMode::SentencesOnly => {}
            }
        }
        let _ = fs::remove_file(job_path(ctx, "src", range.job));
    }

    Ok(())
}

fn rename_required(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).with_context(|| {
        format!(
            "decoder did not produce expected output {} (renaming to {})",
            from.display(),
            to.display()
        )
    })
}

fn job_path(ctx: &RunContext, stem: &str, job: usize) -> PathBuf {
    ctx.workdir.join(format!("{}.job{}", stem, job))
}

/// Run the decoder for one sentence range and filter its raw stream to
/// job-local 1-best text.
fn decode_range(
    ctx: &RunContext,
    range: &JobRange,
    src_lines: &[String],
    mode: DecodeMode,
) -> Result<()> {
    let src_part = job_path(ctx, "src", range.job);
    {
        let mut f = File::create(&src_part)
            .with_context(|| format!("creating {}", src_part.display()))?;
        for line in &src_lines[range.start..range.start + range.len] {
            writeln!(f, "{}", line)?;
        }
    }

    let raw_part = job_path(ctx, "raw", range.job);
    let mut cmd = ToolCommand::new(DECODER_BIN)
        .arg("-v")
        .arg("1")
        .arg("-f")
        .arg(ctx.decode_config().display().to_string())
        .arg("-ffvals")
        .arg("-cpus")
        .arg(ctx.cpus_per_job.to_string());

    match mode {
        DecodeMode::Nbest { size } => {
            let prefix = ctx.workdir.join(format!("nbest.job{}", range.job));
            cmd = cmd
                .arg("-nbest")
                .arg(format!("{}:{}", prefix.display(), size));
        }
        DecodeMode::Lattice { density } => {
            let prefix = ctx.workdir.join(format!("lat.job{}", range.job));
            cmd = cmd
                .arg("-palign")
                .arg("-lattice")
                .arg(prefix.display().to_string());
            if density > 0.0 {
                cmd = cmd
                    .args(["-lattice-output-options", "overlay"])
                    .arg("-lattice-density")
                    .arg(density.to_string());
            }
        }
        DecodeMode::SentencesOnly => {}
    }
    cmd = cmd.args(ctx.decode_opts.iter().cloned());

    cmd.stdin_file(&src_part)
        .stdout_file(&raw_part)
        .run_logged(&ctx.decode_log(), ctx.verbose)?;

    // Extract 1-best text from the raw decoder stream.
    ToolCommand::new(ONEBEST_FILTER_BIN)
        .arg("-canoe")
        .stdin_file(&raw_part)
        .stdout_file(job_path(ctx, "out", range.job))
        .run_logged(&ctx.decode_log(), ctx.verbose)?;
    fs::remove_file(&raw_part)?;

    Ok(())
}

/// Parse and consume the per-sentence n-best/ffvals files produced by
/// the latest decode, returning one hypothesis list per sentence.
///
/// Lists are padded with blank lines up to the n-best size; a blank
/// line terminates the sentence's list. An empty list is valid. Any
/// disagreement between the paired files is fatal.
pub fn read_nbest_lists(
    ctx: &RunContext,
    n_sents: usize,
    feat_dim: usize,
) -> Result<Vec<Vec<Hypothesis>>> {
    let mut all = Vec::with_capacity(n_sents);
    for sent in 0..n_sents {
        let nb_path = ctx.nbest_file(sent);
        let ff_path = ctx.ffvals_file(sent);
        let hyps = parse_sentence_lists(&nb_path, &ff_path, sent, feat_dim)?;
        fs::remove_file(&nb_path)?;
        fs::remove_file(&ff_path)?;
        all.push(hyps);
    }
    Ok(all)
}

fn parse_sentence_lists(
    nb_path: &Path,
    ff_path: &Path,
    sent: usize,
    feat_dim: usize,
) -> Result<Vec<Hypothesis>> {
    let nb_text = fs::read_to_string(nb_path)
        .with_context(|| format!("missing n-best file {}", nb_path.display()))?;
    let ff_text = fs::read_to_string(ff_path)
        .with_context(|| format!("missing ffvals file {}", ff_path.display()))?;

    let mut hyps = Vec::new();
    let mut ff_lines = ff_text.lines();
    for nb_line in nb_text.lines() {
        let ff_line = match ff_lines.next() {
            Some(l) => l,
            None => bail!(
                "inconsistent n-best/ffvals files for sentence {}: {} is shorter",
                sent,
                ff_path.display()
            ),
        };
        // Lists are padded with blank lines; the first blank ends the list.
        if nb_line.trim().is_empty() {
            if !ff_line.trim().is_empty() {
                bail!(
                    "inconsistent n-best/ffvals files for sentence {}: padding disagrees",
                    sent
                );
            }
            break;
        }
        if ff_line.trim().is_empty() {
            bail!(
                "inconsistent n-best/ffvals files for sentence {}: padding disagrees",
                sent
            );
        }
        let feats = ff_line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>().with_context(|| {
                    format!("bad feature value {:?} in {}", tok, ff_path.display())
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if feats.len() != feat_dim {
            bail!(
                "feature dimension {} != weight dimension {} in {}",
                feats.len(),
                feat_dim,
                ff_path.display()
            );
        }
        hyps.push(Hypothesis {
            sent,
            text: nb_line.to_string(),
            feats,
            pal: None,
        });
    }
    Ok(hyps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ranges_even_split() {
        let r = job_ranges(10, 2);
        assert_eq!(r.len(), 2);
        assert_eq!((r[0].start, r[0].len), (0, 5));
        assert_eq!((r[1].start, r[1].len), (5, 5));
    }

    #[test]
    fn test_job_ranges_remainder_goes_first() {
        let r = job_ranges(7, 3);
        let lens: Vec<_> = r.iter().map(|x| x.len).collect();
        assert_eq!(lens, vec![3, 2, 2]);
        assert_eq!(r.iter().map(|x| x.len).sum::<usize>(), 7);
        // contiguous, in order
        assert_eq!(r[1].start, 3);
        assert_eq!(r[2].start, 5);
    }

    #[test]
    fn test_job_ranges_more_jobs_than_sentences() {
        let r = job_ranges(2, 8);
        assert_eq!(r.len(), 2);
        assert!(r.iter().all(|x| x.len == 1));
    }

    #[test]
    fn test_parse_sentence_lists_padding() {
        let dir = tempfile::tempdir().unwrap();
        let nb = dir.path().join("nb");
        let ff = dir.path().join("ff");
        fs::write(&nb, "the cat\na cat\n\n\n").unwrap();
        fs::write(&ff, "1.0 2.0\n1.5 0.5\n\n\n").unwrap();
        let hyps = parse_sentence_lists(&nb, &ff, 3, 2).unwrap();
        assert_eq!(hyps.len(), 2);
        assert_eq!(hyps[0].text, "the cat");
        assert_eq!(hyps[0].feats, vec![1.0, 2.0]);
        assert_eq!(hyps[1].sent, 3);
    }

    #[test]
    fn test_parse_sentence_lists_empty_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let nb = dir.path().join("nb");
        let ff = dir.path().join("ff");
        fs::write(&nb, "\n\n").unwrap();
        fs::write(&ff, "\n\n").unwrap();
        let hyps = parse_sentence_lists(&nb, &ff, 0, 2).unwrap();
        assert!(hyps.is_empty());
    }

    #[test]
    fn test_parse_sentence_lists_inconsistent_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let nb = dir.path().join("nb");
        let ff = dir.path().join("ff");
        fs::write(&nb, "the cat\na cat\n").unwrap();
        fs::write(&ff, "1.0 2.0\n").unwrap();
        let err = parse_sentence_lists(&nb, &ff, 0, 2).unwrap_err();
        assert!(format!("{:#}", err).contains("inconsistent"));
    }

    #[test]
    fn test_parse_sentence_lists_dimension_check() {
        let dir = tempfile::tempdir().unwrap();
        let nb = dir.path().join("nb");
        let ff = dir.path().join("ff");
        fs::write(&nb, "the cat\n").unwrap();
        fs::write(&ff, "1.0 2.0 3.0\n").unwrap();
        assert!(parse_sentence_lists(&nb, &ff, 0, 2).is_err());
    }
}
