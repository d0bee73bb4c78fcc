//! Corpus BLEU scoring via the external evaluation tools.
//!
//! Two adapters, both fatal on tool failure:
//! - `bleu_file`: corpus-level BLEU of a candidate file against the
//!   references, scraped from the tool's "BLEU score" line. Used on the
//!   1-best output every iteration; this score drives best-iteration
//!   tracking and is independent of whatever internal objective the
//!   optimizer reports.
//! - `nbest_bleu_table`: sentence-smoothed BLEU for every accumulated
//!   hypothesis, written as a `<sent> <bleu>` table. The batch n-best
//!   learners (MIRA/PRO/SVM/expected-BLEU) consume it as their label
//!   column; the Powell and lattice strategies never need it.

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::context::RunContext;
use crate::external::{ToolCommand, BLEU_BIN, NBEST_BLEU_BIN};

static BLEU_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^BLEU score:?\s+([\d.]+)").unwrap());

/// Corpus-level BLEU of `candidate` against the run's references,
/// in [0, 1].
pub fn bleu_file(ctx: &RunContext, candidate: &std::path::Path) -> Result<f64> {
    let mut cmd = ToolCommand::new(BLEU_BIN)
        .arg("-y")
        .arg(ctx.bleu_order.to_string())
        .arg(candidate.display().to_string());
    for r in &ctx.refs {
        cmd = cmd.arg(r.display().to_string());
    }
    let out = cmd.capture(&ctx.eval_log(), ctx.verbose)?;

    let mut score = None;
    for line in out.lines() {
        ctx.log_line(&ctx.eval_log(), line)?;
        if let Some(cap) = BLEU_LINE.captures(line) {
            score = Some(cap[1].parse::<f64>().with_context(|| {
                format!("unparsable BLEU token in line {:?}", line)
            })?);
        }
    }
    match score {
        Some(s) => Ok(s),
        None => bail!("no BLEU score line in {} output", BLEU_BIN),
    }
}

/// Compute per-hypothesis BLEU over the cumulative n-best file and
/// write the `<sent> <bleu>` table the batch learners read.
///
/// The oracle tool emits one `<sent> <smoothed> <oracle>` line per
/// hypothesis; the smoothed sentence-level column is kept.
pub fn nbest_bleu_table(ctx: &RunContext) -> Result<()> {
    let mut cmd = ToolCommand::new(NBEST_BLEU_BIN)
        .arg("-y")
        .arg(ctx.bleu_order.to_string())
        .args(["-dyn", "-o", "nbest"])
        .arg(ctx.all_nbests().display().to_string());
    for r in &ctx.refs {
        cmd = cmd.arg(r.display().to_string());
    }
    let out = cmd.capture(&ctx.eval_log(), ctx.verbose)?;

    let table_path = ctx.all_bleus();
    let mut table = BufWriter::new(
        File::create(&table_path)
            .with_context(|| format!("creating {}", table_path.display()))?,
    );
    for line in out.lines() {
        if line.is_empty() {
            continue;
        }
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() != 3 {
            bail!(
                "unexpected {} output line (want `sent smoothed oracle`): {:?}",
                NBEST_BLEU_BIN,
                line
            );
        }
        writeln!(table, "{} {}", toks[0], toks[1])?;
    }
    table.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bleu_line_pattern() {
        let cap = BLEU_LINE.captures("BLEU score: 0.2345 (something)").unwrap();
        assert_eq!(&cap[1], "0.2345");
        // tolerate the colon-free variant
        let cap = BLEU_LINE.captures("BLEU score 0.5").unwrap();
        assert_eq!(&cap[1], "0.5");
        assert!(BLEU_LINE.captures("Other score: 0.5").is_none());
    }
}
