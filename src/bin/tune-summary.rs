//! tune-summary: stability statistics over repeated tuning runs.
//!
//! Point it at one or more run directories, each holding the `summary`
//! history a tuning run appends to. Immediate subdirectories that also
//! hold a `summary` are treated as alternative runs of the same
//! configuration, and scores are aggregated across them.
//!
//! ```bash
//! # Average main + alternative runs, with std deviations
//! tune-summary --mode avg runs/baseline runs/bigger-lm
//!
//! # Trimmed mean (needs at least 4 runs per configuration)
//! tune-summary --mode trimmed runs/*
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use owo_colors::OwoColorize;

use tuneloop::stability::{summarize, Mode, RunScores};

/// Summarize tuning runs and their stability across repeats
#[derive(Parser, Debug)]
#[command(name = "tune-summary")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Run directories to summarize (each containing a `summary` file)
    #[arg(value_name = "DIR", required = true)]
    dirs: Vec<PathBuf>,

    /// Aggregation across alternative runs: avg, trimmed, or max
    #[arg(long, default_value = "avg")]
    mode: String,

    /// Decimal places for scores
    #[arg(short = 'p', long, default_value_t = 2)]
    precision: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mode = Mode::parse(&cli.mode)?;

    let mut rows = Vec::new();
    for dir in &cli.dirs {
        if !dir.is_dir() {
            bail!("{} is not a directory", dir.display());
        }
        let history = dir.join("summary");
        if !history.is_file() {
            eprintln!(
                "Warning: {} doesn't look like a tuning run (no summary file)",
                dir.display()
            );
            continue;
        }
        let main = RunScores::from_history_file(dir.display().to_string(), &history)?;

        let mut alts = Vec::new();
        for entry in fs::read_dir(dir)? {
            let sub = entry?.path();
            let alt_history = sub.join("summary");
            if sub.is_dir() && alt_history.is_file() {
                alts.push(RunScores::from_history_file(
                    sub.display().to_string(),
                    &alt_history,
                )?);
            }
        }

        let summary = summarize(&main, &alts, mode, &[0]);
        rows.push((dir.display().to_string(), summary));
    }

    if rows.is_empty() {
        bail!("no tuning runs found");
    }

    // Best configuration first.
    rows.sort_by(|a, b| {
        let sa = a.1.scores[0].unwrap_or(f64::NEG_INFINITY);
        let sb = b.1.scores[0].unwrap_or(f64::NEG_INFINITY);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });

    for (name, summary) in &rows {
        for w in &summary.warnings {
            eprintln!("Warning: {}", w);
        }
        match summary.scores[0] {
            Some(s) => println!(
                "{:>8.prec$}  {}  ({} run{}, {} mode, sdev {:.4})",
                s * 100.0,
                name.bold(),
                summary.n_runs,
                if summary.n_runs == 1 { "" } else { "s" },
                summary.mode_applied,
                summary.criterion_sdev * 100.0,
                prec = cli.precision,
            ),
            None => println!("{:>8}  {}  (no score)", "-", name),
        }
    }
    Ok(())
}
