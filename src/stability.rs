//! Stability statistics over repeated alternative tuning runs.
//!
//! Decoder tuning is stochastic: rerunning the same configuration with
//! different seeds moves the final BLEU by a few tenths. To report a
//! configuration honestly, a main run can be accompanied by alternative
//! runs and summarized across them, per test set:
//!
//! | Mode    | Behaviour                                               |
//! |---------|---------------------------------------------------------|
//! | avg     | arithmetic mean + sample std deviation                  |
//! | trimmed | drop min and max, then mean; needs >= 4 runs            |
//! | max     | report the best run's scores wholesale (no averaging)   |
//!
//! The std deviation formula is the sample one (divide by n), not the
//! population estimator (n-1). A `trimmed` request with fewer than 4
//! runs falls back to `avg` with a one-time warning. A run missing a
//! score for some test set is warned about and excluded from that
//! test's statistics only. Recorded scores are never mutated; every
//! summary is derived.

use std::path::Path;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::history;

/// Scores one run achieved, one slot per test set. `None` marks a
/// missing result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunScores {
    pub name: String,
    pub scores: Vec<Option<f64>>,
}

impl RunScores {
    pub fn new(name: impl Into<String>, scores: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            scores,
        }
    }

    /// Read a run's dev score from its iteration history: the best
    /// decode score over all completed iterations.
    pub fn from_history_file(name: impl Into<String>, path: &Path) -> Result<Self> {
        let scores = history::read_decode_scores(path)?;
        let best = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let slot = if scores.is_empty() { None } else { Some(best) };
        Ok(Self {
            name: name.into(),
            scores: vec![slot],
        })
    }

    /// Average over the test sets selected by `indexes`; `None` if any
    /// selected slot is missing.
    fn criterion_avg(&self, indexes: &[usize]) -> Option<f64> {
        if indexes.is_empty() {
            return None;
        }
        let mut sum = 0.0;
        for &i in indexes {
            sum += self.scores.get(i).copied().flatten()?;
        }
        Some(sum / indexes.len() as f64)
    }
}

/// Aggregation mode across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Avg,
    Trimmed,
    Max,
}

impl Mode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "avg" => Ok(Self::Avg),
            "trimmed" => Ok(Self::Trimmed),
            "max" => Ok(Self::Max),
            other => bail!("unknown stability mode: {:?} (expected avg, trimmed, or max)", other),
        }
    }
}

/// Derived cross-run summary.
#[derive(Debug, Clone, Serialize)]
pub struct StabilitySummary {
    /// Mode actually applied (after any fallback)
    pub mode_applied: &'static str,
    /// Per-test aggregated score; `None` where the main run had none
    pub scores: Vec<Option<f64>>,
    /// Per-test sample std deviation across contributing runs
    pub sdevs: Vec<Option<f64>>,
    /// Std deviation of the per-run criterion averages
    pub criterion_sdev: f64,
    /// Runs contributing (main + alternatives)
    pub n_runs: usize,
    /// Warnings emitted while summarizing
    pub warnings: Vec<String>,
}

/// Summarize the main run and its alternatives under `mode`.
///
/// `criterion` selects the test-set indexes whose average ranks runs
/// in `max` mode and feeds the criterion deviation.
pub fn summarize(
    main: &RunScores,
    alts: &[RunScores],
    mode: Mode,
    criterion: &[usize],
) -> StabilitySummary {
    let n_runs = 1 + alts.len();
    let mut warnings = Vec::new();

    let mode = if mode == Mode::Trimmed && n_runs < 4 {
        warnings.push(format!(
            "trimmed mean requested with only {} run(s); falling back to avg",
            n_runs
        ));
        Mode::Avg
    } else {
        mode
    };

    let summary = match mode {
        Mode::Avg => averaged(main, alts, false, &mut warnings),
        Mode::Trimmed => averaged(main, alts, true, &mut warnings),
        Mode::Max => best_run(main, alts, criterion, &mut warnings),
    };

    let criterion_sdev = criterion_deviation(main, alts, criterion);

    StabilitySummary {
        mode_applied: match mode {
            Mode::Avg => "avg",
            Mode::Trimmed => "trimmed",
            Mode::Max => "max",
        },
        scores: summary.0,
        sdevs: summary.1,
        criterion_sdev,
        n_runs,
        warnings,
    }
}

type PerTest = (Vec<Option<f64>>, Vec<Option<f64>>);

fn averaged(
    main: &RunScores,
    alts: &[RunScores],
    trim: bool,
    warnings: &mut Vec<String>,
) -> PerTest {
    let n_tests = main.scores.len();
    let mut scores = Vec::with_capacity(n_tests);
    let mut sdevs = Vec::with_capacity(n_tests);

    for t in 0..n_tests {
        let Some(main_score) = main.scores[t] else {
            // The main run never saw this test set; nothing to average.
            scores.push(None);
            sdevs.push(None);
            continue;
        };

        let mut values = vec![main_score];
        for alt in alts {
            match alt.scores.get(t).copied().flatten() {
                Some(s) => values.push(s),
                None => warnings.push(format!(
                    "alternative run {} is missing a score for test {}; excluded",
                    alt.name, t
                )),
            }
        }

        if trim && values.len() >= 4 {
            // Drop one min and one max occurrence.
            let (mut min_i, mut max_i) = (0, 0);
            for (i, v) in values.iter().enumerate() {
                if *v < values[min_i] {
                    min_i = i;
                }
                if *v > values[max_i] {
                    max_i = i;
                }
            }
            let mut keep = Vec::with_capacity(values.len() - 2);
            for (i, v) in values.iter().enumerate() {
                if i != min_i && i != max_i {
                    keep.push(*v);
                }
            }
            values = keep;
        }

        scores.push(Some(mean(&values)));
        sdevs.push(Some(sample_sdev(&values)));
    }

    (scores, sdevs)
}

fn best_run(
    main: &RunScores,
    alts: &[RunScores],
    criterion: &[usize],
    warnings: &mut Vec<String>,
) -> PerTest {
    let mut best = main;
    let mut best_avg = main.criterion_avg(criterion);
    for alt in alts {
        let avg = alt.criterion_avg(criterion);
        match (avg, best_avg) {
            (Some(a), Some(b)) if a > b => {
                best = alt;
                best_avg = Some(a);
            }
            (Some(_), None) => {
                best = alt;
                best_avg = avg;
            }
            (None, _) => warnings.push(format!(
                "run {} lacks the full sort criterion; not eligible for max",
                alt.name
            )),
            _ => {}
        }
    }
    // Substitute the winner's scores wholesale; deviations do not apply.
    let n_tests = main.scores.len();
    let mut scores = best.scores.clone();
    scores.resize(n_tests, None);
    (scores, vec![None; n_tests])
}

fn criterion_deviation(main: &RunScores, alts: &[RunScores], criterion: &[usize]) -> f64 {
    let mut avgs = Vec::new();
    for run in std::iter::once(main).chain(alts.iter()) {
        if let Some(a) = run.criterion_avg(criterion) {
            avgs.push(a);
        }
    }
    if avgs.is_empty() {
        0.0
    } else {
        sample_sdev(&avgs)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation: sqrt(E[x^2] - E[x]^2), dividing by n.
fn sample_sdev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| v * v).sum::<f64>() / n - mean * mean;
    var.max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(name: &str, scores: &[f64]) -> RunScores {
        RunScores::new(name, scores.iter().map(|&s| Some(s)).collect())
    }

    #[test]
    fn test_avg_mode_mean_and_sdev() {
        let main = run("main", &[0.10]);
        let alts = vec![run("a1", &[0.30]), run("a2", &[0.20])];
        let s = summarize(&main, &alts, Mode::Avg, &[0]);
        assert!((s.scores[0].unwrap() - 0.20).abs() < 1e-12);
        // sample deviation over {0.10, 0.30, 0.20}
        assert!((s.sdevs[0].unwrap() - 0.081649658).abs() < 1e-6);
        assert_eq!(s.mode_applied, "avg");
    }

    #[test]
    fn test_trimmed_fallback_below_four_runs() {
        let main = run("main", &[0.10]);
        let alts = vec![run("a1", &[0.30]), run("a2", &[0.20])];
        let s = summarize(&main, &alts, Mode::Trimmed, &[0]);
        assert_eq!(s.mode_applied, "avg");
        assert!((s.scores[0].unwrap() - 0.20).abs() < 1e-12);
        assert!((s.sdevs[0].unwrap() - 0.0816).abs() < 1e-3);
        assert!(s.warnings.iter().any(|w| w.contains("falling back")));
    }

    #[test]
    fn test_trimmed_drops_extremes() {
        let main = run("main", &[0.10]);
        let alts = vec![
            run("a1", &[0.40]),
            run("a2", &[0.20]),
            run("a3", &[0.30]),
        ];
        let s = summarize(&main, &alts, Mode::Trimmed, &[0]);
        assert_eq!(s.mode_applied, "trimmed");
        // 0.10 and 0.40 dropped; mean of {0.20, 0.30}
        assert!((s.scores[0].unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_max_mode_substitutes_wholesale() {
        let main = run("main", &[0.20, 0.50]);
        let alts = vec![run("a1", &[0.30, 0.10]), run("a2", &[0.25, 0.40])];
        // criterion: test 0 only -> a1 wins, and its test-1 score comes
        // along even though it is the worst one.
        let s = summarize(&main, &alts, Mode::Max, &[0]);
        assert_eq!(s.mode_applied, "max");
        assert_eq!(s.scores[0], Some(0.30));
        assert_eq!(s.scores[1], Some(0.10));
        assert!(s.sdevs.iter().all(|d| d.is_none()));
    }

    #[test]
    fn test_missing_alt_score_warns_and_excludes() {
        let main = run("main", &[0.20]);
        let alts = vec![
            RunScores::new("gappy", vec![None]),
            run("ok", &[0.40]),
        ];
        let s = summarize(&main, &alts, Mode::Avg, &[0]);
        // mean over {0.20, 0.40} only
        assert!((s.scores[0].unwrap() - 0.30).abs() < 1e-12);
        assert!(s.warnings.iter().any(|w| w.contains("gappy")));
    }

    #[test]
    fn test_inputs_never_mutated() {
        let main = run("main", &[0.20]);
        let alts = vec![run("a1", &[0.40])];
        let main_before = main.scores.clone();
        let _ = summarize(&main, &alts, Mode::Avg, &[0]);
        assert_eq!(main.scores, main_before);
    }

    #[test]
    fn test_criterion_sdev_across_runs() {
        let main = run("main", &[0.10]);
        let alts = vec![run("a1", &[0.30])];
        let s = summarize(&main, &alts, Mode::Avg, &[0]);
        // sample sdev of {0.10, 0.30} = 0.10
        assert!((s.criterion_sdev - 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(Mode::parse("avg").unwrap(), Mode::Avg);
        assert_eq!(Mode::parse("trimmed").unwrap(), Mode::Trimmed);
        assert_eq!(Mode::parse("max").unwrap(), Mode::Max);
        assert!(Mode::parse("median").is_err());
    }
}
