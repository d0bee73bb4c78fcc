//! Terminal run-progress display.
//!
//! Records one data point per iteration and renders a compact colored
//! summary with Unicode sparklines at the end of the run, so the shape
//! of the optimization (climbing, plateaued, oscillating) is visible
//! at a glance without opening the history files.

use owo_colors::OwoColorize;

/// Per-iteration trace of the run, for display only.
pub struct TuneProgress {
    score_history: Vec<f64>,
    novel_history: Vec<Option<usize>>,
    delta_history: Vec<f64>,
}

impl TuneProgress {
    pub fn new() -> Self {
        Self {
            score_history: Vec::new(),
            novel_history: Vec::new(),
            delta_history: Vec::new(),
        }
    }

    /// Record one iteration: decode score, novel-hypothesis count (if
    /// the strategy aggregates), mean weight delta.
    pub fn record(&mut self, score: f64, novel: Option<usize>, delta: f64) {
        self.score_history.push(score);
        self.novel_history.push(novel);
        self.delta_history.push(delta);
    }

    pub fn iterations(&self) -> usize {
        self.score_history.len()
    }

    /// Render sparkline from values.
    fn sparkline(values: &[f64], width: usize) -> String {
        if values.is_empty() {
            return " ".repeat(width);
        }

        let chars = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let range = (max - min).max(0.001);

        let n = values.len().min(width);
        (0..n)
            .map(|i| {
                let idx = i * values.len() / n;
                let t = (values[idx] - min) / range;
                let level = ((t * 7.0).round() as usize).min(7);
                chars[level]
            })
            .collect()
    }

    /// Print the end-of-run summary.
    pub fn print_summary(&self, best_iter: usize, best_score: f64) {
        println!();
        println!("{}", " TUNING COMPLETE ".bold().on_green());
        println!();

        if let (Some(first), Some(last)) =
            (self.score_history.first(), self.score_history.last())
        {
            let arrow = if last >= first { "↑".green().to_string() } else { "↓".red().to_string() };
            println!(
                "  {}: {:.4} {} {:.4}  (best {:.4} at iter {})",
                "BLEU".bold(),
                first,
                arrow,
                last,
                best_score,
                best_iter + 1
            );
            println!("          [{}]", Self::sparkline(&self.score_history, 40).cyan());
        }

        let novel: Vec<f64> = self
            .novel_history
            .iter()
            .filter_map(|n| n.map(|v| v as f64))
            .collect();
        if !novel.is_empty() {
            println!(
                "  {}: {} → {}",
                "novel hyps".bold(),
                novel.first().map(|v| *v as usize).unwrap_or(0),
                novel.last().map(|v| *v as usize).unwrap_or(0),
            );
            println!("          [{}]", Self::sparkline(&novel, 40).cyan());
        }

        if self.delta_history.len() > 1 {
            println!(
                "  {}: {:.4} → {:.4}",
                "wt delta".bold(),
                self.delta_history.first().unwrap_or(&0.0),
                self.delta_history.last().unwrap_or(&0.0),
            );
            println!("          [{}]", Self::sparkline(&self.delta_history, 40).cyan());
        }
        println!();
    }
}

impl Default for TuneProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparkline_shape() {
        let line = TuneProgress::sparkline(&[0.0, 0.5, 1.0], 3);
        assert_eq!(line.chars().count(), 3);
        assert_eq!(line.chars().next(), Some('▁'));
        assert_eq!(line.chars().last(), Some('█'));
    }

    #[test]
    fn test_sparkline_empty() {
        assert_eq!(TuneProgress::sparkline(&[], 5), "     ");
    }

    #[test]
    fn test_record_keeps_histories_parallel() {
        let mut p = TuneProgress::new();
        p.record(0.2, Some(100), 0.0);
        p.record(0.25, None, 0.1);
        assert_eq!(p.iterations(), 2);
        assert_eq!(p.novel_history[1], None);
    }
}
