//! External tool adapters: process invocation and log scraping.
//!
//! Every interaction with the outside toolchain goes through this module,
//! so the controller and aggregator never see raw tool output. The
//! boundary is deliberately thin:
//! - `ToolCommand` runs a process with stdout/stderr tee'd into a
//!   component log and turns a non-zero exit into a fatal error naming
//!   the full command line. There is no retry - a failed external call
//!   leaves weight state unknowable, so the whole run aborts.
//! - `scrape_last_score` pulls the last regex-captured score out of a
//!   log file; each optimizer algorithm owns exactly one pattern.
//! - Model-file helpers translate between weight vectors and the
//!   one-feature-per-line model format the external learners speak.
//!
//! We spawn processes directly instead of going through a shell: no
//! quoting surprises, and the failing command can be reported verbatim.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::types::WeightVector;

/// External decoder binary.
pub const DECODER_BIN: &str = "canoe";
/// Decoder-config weight bridge.
pub const CONFIGTOOL_BIN: &str = "configtool";
/// Corpus-level BLEU tool.
pub const BLEU_BIN: &str = "bleumain";
/// Per-hypothesis oracle BLEU tool.
pub const NBEST_BLEU_BIN: &str = "bestbleu";
/// Powell-family line-search trainer.
pub const POWELL_BIN: &str = "rescore_train";
/// 1-best extraction filter for raw decoder output.
pub const ONEBEST_FILTER_BIN: &str = "nbest2rescore.pl";

/// A single external tool invocation.
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    stdin_file: Option<PathBuf>,
    stdin_data: Option<String>,
    stdout_file: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin_file: None,
            stdin_data: None,
            stdout_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed the process a file on stdin.
    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    /// Feed the process a string on stdin.
    pub fn stdin_data(mut self, data: impl Into<String>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    /// Redirect stdout to a file instead of the log.
    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    /// The command line as it would be typed, for logs and errors.
    pub fn render(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }

    /// Run to completion, appending the command line and all tool output
    /// to `log`. Non-zero exit or spawn failure is fatal.
    pub fn run_logged(self, log: &Path, verbose: bool) -> Result<()> {
        let rendered = self.render();
        append_line(log, &rendered)?;
        if verbose {
            eprintln!("{}", rendered);
        }

        let logfile = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .with_context(|| format!("opening log {}", log.display()))?;
        let errfile = logfile
            .try_clone()
            .with_context(|| format!("duplicating log handle {}", log.display()))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stderr(Stdio::from(errfile));

        match &self.stdout_file {
            Some(path) => {
                let out = File::create(path)
                    .with_context(|| format!("creating {}", path.display()))?;
                cmd.stdout(Stdio::from(out));
            }
            None => {
                cmd.stdout(Stdio::from(logfile));
            }
        }

        if let Some(path) = &self.stdin_file {
            let f = File::open(path)
                .with_context(|| format!("opening stdin file {}", path.display()))?;
            cmd.stdin(Stdio::from(f));
        } else if self.stdin_data.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("command not found or not runnable: {}", rendered))?;

        if let Some(data) = &self.stdin_data {
            if let Some(mut sin) = child.stdin.take() {
                sin.write_all(data.as_bytes())
                    .with_context(|| format!("writing stdin of: {}", rendered))?;
            }
        }

        let status = child
            .wait()
            .with_context(|| format!("waiting for: {}", rendered))?;
        if !status.success() {
            bail!("command failed ({}): {}", status, rendered);
        }
        Ok(())
    }

    /// Run to completion and return captured stdout; stderr goes to the
    /// log. Non-zero exit is fatal.
    pub fn capture(self, log: &Path, verbose: bool) -> Result<String> {
        let rendered = self.render();
        append_line(log, &rendered)?;
        if verbose {
            eprintln!("{}", rendered);
        }

        let errfile = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .with_context(|| format!("opening log {}", log.display()))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stderr(Stdio::from(errfile))
            .stdout(Stdio::piped());

        if let Some(path) = &self.stdin_file {
            let f = File::open(path)
                .with_context(|| format!("opening stdin file {}", path.display()))?;
            cmd.stdin(Stdio::from(f));
        } else {
            cmd.stdin(Stdio::null());
        }

        let output = cmd
            .output()
            .with_context(|| format!("command not found or not runnable: {}", rendered))?;
        if !output.status.success() {
            bail!("command failed ({}): {}", output.status, rendered);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log {}", path.display()))?;
    writeln!(f, "{}", line)?;
    Ok(())
}

/// Extract the last score a regex captures in a log file.
///
/// Each optimizer reports progress lines to its log; the last match is
/// the final answer. No match at all means the tool did not run to a
/// usable state, which is fatal.
pub fn scrape_last_score(log: &Path, re: &Regex) -> Result<f64> {
    let mut text = String::new();
    File::open(log)
        .with_context(|| format!("opening optimizer log {}", log.display()))?
        .read_to_string(&mut text)?;
    let last = text
        .lines()
        .filter_map(|line| re.captures(line))
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .last();
    match last {
        Some(tok) => tok
            .parse::<f64>()
            .with_context(|| format!("unparsable score token {:?} in {}", tok, log.display())),
        None => bail!(
            "no score matching {:?} found in optimizer log {}",
            re.as_str(),
            log.display()
        ),
    }
}

/// Read a model file: one `name weight` pair per line, any whitespace.
pub fn read_model(path: &Path) -> Result<WeightVector> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading model file {}", path.display()))?;
    let mut wts = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut toks = line.split_whitespace();
        let name = toks.next();
        let weight = toks.next();
        match (name, weight) {
            (Some(_), Some(w)) => {
                let w = w.parse::<f64>().with_context(|| {
                    format!("bad weight at {}:{}", path.display(), lineno + 1)
                })?;
                wts.push(w);
            }
            _ => bail!(
                "malformed model line at {}:{}: {:?}",
                path.display(),
                lineno + 1,
                line
            ),
        }
    }
    WeightVector::new(wts)
        .with_context(|| format!("model file {} holds no weights", path.display()))
}

/// Write a model file in the same `name weight` format.
pub fn write_model(path: &Path, names: &[String], weights: &WeightVector) -> Result<()> {
    let mut out = String::new();
    for (name, w) in names.iter().zip(weights.as_slice()) {
        out.push_str(name);
        out.push(' ');
        out.push_str(&w.to_string());
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("writing model file {}", path.display()))
}

/// Read the feature names (first column) of a model file, preserving order.
pub fn read_model_names(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading model file {}", path.display()))?;
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| l.split_whitespace().next())
        .map(|s| s.to_string())
        .collect())
}

/// Extract the weight vector from a decoder configuration by querying
/// the external config tool.
pub fn weights_from_config(config: &Path, log: &Path, verbose: bool) -> Result<WeightVector> {
    let out = ToolCommand::new(CONFIGTOOL_BIN)
        .arg("rescore-model:x")
        .arg(config.display().to_string())
        .capture(log, verbose)?;
    // Output alternates "x <weight>" tokens; keep every second token.
    let wts = out
        .split_whitespace()
        .skip(1)
        .step_by(2)
        .map(|tok| {
            tok.parse::<f64>()
                .with_context(|| format!("bad weight token {:?} from {}", tok, CONFIGTOOL_BIN))
        })
        .collect::<Result<Vec<_>>>()?;
    WeightVector::new(wts)
        .with_context(|| format!("no weights found in decoder config {}", config.display()))
}

/// Write a decoder configuration carrying `weights`, derived from the
/// base configuration.
pub fn weights_to_config(
    weights: &WeightVector,
    base: &Path,
    out: &Path,
    log: &Path,
    verbose: bool,
) -> Result<()> {
    let mut stdin = String::new();
    for w in weights.as_slice() {
        stdin.push_str("x ");
        stdin.push_str(&w.to_string());
        stdin.push('\n');
    }
    ToolCommand::new(CONFIGTOOL_BIN)
        .arg("set-weights-rm:-")
        .arg(base.display().to_string())
        .arg(out.display().to_string())
        .stdin_data(stdin)
        .run_logged(log, verbose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    static SCORE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"Best BLEU found on it# \d+, score ([\d.]+)").unwrap());

    #[test]
    fn test_scrape_last_score() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.optimize");
        fs::write(
            &log,
            "starting\n\
             Best BLEU found on it# 1, score 0.21\n\
             noise line\n\
             Best BLEU found on it# 7, score 0.305\n",
        )
        .unwrap();
        let score = scrape_last_score(&log, &SCORE_RE).unwrap();
        assert!((score - 0.305).abs() < 1e-12);
    }

    #[test]
    fn test_scrape_missing_score_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.optimize");
        fs::write(&log, "nothing useful\n").unwrap();
        assert!(scrape_last_score(&log, &SCORE_RE).is_err());
    }

    #[test]
    fn test_model_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");
        let names = vec!["lm".to_string(), "tm".to_string(), "wp".to_string()];
        let wts = WeightVector::new(vec![0.5, -1.25, 3.0]).unwrap();
        write_model(&path, &names, &wts).unwrap();
        assert_eq!(read_model(&path).unwrap(), wts);
        assert_eq!(read_model_names(&path).unwrap(), names);
    }

    #[test]
    fn test_model_whitespace_tolerant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");
        fs::write(&path, "lm\t0.5\n\ntm   -1.0\n").unwrap();
        let wts = read_model(&path).unwrap();
        assert_eq!(wts.as_slice(), &[0.5, -1.0]);
    }

    #[test]
    fn test_malformed_model_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");
        fs::write(&path, "lonely-token\n").unwrap();
        assert!(read_model(&path).is_err());
    }

    #[test]
    fn test_failed_command_reports_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let err = ToolCommand::new("tuneloop-no-such-binary")
            .arg("--flag")
            .run_logged(&log, false)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("tuneloop-no-such-binary --flag"));
    }
}
