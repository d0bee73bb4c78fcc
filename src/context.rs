//! Run context: working-directory layout and tuning knobs.
//!
//! Every component receives an explicit `&RunContext` instead of consulting
//! ambient state. The context owns the path layout of a run:
//!
//! ```text
//! <workdir>/
//!   out                    1-best decoder output for the current iteration
//!   allnbests              cumulative deduplicated n-best lists
//!   allffvals              cumulative feature values, parallel to allnbests
//!   allbleus               per-hypothesis BLEU table for batch learners
//!   nbest.NNNN.<K>best     per-sentence n-best list (deleted after merge)
//!   nbest.NNNN.<K>best.ffvals
//!   lat.NNNN               per-sentence lattice (lattice strategies)
//!   curmodel.ini           optimizer model-in
//!   curmodel0.ini          optimizer model-in seeded with initial weights
//!   curmodel.out           optimizer model-out
//!   powellwts.N            per-iteration Powell weight record
//!   hypmem.txt             lattice hypothesis memory
//! logs/
//!   log.decode log.eval log.aggregate log.optimize
//! summary / summary.wts    append-only iteration history (outside workdir)
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

/// All knobs and paths for one tuning run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Working directory for decode/optimize scratch files
    pub workdir: PathBuf,
    /// Directory for per-component log files
    pub logdir: PathBuf,
    /// Source corpus file
    pub src: PathBuf,
    /// One or more reference translation files, line-parallel with `src`
    pub refs: Vec<PathBuf>,
    /// Initial decoder configuration (weights come from here)
    pub base_config: PathBuf,
    /// N-best list size requested from the decoder
    pub nbest_size: usize,
    /// Number of parallel decoding jobs
    pub parallel_jobs: usize,
    /// CPUs handed to each decoding job
    pub cpus_per_job: usize,
    /// Extra options passed through to the decoder verbatim
    pub decode_opts: Vec<String>,
    /// Base seed; each optimizer call derives seed * 10000 + iter
    pub seed: u64,
    /// N-gram order for BLEU (only the MIRA family accepts != 4)
    pub bleu_order: u32,
    /// Lattice density pruning (< 0 disables pruning)
    pub density: f64,
    /// Path to the external learner jar
    pub jar: PathBuf,
    /// Java heap size in MB for the external learners
    pub java_mem_mb: u32,
    /// Disable cumulative n-best aggregation (keep only latest lists)
    pub no_aggregate: bool,
    /// Echo external command lines to stderr
    pub verbose: bool,
    /// Directory for the run history files (the run's own directory,
    /// not the scratch workdir, so history survives `--clean`)
    pub history_dir: PathBuf,
}

impl RunContext {
    /// Create workdir and logdir, and truncate log and history files.
    ///
    /// An existing workdir is reused with a warning - its contents will
    /// be overwritten as the run proceeds.
    pub fn init(&self) -> Result<()> {
        if self.workdir.exists() {
            eprintln!(
                "Warning: work directory {} already exists - will overwrite contents",
                self.workdir.display()
            );
        } else {
            fs::create_dir_all(&self.workdir)
                .with_context(|| format!("creating workdir {}", self.workdir.display()))?;
        }
        fs::create_dir_all(&self.logdir)
            .with_context(|| format!("creating logdir {}", self.logdir.display()))?;
        for path in [
            self.decode_log(),
            self.eval_log(),
            self.aggregate_log(),
            self.optimize_log(),
            self.history_file(),
            self.weight_history_file(),
            self.all_nbests(),
            self.all_ffvals(),
        ] {
            File::create(&path)
                .with_context(|| format!("initializing {}", path.display()))?;
        }
        Ok(())
    }

    /// Append one line to a log file, creating it if needed.
    pub fn log_line(&self, path: &Path, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log {}", path.display()))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    // === workdir files ===

    pub fn decoder_1best(&self) -> PathBuf {
        self.workdir.join("out")
    }

    pub fn all_nbests(&self) -> PathBuf {
        self.workdir.join("allnbests")
    }

    pub fn all_ffvals(&self) -> PathBuf {
        self.workdir.join("allffvals")
    }

    pub fn all_bleus(&self) -> PathBuf {
        self.workdir.join("allbleus")
    }

    /// Per-sentence n-best list written by the decode dispatcher.
    pub fn nbest_file(&self, sent: usize) -> PathBuf {
        self.workdir
            .join(format!("nbest.{:04}.{}best", sent, self.nbest_size))
    }

    /// Per-sentence feature values, parallel to `nbest_file`.
    pub fn ffvals_file(&self, sent: usize) -> PathBuf {
        self.workdir
            .join(format!("nbest.{:04}.{}best.ffvals", sent, self.nbest_size))
    }

    /// Per-sentence lattice written in lattice decode mode.
    pub fn lattice_file(&self, sent: usize) -> PathBuf {
        self.workdir.join(format!("lat.{:04}", sent))
    }

    pub fn optimizer_model_in(&self) -> PathBuf {
        self.workdir.join("curmodel.ini")
    }

    pub fn optimizer_model_in0(&self) -> PathBuf {
        self.workdir.join("curmodel0.ini")
    }

    pub fn optimizer_model_out(&self) -> PathBuf {
        self.workdir.join("curmodel.out")
    }

    /// Powell weight record for the given iteration.
    pub fn powell_wts(&self, iter: usize) -> PathBuf {
        self.workdir.join(format!("powellwts.{}", iter))
    }

    /// Lattice hypothesis-memory file for the lattice MIRA strategy.
    pub fn hyp_mem(&self) -> PathBuf {
        self.workdir.join("hypmem.txt")
    }

    /// Decoder configuration written fresh each iteration.
    pub fn decode_config(&self) -> PathBuf {
        self.workdir.join("decode-config")
    }

    // === logs and history ===

    pub fn decode_log(&self) -> PathBuf {
        self.logdir.join("log.decode")
    }

    pub fn eval_log(&self) -> PathBuf {
        self.logdir.join("log.eval")
    }

    pub fn aggregate_log(&self) -> PathBuf {
        self.logdir.join("log.aggregate")
    }

    pub fn optimize_log(&self) -> PathBuf {
        self.logdir.join("log.optimize")
    }

    /// Append-only per-iteration history (one summary line per iteration).
    pub fn history_file(&self) -> PathBuf {
        self.history_dir.join("summary")
    }

    /// Weight-vector history, line-parallel with the history file.
    pub fn weight_history_file(&self) -> PathBuf {
        self.history_dir.join("summary.wts")
    }

    /// Annotate a workdir file name with iteration and shard numbers,
    /// e.g. `mira.model.i03.s07`. `iter` of `None` produces the
    /// iteration-independent form `mira.model.ixx.s07`; likewise for
    /// `shard`.
    pub fn shard_tag(&self, name: &str, iter: Option<usize>, shard: Option<usize>) -> PathBuf {
        let it = match iter {
            Some(i) => format!("{:02}", i),
            None => "xx".to_string(),
        };
        let sh = match shard {
            Some(s) => format!("{:02}", s),
            None => "xx".to_string(),
        };
        self.workdir.join(format!("{}.i{}.s{}", name, it, sh))
    }

    /// Minimal context rooted in a scratch directory, for unit tests.
    #[cfg(test)]
    pub(crate) fn for_tests(root: &Path) -> Self {
        Self {
            workdir: root.join("work"),
            logdir: root.join("logs"),
            src: root.join("src.txt"),
            refs: vec![root.join("ref.txt")],
            base_config: root.join("decoder.ini"),
            nbest_size: 100,
            parallel_jobs: 2,
            cpus_per_job: 1,
            decode_opts: vec![],
            seed: 0,
            bleu_order: 4,
            density: -1.0,
            jar: PathBuf::from("cherrycSMT.jar"),
            java_mem_mb: 16000,
            no_aggregate: false,
            verbose: false,
            history_dir: root.to_path_buf(),
        }
    }

    /// Remove the working directory after a successful run.
    pub fn clean_workdir(&self) -> Result<()> {
        if self.workdir.exists() {
            fs::remove_dir_all(&self.workdir)
                .with_context(|| format!("removing workdir {}", self.workdir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_sentence_paths() {
        let c = RunContext::for_tests(Path::new("run"));
        assert_eq!(
            c.nbest_file(7),
            PathBuf::from("run/work/nbest.0007.100best")
        );
        assert_eq!(
            c.ffvals_file(7),
            PathBuf::from("run/work/nbest.0007.100best.ffvals")
        );
        assert_eq!(c.lattice_file(12), PathBuf::from("run/work/lat.0012"));
    }

    #[test]
    fn test_shard_tag() {
        let c = RunContext::for_tests(Path::new("run"));
        assert_eq!(
            c.shard_tag("mira.model", Some(3), Some(7)),
            PathBuf::from("run/work/mira.model.i03.s07")
        );
        assert_eq!(
            c.shard_tag("mira.model", None, Some(7)),
            PathBuf::from("run/work/mira.model.ixx.s07")
        );
        assert_eq!(
            c.shard_tag("mira.count", Some(11), None),
            PathBuf::from("run/work/mira.count.i11.sxx")
        );
    }

    #[test]
    fn test_init_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let c = RunContext::for_tests(dir.path());
        c.init().unwrap();
        assert!(c.workdir.is_dir());
        assert!(c.logdir.is_dir());
        assert!(c.decode_log().is_file());
        assert!(c.all_nbests().is_file());
        assert!(c.history_file().is_file());
    }
}
