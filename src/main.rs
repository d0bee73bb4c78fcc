//! tuneloop CLI - generic decoder tuning loop.
//!
//! Call with a source text and one or more reference translations:
//!
//! ```bash
//! tuneloop -f decoder.ini -o decoder.tuned -a "mira 1e-4 50" \
//!     dev.src dev.ref1 dev.ref2
//! ```
//!
//! The loop decodes, accumulates n-best output, scores, optimizes, and
//! stops when the decoder runs dry or the iteration cap is reached. The
//! chosen weights (best iteration by default, last with `-l`) are
//! written into the output decoder configuration.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;

use tuneloop::context::RunContext;
use tuneloop::external;
use tuneloop::optimize;
use tuneloop::tuner::Tuner;

/// Generic decoder tuning loop
///
/// Repeatedly decodes the source text with the current weights,
/// accumulates the decoder's n-best output across iterations, and runs
/// an external optimizer over the accumulation to improve the weights.
#[derive(Parser, Debug)]
#[command(name = "tuneloop")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Source text to tune on
    #[arg(value_name = "SRC")]
    src: PathBuf,

    /// One or more reference translations, line-parallel with SRC
    #[arg(value_name = "REF", required = true)]
    refs: Vec<PathBuf>,

    /// Initial decoder configuration file, including weights
    #[arg(short = 'f', long = "config", default_value = "decoder.ini")]
    config: PathBuf,

    /// Output decoder configuration file
    #[arg(short = 'o', long = "config-out", default_value = "decoder.tune")]
    config_out: PathBuf,

    /// N-best list size
    #[arg(short = 'n', long, default_value_t = 100)]
    nbest: usize,

    /// Number of parallel decoding jobs (also the shard count for the
    /// online strategy)
    #[arg(short = 'p', long, default_value_t = 30)]
    parallel: usize,

    /// CPUs per decoding job
    #[arg(short = 'c', long, default_value_t = 1)]
    cpus: usize,

    /// Extra decoding options passed through to the decoder
    #[arg(short = 'd', long, default_value = "", allow_hyphen_values = true)]
    decode_opts: String,

    /// Optimizer algorithm and argument string
    ///
    /// One of:
    ///   powell [switches]
    ///   mira  [C [iters [neg [bleucol [hope [bg [decay]]]]]]]
    ///   pro   [alg [curwt [bleucol [single [reg]]]]]
    ///   svm   [C [bleucol [cut|full]]]
    ///   expsb [L [bfgs]]
    ///   lmira [C [decay [bg [density [iters]]]]]
    ///   olmira [C [decay [bg [density [combine-counts [uniform|corpus]]]]]]
    #[arg(short = 'a', long = "algorithm", default_value = "powell")]
    optimizer: String,

    /// Maximum number of iterations (decoder calls)
    #[arg(short = 'm', long, default_value_t = 15)]
    max_iters: usize,

    /// Choose final weights from the last iteration rather than the best
    #[arg(short = 'l', long)]
    last_iter: bool,

    /// Start seed for the stochastic optimizers
    #[arg(short = 's', long, default_value_t = 0)]
    seed: u64,

    /// Turn off n-best aggregation (keep only the latest decode's lists)
    #[arg(long)]
    no_aggregate: bool,

    /// Density-prune lattices in the decoder (-1 for no pruning)
    #[arg(long, default_value_t = -1.0, allow_hyphen_values = true)]
    density: f64,

    /// N-gram order for BLEU (MIRA family only)
    #[arg(long, default_value_t = 4)]
    bleu_order: u32,

    /// Working directory for scratch files
    #[arg(long, default_value = "tunework")]
    workdir: PathBuf,

    /// Remove the working directory after successful completion
    #[arg(long)]
    clean: bool,

    /// Path to the external learner jar
    #[arg(long, default_value = "cherrycSMT.jar")]
    jar: PathBuf,

    /// Java heap size in MB for the external learners
    #[arg(short = 'j', long, default_value_t = 16000)]
    java_mem: u32,

    /// Write external command lines to stderr
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    for f in std::iter::once(&cli.src)
        .chain(cli.refs.iter())
        .chain(std::iter::once(&cli.config))
    {
        if !f.is_file() {
            bail!("input file {} doesn't exist", f.display());
        }
    }

    let alg_name = cli.optimizer.split_whitespace().next().unwrap_or("");
    if cli.bleu_order != 4 && !matches!(alg_name, "mira" | "lmira" | "olmira") {
        bail!("--bleu-order only works with the MIRA-family optimizers");
    }

    let ctx = RunContext {
        workdir: cli.workdir.clone(),
        logdir: PathBuf::from("logs"),
        src: cli.src.clone(),
        refs: cli.refs.clone(),
        base_config: cli.config.clone(),
        nbest_size: cli.nbest,
        parallel_jobs: cli.parallel.max(1),
        cpus_per_job: cli.cpus.max(1),
        decode_opts: cli
            .decode_opts
            .split_whitespace()
            .map(|s| s.to_string())
            .collect(),
        seed: cli.seed,
        bleu_order: cli.bleu_order,
        density: cli.density,
        jar: cli.jar.clone(),
        java_mem_mb: cli.java_mem,
        no_aggregate: cli.no_aggregate,
        verbose: cli.verbose,
        history_dir: PathBuf::from("."),
    };
    ctx.init()?;

    let strategy = optimize::from_spec(&cli.optimizer)?;

    let weights = external::weights_from_config(&ctx.base_config, &ctx.decode_log(), ctx.verbose)
        .context("reading initial weights from decoder config")?;
    optimize::write_seed_models(&ctx, &weights)?;

    let mut tuner = Tuner::new(&ctx, strategy);
    let outcome = tuner.run(cli.max_iters, weights)?;

    tuner
        .progress
        .print_summary(outcome.best.iter, outcome.best.score);
    println!(
        "Best score (from iter {}) = {}",
        outcome.best.iter + 1,
        outcome.best.score
    );
    println!("Best weights: {}", outcome.best.weights);

    // Machine-readable companion to the plain-text history.
    let report = serde_json::json!({
        "best_iter": outcome.best.iter,
        "best_score": outcome.best.score,
        "iterations_run": outcome.iterations_run,
        "best_weights": outcome.best.weights,
    });
    std::fs::write("summary.json", serde_json::to_string_pretty(&report)?)
        .context("writing summary.json")?;

    let chosen = if cli.last_iter {
        println!(
            "Using last-iteration weights for {}",
            cli.config_out.display()
        );
        &outcome.final_weights
    } else {
        &outcome.best.weights
    };
    external::weights_to_config(
        chosen,
        &ctx.base_config,
        &cli.config_out,
        &ctx.decode_log(),
        ctx.verbose,
    )?;
    println!(
        "{} {}",
        "Wrote".green(),
        cli.config_out.display()
    );

    if cli.clean {
        ctx.clean_workdir()?;
    }
    Ok(())
}
