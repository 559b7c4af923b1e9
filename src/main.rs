//! Edge-Matching Puzzle Solver
//!
//! Loads a piece file, resumes from the newest readable save when one
//! exists, and searches until solved, exhausted, or timed out. Exit code
//! 0 means solved, 1 unsolved, 2 error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use flexi_logger::Logger;

use edgematch::parallel;
use edgematch::persistence::SaveManager;
use edgematch::pieces::PieceSet;
use edgematch::shared::SharedState;
use edgematch::solver::{Engine, SolveOptions};
use edgematch::stats::StatsLogger;

/// Solves square edge-matching puzzles.
#[derive(Parser)]
#[command(name = "edgematch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Puzzle name or piece-file path.
    puzzle: String,

    /// Verbose logging.
    #[arg(short = 'v', conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only.
    #[arg(short = 'q')]
    quiet: bool,

    /// Solve on the work-stealing pool.
    #[arg(short = 'p')]
    parallel: bool,

    /// Worker thread count (implies -p).
    #[arg(short = 't', value_name = "N")]
    threads: Option<usize>,

    /// Give up after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Disable singleton forcing.
    #[arg(long = "no-singletons")]
    no_singletons: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<bool> {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let _logger = Logger::try_with_env_or_str(level)?.log_to_stderr().start()?;

    let path = resolve_puzzle_path(&cli.puzzle);
    let pieces = Arc::new(
        PieceSet::load(&path).with_context(|| format!("loading {}", path.display()))?,
    );
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("puzzle")
        .to_string();
    log::info!(
        "{}: {} pieces on a {}x{} board",
        name,
        pieces.len(),
        pieces.rows(),
        pieces.cols()
    );

    let shared = Arc::new(SharedState::new());
    let saver = Arc::new(SaveManager::new(Path::new("."), &name));
    let stats_log = Arc::new(StatsLogger::open(&PathBuf::from(format!(
        "{name}_stats.jsonl"
    )))?);

    let opts = SolveOptions {
        use_singletons: !cli.no_singletons,
        ..SolveOptions::default()
    };

    let resume = saver.load_latest();
    if let Some(state) = &resume {
        log::info!("resuming from saved depth {}", state.depth());
    }

    let engine = Engine::with_resume(pieces, shared.clone(), opts, resume.as_ref())?
        .with_saver(saver)
        .with_stats_logger(stats_log);

    if let Some(seconds) = cli.timeout {
        let shared = shared.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            if !shared.solution_found() {
                log::info!("timeout after {seconds}s, cancelling");
                shared.cancel();
            }
        });
    }

    let solved = if cli.parallel || cli.threads.is_some() {
        let threads = cli.threads.unwrap_or_else(parallel::default_threads);
        log::info!("parallel solve on {threads} workers");
        parallel::run_parallel(engine, threads)?
    } else {
        let mut engine = engine;
        engine.run()
    };

    let totals = shared.stats_totals();
    log::info!(
        "{} placements, {} backtracks, {} singletons, {} dead ends",
        totals.placements,
        totals.backtracks,
        totals.singletons,
        totals.dead_ends
    );

    if solved {
        log::info!("solved");
        if !cli.quiet {
            if let Some(board) = shared.best_board() {
                println!("{}", board.render());
            }
        }
    } else if shared.cancelled() {
        log::info!("unsolved: cancelled at best depth {}", shared.best_depth());
    } else {
        log::info!(
            "unsolved: search exhausted at best depth {}",
            shared.best_depth()
        );
    }
    Ok(solved)
}

/// An existing path is used as-is; otherwise the argument is a puzzle
/// name resolved to `<name>.txt` in the working directory.
fn resolve_puzzle_path(arg: &str) -> PathBuf {
    let direct = PathBuf::from(arg);
    if direct.exists() {
        direct
    } else {
        PathBuf::from(format!("{arg}.txt"))
    }
}
