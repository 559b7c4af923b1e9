//! Shallow-depth fan-out over the work-stealing pool.
//!
//! Near the root the driver forks one sub-task per candidate, each with a
//! fully cloned worker state and the candidate pre-placed; deeper levels
//! run sequentially on whichever worker stole them. Nothing mutable is
//! shared between tasks except [`SharedState`], and cancellation is
//! purely cooperative: tasks observe the flags and return through normal
//! stack unwinding.

use rayon::prelude::*;

use crate::error::Result;
use crate::shared::SharedState;
use crate::solver::Engine;

/// Default worker count: three quarters of the cores, clamped to [4, 32].
pub fn default_threads() -> usize {
    (num_cpus::get() * 3 / 4).clamp(4, 32)
}

/// Releases the pool on every exit path out of the driver.
struct PoolGuard<'a>(&'a SharedState);

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.0.shutdown_pool();
    }
}

/// Solves on the shared pool. The pool is created on first use, sized to
/// `threads`, and shut down when the driver returns (solved, exhausted,
/// or cancelled).
pub fn run_parallel(mut eng: Engine, threads: usize) -> Result<bool> {
    let shared = eng.shared().clone();
    let pool = shared.enable_pool(threads)?;
    let _guard = PoolGuard(&shared);

    if !eng.prepare() {
        eng.flush_stats();
        return Ok(false);
    }
    if eng.is_complete() {
        let solved = eng.publish_solution();
        eng.flush_stats();
        return Ok(solved);
    }
    log::debug!(
        "fanning out on {} workers",
        pool.current_num_threads()
    );
    Ok(pool.install(|| fan_out(eng, 0)))
}

/// Forks one sub-task per candidate while shallow and wide enough, then
/// waits for any child to succeed or all of them to fail; narrow or deep
/// subtrees finish sequentially on the current worker.
fn fan_out(mut eng: Engine, fork_level: usize) -> bool {
    if eng.shared().should_stop() {
        eng.flush_stats();
        return false;
    }
    let Some((row, col)) = eng.select_cell() else {
        let solved = eng.publish_solution();
        eng.flush_stats();
        return solved;
    };
    let cands = eng.domain_at(row, col).to_vec();
    if fork_level >= eng.options().fork_depth || cands.len() < eng.options().min_fork_width {
        let depth = eng.board().filled_count();
        let solved = eng.search(depth);
        eng.flush_stats();
        return solved;
    }

    let solved = cands.into_par_iter().any(|cand| {
        if eng.shared().should_stop() {
            return false;
        }
        let mut child = eng.fork();
        match child.try_candidate(row, col, cand) {
            Ok(_) => fan_out(child, fork_level + 1),
            Err(_) => {
                child.flush_stats();
                false
            }
        }
    });
    eng.flush_stats();
    solved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::fixtures::{same_color_corners, unique_grid};
    use crate::solver::SolveOptions;
    use std::sync::Arc;

    fn parallel_engine(
        pieces: crate::pieces::PieceSet,
        opts: SolveOptions,
    ) -> (Engine, Arc<SharedState>) {
        let shared = Arc::new(SharedState::new());
        let eng = Engine::new(Arc::new(pieces), shared.clone(), opts).unwrap();
        (eng, shared)
    }

    #[test]
    fn test_default_threads_within_bounds() {
        let n = default_threads();
        assert!((4..=32).contains(&n));
    }

    #[test]
    fn test_parallel_matches_sequential_result() {
        // sequential reference run
        let (mut seq, seq_shared) = parallel_engine(unique_grid(4, 4), SolveOptions::default());
        assert!(seq.run());
        let seq_board = seq_shared.best_board().unwrap();

        // parallel run on a fresh shared state
        let (eng, shared) = parallel_engine(unique_grid(4, 4), SolveOptions::default());
        assert!(run_parallel(eng, 4).unwrap());
        assert!(shared.solution_found());
        assert_eq!(shared.best_depth(), 16);
        assert_eq!(shared.best_board().unwrap(), seq_board);
    }

    #[test]
    fn test_fan_out_races_to_any_solution() {
        // every arrangement of the interchangeable corners solves, so the
        // children race and exactly one publishes
        let opts = SolveOptions {
            use_singletons: false,
            min_fork_width: 1,
            ..SolveOptions::default()
        };
        let (eng, shared) = parallel_engine(same_color_corners(), opts);
        assert!(run_parallel(eng, 4).unwrap());
        assert!(shared.solution_found());
        assert_eq!(shared.best_depth(), 4);
        let best = shared.best_board().unwrap();
        let (matching, max) = best.score();
        assert_eq!(matching, max);
    }

    #[test]
    fn test_cancelled_before_start_returns_unsolved() {
        let opts = SolveOptions {
            use_singletons: false,
            ..SolveOptions::default()
        };
        let (eng, shared) = parallel_engine(same_color_corners(), opts);
        shared.cancel();
        assert!(!run_parallel(eng, 4).unwrap());
        assert!(!shared.solution_found());
    }

    #[test]
    fn test_infeasible_parallel_returns_false() {
        let mut pieces: Vec<_> = unique_grid(3, 3).iter().copied().collect();
        pieces[4] = crate::pieces::Piece::new(5, [99, 99, 99, 99]).unwrap();
        let set = crate::pieces::PieceSet::new(pieces).unwrap();

        let (eng, shared) = parallel_engine(set, SolveOptions::default());
        assert!(!run_parallel(eng, 4).unwrap());
        assert!(!shared.solution_found());
    }
}
