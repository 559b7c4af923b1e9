//! Process-wide state shared between search workers.
//!
//! Everything here is read and written through atomics or a short-lived
//! lock; workers never share their boards or domains. The best-ever board
//! and best-ever piece set are published independently: a reader racing a
//! writer may observe the old board next to the new pieces, and callers
//! must treat the pair as advisory rather than authoritative.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::ThreadPool;

use crate::board::Board;
use crate::error::{Result, SolverError};
use crate::pieces::PieceBits;
use crate::stats::SearchStats;

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    placements: AtomicU64,
    backtracks: AtomicU64,
    singletons: AtomicU64,
    dead_ends: AtomicU64,
    fit_checks: AtomicU64,
}

/// Shared flags, best-ever tracking, and the lazily created pool.
///
/// The driver creates one per solve and hands it (behind an [`Arc`]) to
/// every worker and to the save manager; tests reset by constructing a
/// fresh instance.
#[derive(Default)]
pub struct SharedState {
    solution_found: AtomicBool,
    cancelled: AtomicBool,
    best_depth: AtomicUsize,
    best_thread: AtomicUsize,
    best_board: Mutex<Option<Board>>,
    best_pieces: Mutex<Option<PieceBits>>,
    pool: Mutex<Option<Arc<ThreadPool>>>,
    counters: Counters,
}

impl SharedState {
    /// Fresh state with nothing found and no pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the solution flag. Returns true for the single caller that
    /// flipped it.
    pub fn mark_solved(&self) -> bool {
        self.solution_found
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True once any worker has published a solution.
    #[inline]
    pub fn solution_found(&self) -> bool {
        self.solution_found.load(Ordering::Acquire)
    }

    /// Requests cooperative shutdown (timeouts, signals).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancellation was requested.
    #[inline]
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Observed at every recursion step; workers unwind normally when it
    /// turns true.
    #[inline]
    pub fn should_stop(&self) -> bool {
        self.solution_found() || self.cancelled()
    }

    /// Raises the best depth. Returns true iff `depth` beat the previous
    /// maximum; the CAS keeps the value monotone under races.
    pub fn update_best(&self, depth: usize) -> bool {
        self.best_depth.fetch_max(depth, Ordering::AcqRel) < depth
    }

    /// Deepest fill any worker has reached.
    pub fn best_depth(&self) -> usize {
        self.best_depth.load(Ordering::Acquire)
    }

    /// Publishes a new best board and piece set if `depth` is a record.
    ///
    /// The two fields are replaced one after the other with no joint
    /// transaction; see the module docs for the tolerated race.
    pub fn offer_best(&self, depth: usize, board: &Board, used: &PieceBits) -> bool {
        if !self.update_best(depth) {
            return false;
        }
        let thread = rayon::current_thread_index().map_or(0, |i| i + 1);
        self.best_thread.store(thread, Ordering::Release);
        *self.best_board.lock() = Some(board.clone());
        *self.best_pieces.lock() = Some(used.clone());
        true
    }

    /// Clone of the best-ever board, if one was published.
    pub fn best_board(&self) -> Option<Board> {
        self.best_board.lock().clone()
    }

    /// Clone of the piece set accompanying the best-ever board.
    pub fn best_pieces(&self) -> Option<PieceBits> {
        self.best_pieces.lock().clone()
    }

    /// Worker index (1-based) that last raised the best depth; 0 outside
    /// the pool.
    pub fn best_thread(&self) -> usize {
        self.best_thread.load(Ordering::Acquire)
    }

    /// Returns the work-stealing pool, creating it on first call under a
    /// single-flight lock. Later calls are idempotent and ignore
    /// `threads`.
    pub fn enable_pool(&self, threads: usize) -> Result<Arc<ThreadPool>> {
        let mut guard = self.pool.lock();
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| SolverError::Pool(e.to_string()))?;
        let pool = Arc::new(pool);
        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Drops the pool handle; worker threads wind down once idle.
    pub fn shutdown_pool(&self) {
        *self.pool.lock() = None;
    }

    /// Folds a worker's counters into the shared totals.
    pub fn absorb_stats(&self, stats: &SearchStats) {
        let c = &self.counters;
        c.calls.fetch_add(stats.calls, Ordering::Relaxed);
        c.placements.fetch_add(stats.placements, Ordering::Relaxed);
        c.backtracks.fetch_add(stats.backtracks, Ordering::Relaxed);
        c.singletons.fetch_add(stats.singletons, Ordering::Relaxed);
        c.dead_ends.fetch_add(stats.dead_ends, Ordering::Relaxed);
        c.fit_checks.fetch_add(stats.fit_checks, Ordering::Relaxed);
    }

    /// Snapshot of the pooled counters across all workers.
    pub fn stats_totals(&self) -> SearchStats {
        let c = &self.counters;
        SearchStats {
            calls: c.calls.load(Ordering::Relaxed),
            placements: c.placements.load(Ordering::Relaxed),
            backtracks: c.backtracks.load(Ordering::Relaxed),
            singletons: c.singletons.load(Ordering::Relaxed),
            dead_ends: c.dead_ends.load(Ordering::Relaxed),
            fit_checks: c.fit_checks.load(Ordering::Relaxed),
        }
    }

    /// Clears every field, including the pool. Used by tests and between
    /// runs.
    pub fn reset(&self) {
        self.solution_found.store(false, Ordering::Release);
        self.cancelled.store(false, Ordering::Release);
        self.best_depth.store(0, Ordering::Release);
        self.best_thread.store(0, Ordering::Release);
        *self.best_board.lock() = None;
        *self.best_pieces.lock() = None;
        self.shutdown_pool();
        let c = &self.counters;
        c.calls.store(0, Ordering::Relaxed);
        c.placements.store(0, Ordering::Relaxed);
        c.backtracks.store(0, Ordering::Relaxed);
        c.singletons.store(0, Ordering::Relaxed);
        c.dead_ends.store(0, Ordering::Relaxed);
        c.fit_checks.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solution_flag_flips_once() {
        let shared = SharedState::new();
        assert!(!shared.solution_found());
        assert!(shared.mark_solved());
        assert!(!shared.mark_solved());
        assert!(shared.solution_found());
        assert!(shared.should_stop());
    }

    #[test]
    fn test_cancellation_is_observed_like_solution() {
        let shared = SharedState::new();
        assert!(!shared.should_stop());
        shared.cancel();
        assert!(shared.should_stop());
        assert!(!shared.solution_found());
    }

    #[test]
    fn test_best_depth_is_monotone() {
        let shared = SharedState::new();
        assert!(shared.update_best(5));
        assert!(!shared.update_best(5));
        assert!(!shared.update_best(3));
        assert!(shared.update_best(9));
        assert_eq!(shared.best_depth(), 9);
    }

    #[test]
    fn test_offer_best_publishes_board_and_pieces() {
        let shared = SharedState::new();
        let board = Board::new(2, 2);
        let mut used = PieceBits::new(4);
        used.set(1);

        assert!(shared.offer_best(1, &board, &used));
        assert_eq!(shared.best_board().unwrap(), board);
        assert_eq!(shared.best_pieces().unwrap().count(), 1);
        // a shallower offer leaves the snapshot alone
        assert!(!shared.offer_best(0, &board, &PieceBits::new(4)));
        assert_eq!(shared.best_pieces().unwrap().count(), 1);
    }

    #[test]
    fn test_pool_enable_is_idempotent() {
        let shared = SharedState::new();
        let a = shared.enable_pool(2).unwrap();
        let b = shared.enable_pool(8).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.current_num_threads(), 2);
        shared.shutdown_pool();
    }

    #[test]
    fn test_reset_clears_everything() {
        let shared = SharedState::new();
        shared.mark_solved();
        shared.cancel();
        shared.offer_best(7, &Board::new(2, 2), &PieceBits::new(4));
        shared.absorb_stats(&SearchStats {
            calls: 3,
            ..Default::default()
        });

        shared.reset();
        assert!(!shared.should_stop());
        assert_eq!(shared.best_depth(), 0);
        assert!(shared.best_board().is_none());
        assert_eq!(shared.stats_totals(), SearchStats::default());
    }
}
