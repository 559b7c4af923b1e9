//! The backtracking search engine.
//!
//! One [`Engine`] is one worker: it owns its board, domains, used bits,
//! and placement order outright, sharing only the atomic flags and
//! best-ever snapshot in [`SharedState`]. The search is plain depth-first
//! recursion: pick the most constrained cell, try its candidates in
//! domain order, propagate after every placement, and unwind through the
//! trail when a branch wipes out.

use std::sync::Arc;
use std::time::Instant;

use crate::board::{Board, PlacementEvent, PlacementOrder, DIRS};
use crate::domain::{Domains, Trail};
use crate::error::{Result, SolverError, Wipeout};
use crate::index::{Cand, EdgeIndex};
use crate::persistence::{SaveManager, SaveState};
use crate::pieces::{PieceBits, PieceSet};
use crate::shared::SharedState;
use crate::singles;
use crate::stats::{SearchStats, StatsLogger, StatsRecord};
use crate::validator::Validator;

/// Engine-level knobs.
#[derive(Debug, Clone)]
pub struct SolveOptions {
    /// Run the singleton sweeps after every placement.
    pub use_singletons: bool,
    /// Fan out sub-tasks while fewer than this many fork levels deep.
    pub fork_depth: usize,
    /// Minimum candidate count worth forking.
    pub min_fork_width: usize,
    /// Pre-placed hints. They are marked used before the search starts,
    /// never appear in the placement order, and never backtrack.
    pub fixed: Vec<PlacementEvent>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            use_singletons: true,
            fork_depth: 2,
            min_fork_width: 10,
            fixed: Vec::new(),
        }
    }
}

/// One search worker.
pub struct Engine {
    pub(crate) pieces: Arc<PieceSet>,
    pub(crate) index: Arc<EdgeIndex>,
    pub(crate) validator: Validator,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) opts: SolveOptions,
    pub(crate) board: Board,
    pub(crate) domains: Domains,
    pub(crate) used: PieceBits,
    pub(crate) order: PlacementOrder,
    pub(crate) trail: Trail,
    pub(crate) stats: SearchStats,
    saver: Option<Arc<SaveManager>>,
    stats_log: Option<Arc<StatsLogger>>,
    started: Instant,
    base_compute_ms: u64,
    prepared: bool,
}

impl Engine {
    /// A fresh worker over an empty board (plus any fixed placements).
    pub fn new(
        pieces: Arc<PieceSet>,
        shared: Arc<SharedState>,
        opts: SolveOptions,
    ) -> Result<Self> {
        Self::with_resume(pieces, shared, opts, None)
    }

    /// A worker seeded from a saved state: the stored placement order is
    /// replayed onto the board before the search continues.
    pub fn with_resume(
        pieces: Arc<PieceSet>,
        shared: Arc<SharedState>,
        opts: SolveOptions,
        resume: Option<&SaveState>,
    ) -> Result<Self> {
        let index = Arc::new(EdgeIndex::build(&pieces));
        let validator = Validator::new(&pieces);
        let rows = pieces.rows();
        let cols = pieces.cols();

        let (mut board, mut used, order, base_compute_ms) = match resume {
            Some(state) => {
                let (board, used, order) = state.restore(&pieces)?;
                (board, used, order, state.compute_ms)
            }
            None => (
                Board::new(rows, cols),
                PieceBits::new(pieces.len()),
                Vec::new(),
                0,
            ),
        };

        for event in &opts.fixed {
            let (row, col) = (event.row as usize, event.col as usize);
            let piece = pieces.get(event.piece).ok_or_else(|| {
                SolverError::InvalidInput(format!("fixed placement names piece {}", event.piece))
            })?;
            if let Some(existing) = board.get(row, col) {
                // a resumed board may already hold the hint
                if (existing.piece, existing.rotation) != (event.piece, event.rotation) {
                    return Err(SolverError::InvalidInput(format!(
                        "fixed placement at ({row}, {col}) conflicts with resumed state"
                    )));
                }
                continue;
            }
            let edges = piece.edges_rotated(event.rotation);
            if !validator.fits(&board, row, col, event.piece, &edges) {
                return Err(SolverError::InvalidInput(format!(
                    "fixed placement of piece {} at ({row}, {col}) does not fit",
                    event.piece
                )));
            }
            board.place(row, col, piece, event.rotation)?;
            used.set(event.piece);
        }

        Ok(Self {
            domains: Domains::new(rows, cols),
            pieces,
            index,
            validator,
            shared,
            opts,
            board,
            used,
            order,
            trail: Trail::new(),
            stats: SearchStats::default(),
            saver: None,
            stats_log: None,
            started: Instant::now(),
            base_compute_ms,
            prepared: false,
        })
    }

    /// Attaches the checkpoint writer.
    pub fn with_saver(mut self, saver: Arc<SaveManager>) -> Self {
        self.saver = Some(saver);
        self
    }

    /// Attaches the stats exporter.
    pub fn with_stats_logger(mut self, logger: Arc<StatsLogger>) -> Self {
        self.stats_log = Some(logger);
        self
    }

    /// The worker's board.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// The worker's counters.
    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    /// The shared cross-worker state.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub(crate) fn options(&self) -> &SolveOptions {
        &self.opts
    }

    pub(crate) fn domain_at(&self, row: usize, col: usize) -> &[Cand] {
        self.domains.get(row, col)
    }

    /// True once every cell is filled.
    pub fn is_complete(&self) -> bool {
        self.board.is_full()
    }

    /// Builds the initial domains and forces the opening singletons.
    /// Returns false when propagation proves the position infeasible.
    pub fn prepare(&mut self) -> bool {
        if self.prepared {
            return true;
        }
        self.prepared = true;
        if self
            .domains
            .initialize(
                &self.board,
                &self.pieces,
                &self.index,
                &self.used,
                &self.validator,
            )
            .is_err()
        {
            log::debug!("initial propagation wiped out; puzzle is infeasible");
            return false;
        }
        if self.opts.use_singletons && singles::run(self).is_err() {
            log::debug!("opening singleton cascade wiped out; puzzle is infeasible");
            return false;
        }
        let depth = self.board.filled_count();
        self.offer_best(depth);
        true
    }

    /// Sequential solve to completion, cancellation, or exhaustion.
    pub fn run(&mut self) -> bool {
        let solved = if !self.prepare() {
            false
        } else if self.is_complete() {
            self.publish_solution()
        } else {
            let depth = self.board.filled_count();
            self.search(depth)
        };
        self.flush_stats();
        solved
    }

    /// The recursive search. Precondition: domains are arc-consistent
    /// with the board. Returns true as soon as a solution is published;
    /// every failed branch restores the worker state bit for bit.
    pub(crate) fn search(&mut self, depth: usize) -> bool {
        self.stats.calls += 1;
        if depth == self.board.cell_count() {
            return self.publish_solution();
        }
        if self.shared.should_stop() {
            return false;
        }
        let Some((row, col)) = self.select_cell() else {
            return self.publish_solution();
        };
        let cands: Vec<Cand> = self.domains.get(row, col).to_vec();
        if cands.is_empty() {
            self.stats.dead_ends += 1;
            return false;
        }
        for cand in cands {
            if self.shared.should_stop() {
                return false;
            }
            let mark = self.trail.mark();
            let order_len = self.order.len();
            match self.try_candidate(row, col, cand) {
                Ok(new_depth) => {
                    if self.search(new_depth) {
                        return true;
                    }
                }
                Err(Wipeout) => {}
            }
            self.unwind(mark, order_len);
        }
        self.stats.dead_ends += 1;
        false
    }

    /// Fail-first cell choice: smallest domain, then rim cells, then the
    /// most filled neighbors, then row-major order. `None` only when the
    /// board is full.
    pub(crate) fn select_cell(&self) -> Option<(usize, usize)> {
        let rows = self.board.rows();
        let cols = self.board.cols();
        let mut best: Option<((usize, usize), (usize, usize, usize))> = None;
        for row in 0..rows {
            for col in 0..cols {
                if !self.board.is_empty(row, col) {
                    continue;
                }
                let on_rim = row == 0 || col == 0 || row == rows - 1 || col == cols - 1;
                let filled_neighbors = DIRS
                    .iter()
                    .filter(|&&dir| {
                        self.board
                            .neighbor(row, col, dir)
                            .is_some_and(|(r, c)| !self.board.is_empty(r, c))
                    })
                    .count();
                let key = (
                    self.domains.len_at(row, col),
                    usize::from(!on_rim),
                    4 - filled_neighbors,
                );
                if best.as_ref().is_none_or(|&(_, best_key)| key < best_key) {
                    best = Some(((row, col), key));
                }
            }
        }
        best.map(|(cell, _)| cell)
    }

    /// Speculatively places one candidate: board, used bits, placement
    /// order, then domain collapse and propagation from the cell.
    pub(crate) fn place_candidate(
        &mut self,
        row: usize,
        col: usize,
        cand: Cand,
    ) -> std::result::Result<(), Wipeout> {
        let Some(piece) = self.pieces.get(cand.piece).copied() else {
            return Err(Wipeout);
        };
        // indices come from the cell selector or the domain, always in bounds
        let _ = self.board.place(row, col, &piece, cand.rotation);
        self.used.set(cand.piece);
        self.order.push(PlacementEvent {
            row: row as u16,
            col: col as u16,
            piece: cand.piece,
            rotation: cand.rotation,
        });
        self.stats.placements += 1;

        let mut seeds = self
            .domains
            .assign(&self.board, row, col, cand, &mut self.trail)?;
        for dir in DIRS {
            if let Some((nr, nc)) = self.board.neighbor(row, col, dir) {
                if self.board.is_empty(nr, nc) {
                    seeds.push((nr, nc));
                }
            }
        }
        self.domains
            .propagate(&self.board, &self.pieces, &seeds, &mut self.trail)
    }

    /// One full branch step: place, force singletons to a fixed point,
    /// track the best depth, checkpoint. Returns the new fill depth.
    pub(crate) fn try_candidate(
        &mut self,
        row: usize,
        col: usize,
        cand: Cand,
    ) -> std::result::Result<usize, Wipeout> {
        self.place_candidate(row, col, cand)?;
        if self.opts.use_singletons {
            singles::run(self)?;
        }
        let depth = self.board.filled_count();
        self.offer_best(depth);
        self.checkpoint(depth);
        Ok(depth)
    }

    /// Undoes everything since the marks: placement order tail, board
    /// cells, used bits, then the domain trail.
    pub(crate) fn unwind(&mut self, mark: usize, order_len: usize) {
        while self.order.len() > order_len {
            if let Some(event) = self.order.pop() {
                self.board.remove(event.row as usize, event.col as usize);
                self.used.clear(event.piece);
            }
        }
        self.domains.restore(&mut self.trail, mark);
        self.stats.backtracks += 1;
    }

    /// Publishes the solved board and flips the shared flag.
    pub(crate) fn publish_solution(&mut self) -> bool {
        let depth = self.board.filled_count();
        self.shared.offer_best(depth, &self.board, &self.used);
        if self.shared.mark_solved() {
            log::info!("solution found with {depth} pieces placed");
            if let Some(saver) = &self.saver {
                saver.finalize(depth, &self.capture_state());
            }
        }
        true
    }

    fn offer_best(&mut self, depth: usize) {
        if self.shared.offer_best(depth, &self.board, &self.used) {
            log::debug!("new best depth {depth}");
        }
    }

    fn checkpoint(&mut self, depth: usize) {
        let Some(saver) = self.saver.clone() else {
            return;
        };
        if !saver.due(depth) {
            return;
        }
        let state = self.capture_state();
        saver.tick(depth, &state);
        if let Some(logger) = &self.stats_log {
            logger.append(&StatsRecord::at_tick(
                state.timestamp_ms,
                depth,
                self.board.cell_count(),
                self.compute_ms(),
                &self.stats,
            ));
        }
    }

    fn compute_ms(&self) -> u64 {
        self.base_compute_ms + self.started.elapsed().as_millis() as u64
    }

    fn capture_state(&self) -> SaveState {
        let name = self.saver.as_ref().map_or("puzzle", |s| s.name());
        SaveState::capture(
            name,
            self.board.rows(),
            self.board.cols(),
            &self.order,
            &self.used,
            self.compute_ms(),
        )
    }

    /// Drains this worker's counters into the shared totals.
    pub(crate) fn flush_stats(&mut self) {
        let stats = self.stats.take();
        self.shared.absorb_stats(&stats);
    }

    /// Clones the worker state for a fanned-out sub-task. The child gets
    /// a fresh trail and counters; it never unwinds past the fork point.
    pub(crate) fn fork(&self) -> Engine {
        Engine {
            pieces: Arc::clone(&self.pieces),
            index: Arc::clone(&self.index),
            validator: self.validator,
            shared: Arc::clone(&self.shared),
            opts: self.opts.clone(),
            board: self.board.clone(),
            domains: self.domains.clone(),
            used: self.used.clone(),
            order: self.order.clone(),
            trail: Trail::new(),
            stats: SearchStats::default(),
            saver: self.saver.clone(),
            stats_log: self.stats_log.clone(),
            started: self.started,
            base_compute_ms: self.base_compute_ms,
            prepared: true,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::pieces::Piece;

    /// Builds the piece set of a fully tiled grid whose internal edge
    /// colors come from `color(edge_index)`. With the identity map every
    /// internal color is distinct and the unique solution is each piece
    /// at its home cell in rotation 0.
    pub(crate) fn grid_with(rows: usize, cols: usize, color: impl Fn(u8) -> u8) -> PieceSet {
        let h = |r: usize, c: usize| color((r * (cols - 1) + c + 1) as u8);
        let v_base = rows * (cols - 1);
        let v = |r: usize, c: usize| color((v_base + r * cols + c + 1) as u8);
        let mut pieces = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let id = (r * cols + c + 1) as u16;
                let north = if r == 0 { 0 } else { v(r - 1, c) };
                let east = if c == cols - 1 { 0 } else { h(r, c) };
                let south = if r == rows - 1 { 0 } else { v(r, c) };
                let west = if c == 0 { 0 } else { h(r, c - 1) };
                pieces.push(Piece::new(id, [north, east, south, west]).unwrap());
            }
        }
        PieceSet::new(pieces).unwrap()
    }

    /// Distinct-color grid: uniquely solvable by the identity placement.
    pub(crate) fn unique_grid(rows: usize, cols: usize) -> PieceSet {
        grid_with(rows, cols, |c| c)
    }

    /// Four interchangeable corner pieces; every arrangement solves.
    pub(crate) fn same_color_corners() -> PieceSet {
        PieceSet::new(
            (1..=4u16)
                .map(|id| Piece::new(id, [0, 1, 1, 0]).unwrap())
                .collect(),
        )
        .unwrap()
    }

    pub(crate) fn engine_for(pieces: PieceSet, opts: SolveOptions) -> Engine {
        Engine::new(Arc::new(pieces), Arc::new(SharedState::new()), opts).unwrap()
    }
}
