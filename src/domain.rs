//! Per-cell candidate domains with arc-consistency propagation.
//!
//! Every empty cell holds an ordered list of candidates that satisfy the
//! border, neighbor, and piece-availability constraints; a filled cell's
//! domain is exactly its current placement. Propagation removes
//! candidates with no supporting candidate in an adjacent cell until a
//! fixed point, failing with [`Wipeout`] the moment any domain empties.
//!
//! Removals are tombstone-free: the list shrinks in place and every
//! removal is logged on a [`Trail`] with its position, so unwinding a
//! speculative placement re-inserts exactly the removed candidates in
//! O(k).

use std::collections::VecDeque;

use crate::board::{Board, DIRS};
use crate::error::Wipeout;
use crate::index::{Cand, EdgeIndex};
use crate::pieces::{PieceBits, PieceSet, BORDER};
use crate::validator::Validator;

/// One logged removal: which cell, at which position, which candidate.
#[derive(Debug, Clone, Copy)]
struct Removal {
    cell: u32,
    pos: u32,
    cand: Cand,
}

/// Undo log for domain removals.
///
/// A caller takes a [`Trail::mark`] before a speculative placement and
/// hands it back to [`Domains::restore`] to unwind everything since.
#[derive(Debug, Default)]
pub struct Trail {
    removals: Vec<Removal>,
}

impl Trail {
    /// An empty trail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Position marking the current state.
    #[inline]
    pub fn mark(&self) -> usize {
        self.removals.len()
    }

    #[inline]
    fn record(&mut self, cell: usize, pos: usize, cand: Cand) {
        self.removals.push(Removal {
            cell: cell as u32,
            pos: pos as u32,
            cand,
        });
    }
}

/// The dense grid of candidate domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domains {
    rows: usize,
    cols: usize,
    cells: Vec<Vec<Cand>>,
}

impl Domains {
    /// Unpopulated domains; call [`Domains::initialize`] before use.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![Vec::new(); rows * cols],
        }
    }

    #[inline]
    fn idx(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    /// The ordered candidate list for a cell.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> &[Cand] {
        &self.cells[self.idx(row, col)]
    }

    /// Candidate count for a cell.
    #[inline]
    pub fn len_at(&self, row: usize, col: usize) -> usize {
        self.cells[self.idx(row, col)].len()
    }

    /// Computes every cell's initial domain and propagates to a fixed
    /// point. Filled cells collapse to their current placement; empty
    /// cells are seeded from the edge index and filtered through the
    /// validator and the used set.
    pub fn initialize(
        &mut self,
        board: &Board,
        pieces: &PieceSet,
        index: &EdgeIndex,
        used: &PieceBits,
        validator: &Validator,
    ) -> Result<(), Wipeout> {
        for row in 0..self.rows {
            for col in 0..self.cols {
                let cell = self.idx(row, col);
                if let Some(placed) = board.get(row, col) {
                    self.cells[cell] = vec![Cand {
                        piece: placed.piece,
                        rotation: placed.rotation,
                    }];
                    continue;
                }

                // seed from the tightest constraint this cell is under
                let seed: Vec<Cand> = if let Some(&dir) =
                    DIRS.iter().find(|&&d| board.is_border_side(row, col, d))
                {
                    index.compatible(dir, BORDER).to_vec()
                } else if let Some((dir, color)) = DIRS.iter().find_map(|&d| {
                    let (nr, nc) = board.neighbor(row, col, d)?;
                    let neighbor = board.get(nr, nc)?;
                    Some((d, neighbor.edges[d.opposite() as usize]))
                }) {
                    index.compatible(dir, color).to_vec()
                } else {
                    pieces
                        .iter()
                        .flat_map(|p| {
                            (0..4u8).map(move |rotation| Cand {
                                piece: p.id(),
                                rotation,
                            })
                        })
                        .collect()
                };

                let domain: Vec<Cand> = seed
                    .into_iter()
                    .filter(|cand| {
                        !used.contains(cand.piece)
                            && pieces.get(cand.piece).is_some_and(|p| {
                                validator.fits(
                                    board,
                                    row,
                                    col,
                                    cand.piece,
                                    &p.edges_rotated(cand.rotation),
                                )
                            })
                    })
                    .collect();
                if domain.is_empty() {
                    return Err(Wipeout);
                }
                self.cells[cell] = domain;
            }
        }

        let seeds: Vec<(usize, usize)> = (0..self.rows)
            .flat_map(|r| (0..self.cols).map(move |c| (r, c)))
            .filter(|&(r, c)| board.is_empty(r, c))
            .collect();
        let mut scratch = Trail::new();
        self.propagate(board, pieces, &seeds, &mut scratch)
    }

    /// Collapses a cell's domain to one chosen candidate and strips that
    /// piece from every other cell. Returns the empty cells that lost
    /// candidates so the caller can seed propagation from them.
    ///
    /// Fails if the candidate is not in the cell's domain (a forced move
    /// that propagation already ruled out) or if the strip empties some
    /// empty cell's domain.
    pub fn assign(
        &mut self,
        board: &Board,
        row: usize,
        col: usize,
        cand: Cand,
        trail: &mut Trail,
    ) -> Result<Vec<(usize, usize)>, Wipeout> {
        let cell = self.idx(row, col);
        if !self.cells[cell].contains(&cand) {
            return Err(Wipeout);
        }
        let mut i = self.cells[cell].len();
        while i > 0 {
            i -= 1;
            if self.cells[cell][i] != cand {
                let removed = self.cells[cell].remove(i);
                trail.record(cell, i, removed);
            }
        }

        let mut touched = Vec::new();
        for r in 0..self.rows {
            for c in 0..self.cols {
                let other = self.idx(r, c);
                if other == cell {
                    continue;
                }
                let mut removed_here = false;
                let mut i = self.cells[other].len();
                while i > 0 {
                    i -= 1;
                    if self.cells[other][i].piece == cand.piece {
                        let removed = self.cells[other].remove(i);
                        trail.record(other, i, removed);
                        removed_here = true;
                    }
                }
                if removed_here && board.is_empty(r, c) {
                    if self.cells[other].is_empty() {
                        return Err(Wipeout);
                    }
                    touched.push((r, c));
                }
            }
        }
        Ok(touched)
    }

    /// AC-3 seeded from the empty neighbors of one cell, the shape every
    /// placement triggers.
    pub fn propagate_from(
        &mut self,
        board: &Board,
        pieces: &PieceSet,
        row: usize,
        col: usize,
        trail: &mut Trail,
    ) -> Result<(), Wipeout> {
        let seeds: Vec<(usize, usize)> = DIRS
            .iter()
            .filter_map(|&d| board.neighbor(row, col, d))
            .filter(|&(r, c)| board.is_empty(r, c))
            .collect();
        self.propagate(board, pieces, &seeds, trail)
    }

    /// AC-3 worker: revise queued cells until quiescent, re-enqueueing
    /// the empty neighbors of any cell that shrank.
    pub fn propagate(
        &mut self,
        board: &Board,
        pieces: &PieceSet,
        seeds: &[(usize, usize)],
        trail: &mut Trail,
    ) -> Result<(), Wipeout> {
        let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
        let mut queued = vec![false; self.rows * self.cols];
        for &(row, col) in seeds {
            let cell = self.idx(row, col);
            if !queued[cell] && board.is_empty(row, col) {
                queued[cell] = true;
                queue.push_back((row, col));
            }
        }

        while let Some((row, col)) = queue.pop_front() {
            let cell = self.idx(row, col);
            queued[cell] = false;

            let mut removed_any = false;
            let mut i = 0;
            while i < self.cells[cell].len() {
                let cand = self.cells[cell][i];
                if self.supported(board, pieces, row, col, cand) {
                    i += 1;
                } else {
                    let removed = self.cells[cell].remove(i);
                    trail.record(cell, i, removed);
                    removed_any = true;
                }
            }
            if self.cells[cell].is_empty() {
                return Err(Wipeout);
            }
            if removed_any {
                for dir in DIRS {
                    if let Some((nr, nc)) = board.neighbor(row, col, dir) {
                        let neighbor = self.idx(nr, nc);
                        if board.is_empty(nr, nc) && !queued[neighbor] {
                            queued[neighbor] = true;
                            queue.push_back((nr, nc));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// True if every in-bounds neighbor's domain offers a matching facing
    /// color from a different piece.
    fn supported(
        &self,
        board: &Board,
        pieces: &PieceSet,
        row: usize,
        col: usize,
        cand: Cand,
    ) -> bool {
        let Some(piece) = pieces.get(cand.piece) else {
            return false;
        };
        for dir in DIRS {
            let Some((nr, nc)) = board.neighbor(row, col, dir) else {
                continue;
            };
            let color = piece.edge_at(cand.rotation, dir as usize);
            let opposite = dir.opposite() as usize;
            let supported = self.cells[self.idx(nr, nc)].iter().any(|other| {
                other.piece != cand.piece
                    && pieces
                        .get(other.piece)
                        .is_some_and(|p| p.edge_at(other.rotation, opposite) == color)
            });
            if !supported {
                return false;
            }
        }
        true
    }

    /// Re-inserts every removal logged since `mark`, newest first.
    pub fn restore(&mut self, trail: &mut Trail, mark: usize) {
        while trail.removals.len() > mark {
            if let Some(removal) = trail.removals.pop() {
                self.cells[removal.cell as usize].insert(removal.pos as usize, removal.cand);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pieces::Piece;

    /// 2x2 corner set where (0,1) admits a decoy branch that dead-ends.
    ///
    /// Piece 2 completes the board; piece 3 also fits at (0,1) but leaves
    /// (1,0) without any matching candidate.
    fn rigged_corners() -> PieceSet {
        PieceSet::new(vec![
            Piece::new(1, [0, 1, 2, 0]).unwrap(),
            Piece::new(2, [0, 3, 1, 0]).unwrap(),
            Piece::new(3, [0, 2, 1, 0]).unwrap(),
            Piece::new(4, [0, 1, 3, 0]).unwrap(),
        ])
        .unwrap()
    }

    struct Fixture {
        pieces: PieceSet,
        validator: Validator,
        board: Board,
        used: PieceBits,
        domains: Domains,
    }

    fn fixture() -> Fixture {
        let pieces = rigged_corners();
        let index = EdgeIndex::build(&pieces);
        let validator = Validator::new(&pieces);
        let board = Board::new(pieces.rows(), pieces.cols());
        let used = PieceBits::new(pieces.len());
        let mut domains = Domains::new(pieces.rows(), pieces.cols());
        domains
            .initialize(&board, &pieces, &index, &used, &validator)
            .unwrap();
        Fixture {
            pieces,
            validator,
            board,
            used,
            domains,
        }
    }

    #[test]
    fn test_initialize_pins_top_left_and_orders_domains() {
        let fx = fixture();
        // only the canonical corner may occupy (0, 0)
        assert!(fx.domains.get(0, 0).iter().all(|c| c.piece == 1));
        for row in 0..2 {
            for col in 0..2 {
                let domain = fx.domains.get(row, col);
                assert!(!domain.is_empty());
                assert!(domain.windows(2).all(|w| w[0].key() < w[1].key()));
                for cand in domain {
                    let piece = fx.pieces.get(cand.piece).unwrap();
                    assert!(fx.validator.fits(
                        &fx.board,
                        row,
                        col,
                        cand.piece,
                        &piece.edges_rotated(cand.rotation)
                    ));
                }
            }
        }
    }

    #[test]
    fn test_propagate_is_idempotent() {
        // initialization already reached the fixed point, so a fresh
        // sweep must remove nothing
        let mut fx = fixture();
        let mut trail = Trail::new();
        fx.domains
            .propagate_from(&fx.board, &fx.pieces, 0, 0, &mut trail)
            .unwrap();
        assert_eq!(trail.mark(), 0);
    }

    /// 2x2 corner set with identical colors: every cell but the pinned
    /// top-left keeps a three-wide domain, so placements really shrink
    /// something.
    fn wide_fixture() -> Fixture {
        let pieces = PieceSet::new(
            (1..=4u16)
                .map(|id| Piece::new(id, [0, 1, 1, 0]).unwrap())
                .collect(),
        )
        .unwrap();
        let index = EdgeIndex::build(&pieces);
        let validator = Validator::new(&pieces);
        let board = Board::new(2, 2);
        let used = PieceBits::new(4);
        let mut domains = Domains::new(2, 2);
        domains
            .initialize(&board, &pieces, &index, &used, &validator)
            .unwrap();
        Fixture {
            pieces,
            validator,
            board,
            used,
            domains,
        }
    }

    #[test]
    fn test_assign_then_restore_is_bit_identical() {
        let mut fx = wide_fixture();
        let mut trail = Trail::new();

        // commit the pinned corner; its singleton domain stays put
        let corner = fx.domains.get(0, 0)[0];
        fx.board
            .place(0, 0, fx.pieces.get(corner.piece).unwrap(), corner.rotation)
            .unwrap();
        fx.domains
            .assign(&fx.board, 0, 0, corner, &mut trail)
            .unwrap();
        fx.domains
            .propagate_from(&fx.board, &fx.pieces, 0, 0, &mut trail)
            .unwrap();

        let before = fx.domains.clone();
        let mark = trail.mark();
        assert_eq!(fx.domains.len_at(0, 1), 3);

        // placing piece 2 collapses (0, 1) and strips it elsewhere
        let cand = Cand {
            piece: 2,
            rotation: 1,
        };
        fx.board
            .place(0, 1, fx.pieces.get(2).unwrap(), 1)
            .unwrap();
        fx.domains
            .assign(&fx.board, 0, 1, cand, &mut trail)
            .unwrap();
        fx.domains
            .propagate_from(&fx.board, &fx.pieces, 0, 1, &mut trail)
            .unwrap();
        assert_ne!(fx.domains, before);
        assert_eq!(fx.domains.len_at(1, 0), 2);

        // a second propagation sweep right away finds nothing to do
        let settled = trail.mark();
        fx.domains
            .propagate_from(&fx.board, &fx.pieces, 0, 1, &mut trail)
            .unwrap();
        assert_eq!(trail.mark(), settled);

        fx.board.remove(0, 1);
        fx.domains.restore(&mut trail, mark);
        assert_eq!(fx.domains, before);
    }

    #[test]
    fn test_assign_rejects_candidate_outside_domain() {
        let mut fx = fixture();
        let mut trail = Trail::new();
        // piece 2 cannot sit at (0, 0): the corner rule pins it to piece 1
        let stranger = Cand {
            piece: 2,
            rotation: 0,
        };
        assert_eq!(
            fx.domains.assign(&fx.board, 0, 0, stranger, &mut trail),
            Err(Wipeout)
        );
    }

    #[test]
    fn test_decoy_branch_wipes_out() {
        let mut fx = fixture();
        let mut trail = Trail::new();

        // commit the forced corner first
        let corner = Cand {
            piece: 1,
            rotation: 0,
        };
        fx.board
            .place(0, 0, fx.pieces.get(1).unwrap(), 0)
            .unwrap();
        fx.used.set(1);
        fx.domains
            .assign(&fx.board, 0, 0, corner, &mut trail)
            .unwrap();
        fx.domains
            .propagate_from(&fx.board, &fx.pieces, 0, 0, &mut trail)
            .unwrap();

        // the decoy fits (0, 1) locally but leaves (1, 0) unsupported
        let decoy = Cand {
            piece: 3,
            rotation: 1,
        };
        fx.board
            .place(0, 1, fx.pieces.get(3).unwrap(), 1)
            .unwrap();
        let result = match fx.domains.assign(&fx.board, 0, 1, decoy, &mut trail) {
            Err(w) => Err(w),
            Ok(_) => fx
                .domains
                .propagate_from(&fx.board, &fx.pieces, 0, 1, &mut trail),
        };
        assert_eq!(result, Err(Wipeout));
    }
}
