//! Placement validation: border rules, neighbor matching, and the
//! corner-based symmetry break.
//!
//! The board's symmetry group (rotations and reflections of the square)
//! would otherwise make the solver visit every solution up to eight
//! times. Pinning the top-left corner to the lowest-id corner piece and
//! requiring the other corners to carry ids no smaller than it removes
//! three quarters of the duplicate root branches while keeping at least
//! one representative of every solution class.

use crate::board::{Board, DIRS};
use crate::pieces::{Color, PieceSet, BORDER};

/// Pure fit predicate for one oriented piece at one cell.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    min_corner_id: u16,
}

impl Validator {
    /// Captures the canonical corner id from the piece set.
    pub fn new(pieces: &PieceSet) -> Self {
        Self {
            min_corner_id: pieces.min_corner_id(),
        }
    }

    /// Border and neighbor rules only, no symmetry constraint.
    ///
    /// Checks in order, failing fast: every border side must carry the
    /// border color and every internal side must not; then every filled
    /// orthogonal neighbor must present an equal facing color.
    pub fn edges_fit(board: &Board, row: usize, col: usize, edges: &[Color; 4]) -> bool {
        for dir in DIRS {
            let color = edges[dir as usize];
            if board.is_border_side(row, col, dir) {
                if color != BORDER {
                    return false;
                }
            } else if color == BORDER {
                return false;
            }
        }
        for dir in DIRS {
            if let Some((nr, nc)) = board.neighbor(row, col, dir) {
                if let Some(neighbor) = board.get(nr, nc) {
                    if neighbor.edges[dir.opposite() as usize] != edges[dir as usize] {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Full fit predicate: border, neighbors, then the corner rule.
    pub fn fits(
        &self,
        board: &Board,
        row: usize,
        col: usize,
        piece: u16,
        edges: &[Color; 4],
    ) -> bool {
        Self::edges_fit(board, row, col, edges) && self.corner_rule_ok(board, row, col, piece)
    }

    /// The symmetry break. The top-left corner takes exactly the lowest
    /// corner id; the other three corners take ids no smaller than it.
    ///
    /// Rule one pins (0, 0) to `min_corner_id`, so comparing the other
    /// corners against that id is the same as comparing against whatever
    /// sits at (0, 0) and stays well-defined while (0, 0) is empty.
    fn corner_rule_ok(&self, board: &Board, row: usize, col: usize, piece: u16) -> bool {
        let last_row = board.rows() - 1;
        let last_col = board.cols() - 1;
        if (row != 0 && row != last_row) || (col != 0 && col != last_col) {
            return true;
        }
        if row == 0 && col == 0 {
            piece == self.min_corner_id
        } else {
            piece >= self.min_corner_id
        }
    }
}
