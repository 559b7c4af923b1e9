//! Forced-move detection.
//!
//! Two sweeps alternate until neither makes progress: any empty cell
//! whose domain holds a single candidate is filled with it, and any
//! unused piece with exactly one fitting (cell, rotation) goes there.
//! Forced moves cost nothing to take and would only inflate the
//! branching factor if deferred.

use crate::error::Wipeout;
use crate::index::Cand;
use crate::solver::Engine;

/// Runs both sweeps to a fixed point. Returns the number of placements
/// made; a propagation wipeout during a forced placement aborts the
/// whole branch.
pub(crate) fn run(eng: &mut Engine) -> Result<usize, Wipeout> {
    let mut placed_total = 0;
    loop {
        let placed_this_pass =
            force_position_singletons(eng)? + force_piece_singletons(eng)?;
        if placed_this_pass == 0 {
            return Ok(placed_total);
        }
        placed_total += placed_this_pass;
    }
}

/// Fills every empty cell whose domain has shrunk to one candidate.
fn force_position_singletons(eng: &mut Engine) -> Result<usize, Wipeout> {
    let rows = eng.board.rows();
    let cols = eng.board.cols();
    let mut placed = 0;
    loop {
        let mut found = None;
        'scan: for row in 0..rows {
            for col in 0..cols {
                if eng.board.is_empty(row, col) && eng.domains.len_at(row, col) == 1 {
                    found = Some((row, col, eng.domains.get(row, col)[0]));
                    break 'scan;
                }
            }
        }
        let Some((row, col, cand)) = found else {
            return Ok(placed);
        };
        log::trace!("forcing ({row}, {col}) to piece {}", cand.piece);
        eng.place_candidate(row, col, cand)?;
        eng.stats.singletons += 1;
        placed += 1;
    }
}

/// Places every unused piece that has exactly one fitting spot. A piece
/// with no fitting spot at all proves the branch dead.
fn force_piece_singletons(eng: &mut Engine) -> Result<usize, Wipeout> {
    let rows = eng.board.rows();
    let cols = eng.board.cols();
    let mut placed = 0;
    let ids: Vec<u16> = eng.used.unused_ids().collect();
    for id in ids {
        // an earlier forced move in this pass may have used the piece
        if eng.used.contains(id) {
            continue;
        }
        let Some(piece) = eng.pieces.get(id).copied() else {
            continue;
        };

        let mut fit_count = 0;
        let mut unique = None;
        'cells: for row in 0..rows {
            for col in 0..cols {
                if !eng.board.is_empty(row, col) {
                    continue;
                }
                for rotation in 0..4u8 {
                    eng.stats.fit_checks += 1;
                    if eng
                        .validator
                        .fits(&eng.board, row, col, id, &piece.edges_rotated(rotation))
                    {
                        fit_count += 1;
                        if fit_count > 1 {
                            unique = None;
                            break 'cells;
                        }
                        unique = Some((row, col, rotation));
                    }
                }
            }
        }

        match (fit_count, unique) {
            (0, _) => {
                log::trace!("piece {id} fits nowhere");
                return Err(Wipeout);
            }
            (1, Some((row, col, rotation))) => {
                log::trace!("forcing piece {id} to its only spot ({row}, {col})");
                eng.place_candidate(row, col, Cand { piece: id, rotation })?;
                eng.stats.singletons += 1;
                placed += 1;
            }
            _ => {}
        }
    }
    Ok(placed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::fixtures::{engine_for, same_color_corners, unique_grid};
    use crate::solver::SolveOptions;

    fn prepared_engine(pieces: crate::pieces::PieceSet) -> Engine {
        let mut eng = engine_for(
            pieces,
            SolveOptions {
                use_singletons: false,
                ..SolveOptions::default()
            },
        );
        assert!(eng.prepare());
        eng
    }

    #[test]
    fn test_cascade_fills_distinct_grid_after_one_seed() {
        let mut eng = prepared_engine(unique_grid(3, 3));
        let corner = eng.domains.get(0, 0)[0];
        eng.place_candidate(0, 0, corner).unwrap();

        let placed = run(&mut eng).unwrap();
        assert_eq!(placed, 8);
        assert!(eng.board.is_full());
        assert_eq!(eng.stats.singletons, 8);
    }

    #[test]
    fn test_run_is_idempotent() {
        let mut eng = prepared_engine(unique_grid(3, 3));
        let first = run(&mut eng).unwrap();
        assert!(first > 0);
        assert_eq!(run(&mut eng), Ok(0));
    }

    #[test]
    fn test_position_singleton_fires_for_the_pinned_corner() {
        // (0, 0) is the only one-wide domain; the other cells stay three
        // wide, so exactly one forced move happens
        let mut eng = prepared_engine(same_color_corners());
        let placed = force_position_singletons(&mut eng).unwrap();
        assert_eq!(placed, 1);
        assert_eq!(eng.board.get(0, 0).unwrap().piece, 1);
    }

    #[test]
    fn test_piece_singleton_forces_the_last_hole() {
        let mut eng = prepared_engine(unique_grid(3, 3));
        for (row, col) in [(0, 0), (0, 1), (0, 2), (1, 0), (1, 2), (2, 0), (2, 1), (2, 2)] {
            let cand = eng.domains.get(row, col)[0];
            eng.place_candidate(row, col, cand).unwrap();
        }
        assert!(eng.board.is_empty(1, 1));

        // with all four neighbors filled, the center piece has exactly
        // one fitting (cell, rotation) left
        let placed = force_piece_singletons(&mut eng).unwrap();
        assert_eq!(placed, 1);
        assert_eq!(eng.board.get(1, 1).unwrap().piece, 5);
        assert!(eng.stats.fit_checks > 0);
    }

    #[test]
    fn test_counts_come_back_to_the_caller() {
        let mut eng = prepared_engine(unique_grid(4, 4));
        let placed = run(&mut eng).unwrap();
        assert_eq!(placed, 16);
        assert_eq!(eng.stats.singletons, 16);
        assert!(eng.board.is_full());
    }
}
