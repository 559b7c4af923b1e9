//! Precomputed edge-compatibility lookup.
//!
//! For every direction, maps an edge color to the candidates, the
//! (piece, rotation) pairs that carry that color on that face. Built
//! once per puzzle from the full piece set and immutable afterward;
//! domain initialization seeds every cell from these lists instead of
//! scanning the whole piece set.

use rustc_hash::FxHashMap;

use crate::board::{Dir, DIRS};
use crate::pieces::{Color, PieceSet};

/// A candidate placement: one piece in one rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cand {
    /// Piece id (1-based).
    pub piece: u16,
    /// Quarter turns clockwise.
    pub rotation: u8,
}

impl Cand {
    /// Total order used wherever candidate lists are kept sorted.
    #[inline]
    pub fn key(self) -> u32 {
        self.piece as u32 * 4 + self.rotation as u32
    }
}

/// Direction-keyed maps from edge color to ordered candidate lists.
#[derive(Debug)]
pub struct EdgeIndex {
    by_dir: [FxHashMap<Color, Vec<Cand>>; 4],
}

impl EdgeIndex {
    /// Enumerates every (piece, rotation) pair into the four maps.
    ///
    /// Iterating pieces in id order and rotations 0..4 makes every list
    /// come out sorted by [`Cand::key`].
    pub fn build(pieces: &PieceSet) -> Self {
        let mut by_dir: [FxHashMap<Color, Vec<Cand>>; 4] = Default::default();
        for piece in pieces.iter() {
            for rotation in 0..4u8 {
                let edges = piece.edges_rotated(rotation);
                for dir in DIRS {
                    by_dir[dir as usize]
                        .entry(edges[dir as usize])
                        .or_default()
                        .push(Cand {
                            piece: piece.id(),
                            rotation,
                        });
                }
            }
        }
        Self { by_dir }
    }

    /// Candidates carrying `color` on the face at `dir`. An empty result
    /// is legal and means no piece can present that color there.
    #[inline]
    pub fn compatible(&self, dir: Dir, color: Color) -> &[Cand] {
        self.by_dir[dir as usize]
            .get(&color)
            .map_or(&[], |list| list.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pieces::{Piece, BORDER};

    fn corner_set() -> PieceSet {
        PieceSet::new(
            (1..=4u16)
                .map(|id| Piece::new(id, [0, id as u8, id as u8, 0]).unwrap())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_every_pair_is_indexed_once_per_direction() {
        let set = corner_set();
        let index = EdgeIndex::build(&set);
        for dir in DIRS {
            let total: usize = (0..=4)
                .map(|color| index.compatible(dir, color).len())
                .sum();
            // 4 pieces x 4 rotations
            assert_eq!(total, 16);
        }
    }

    #[test]
    fn test_border_lookup_finds_rotations_with_zero_on_face() {
        let set = corner_set();
        let index = EdgeIndex::build(&set);
        // each corner piece shows 0 at north in exactly two rotations
        let north_border = index.compatible(Dir::North, BORDER);
        assert_eq!(north_border.len(), 8);
        assert!(north_border
            .iter()
            .all(|cand| set
                .get(cand.piece)
                .unwrap()
                .edge_at(cand.rotation, Dir::North as usize)
                == BORDER));
    }

    #[test]
    fn test_lists_are_key_ordered_and_missing_color_is_empty() {
        let set = corner_set();
        let index = EdgeIndex::build(&set);
        for dir in DIRS {
            for color in 0..=5u8 {
                let list = index.compatible(dir, color);
                assert!(list.windows(2).all(|w| w[0].key() < w[1].key()));
            }
        }
        assert!(index.compatible(Dir::South, 200).is_empty());
    }
}
