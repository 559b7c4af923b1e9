//! Piece definitions, rotation math, and puzzle-file parsing.
//!
//! A piece is four edge colors in canonical N, E, S, W order. Color 0 is
//! reserved for the outer border: it must appear on every edge that lies
//! against the board perimeter and on no internal edge. Rotating a piece
//! by `r` quarter turns clockwise moves the color at index `i` to index
//! `(i + r) % 4`.

use crate::error::{Result, SolverError};

/// An edge color. 0 is the border color.
pub type Color = u8;

/// The reserved border color.
pub const BORDER: Color = 0;

/// Classification of a piece by its border-edge count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceKind {
    /// Two adjacent border edges; sits in a board corner.
    Corner,
    /// One border edge; sits on the board rim.
    Edge,
    /// No border edges.
    Interior,
}

/// An immutable puzzle piece: identity plus four edge colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    id: u16,
    edges: [Color; 4],
}

impl Piece {
    /// Creates a piece from an id (1-based) and canonical N, E, S, W edges.
    pub fn new(id: u16, edges: [Color; 4]) -> Result<Self> {
        if id == 0 {
            return Err(SolverError::InvalidInput(
                "piece ids start at 1".to_string(),
            ));
        }
        Ok(Self { id, edges })
    }

    /// Creates a piece from raw parsed integers, validating shape and range.
    pub fn from_raw(id: u16, edges: &[i64]) -> Result<Self> {
        if edges.len() != 4 {
            return Err(SolverError::InvalidInput(format!(
                "piece {} has {} edges, expected 4",
                id,
                edges.len()
            )));
        }
        let mut out = [0u8; 4];
        for (slot, &value) in out.iter_mut().zip(edges) {
            if !(0..=Color::MAX as i64).contains(&value) {
                return Err(SolverError::InvalidInput(format!(
                    "piece {id} has edge color {value} outside 0..={}",
                    Color::MAX
                )));
            }
            *slot = value as Color;
        }
        Self::new(id, out)
    }

    /// The piece id (1-based).
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The unrotated edge colors in N, E, S, W order.
    #[inline]
    pub fn edges(&self) -> [Color; 4] {
        self.edges
    }

    /// The color facing direction `dir` after `rotation` quarter turns
    /// clockwise: `rotated[j] = edges[(j + 4 - r) % 4]`.
    #[inline]
    pub fn edge_at(&self, rotation: u8, dir: usize) -> Color {
        debug_assert!(rotation < 4 && dir < 4);
        self.edges[(dir + 4 - rotation as usize) % 4]
    }

    /// All four edge colors after `rotation` quarter turns clockwise.
    #[inline]
    pub fn edges_rotated(&self, rotation: u8) -> [Color; 4] {
        let r = rotation as usize % 4;
        let e = self.edges;
        [e[(4 - r) % 4], e[(5 - r) % 4], e[(6 - r) % 4], e[(7 - r) % 4]]
    }

    /// Number of border-colored edges.
    #[inline]
    pub fn border_count(&self) -> usize {
        self.edges.iter().filter(|&&e| e == BORDER).count()
    }

    /// Classifies the piece by its border-edge count.
    ///
    /// Assumes no piece carries two opposite border edges; `PieceSet`
    /// construction rejects such pieces.
    pub fn kind(&self) -> PieceKind {
        match self.border_count() {
            2 => PieceKind::Corner,
            1 => PieceKind::Edge,
            _ => PieceKind::Interior,
        }
    }

    /// True if the two border edges (if any) sit on adjacent sides.
    fn border_edges_adjacent(&self) -> bool {
        let zeros: Vec<usize> = (0..4).filter(|&i| self.edges[i] == BORDER).collect();
        match zeros.as_slice() {
            [a, b] => b - a == 1 || (*a, *b) == (0, 3),
            _ => true,
        }
    }
}

/// The full piece multiset for one puzzle, with inferred grid dimensions.
///
/// Ids are 1-based and dense: piece `k` lives at `pieces[k - 1]`.
#[derive(Debug, Clone)]
pub struct PieceSet {
    pieces: Vec<Piece>,
    rows: usize,
    cols: usize,
    min_corner_id: u16,
}

impl PieceSet {
    /// Builds a piece set, checking id density and border-edge sanity,
    /// enforcing the corner/edge/interior cardinality invariant, and
    /// inferring the grid dimensions from the multiset.
    pub fn new(mut pieces: Vec<Piece>) -> Result<Self> {
        if pieces.is_empty() {
            return Err(SolverError::InvalidPuzzle("no pieces".to_string()));
        }
        pieces.sort_by_key(|p| p.id);
        for window in pieces.windows(2) {
            if window[0].id == window[1].id {
                return Err(SolverError::InvalidPuzzle(format!(
                    "duplicate piece id {}",
                    window[0].id
                )));
            }
        }
        // Ids must be exactly 1..=n so the used bit-set and the save
        // format can index pieces densely.
        if pieces[0].id != 1 || pieces[pieces.len() - 1].id as usize != pieces.len() {
            return Err(SolverError::InvalidPuzzle(format!(
                "piece ids must be dense 1..={}",
                pieces.len()
            )));
        }

        let mut corners = 0usize;
        let mut rim = 0usize;
        let mut min_corner_id = u16::MAX;
        for piece in &pieces {
            if piece.border_count() > 2 || !piece.border_edges_adjacent() {
                return Err(SolverError::InvalidPuzzle(format!(
                    "piece {} has an impossible border-edge pattern",
                    piece.id
                )));
            }
            match piece.kind() {
                PieceKind::Corner => {
                    corners += 1;
                    min_corner_id = min_corner_id.min(piece.id);
                }
                PieceKind::Edge => rim += 1,
                PieceKind::Interior => {}
            }
        }
        if corners != 4 {
            return Err(SolverError::InvalidPuzzle(format!(
                "expected 4 corner pieces, found {corners}"
            )));
        }

        let (rows, cols) = infer_dims(pieces.len(), rim)?;
        Ok(Self {
            pieces,
            rows,
            cols,
            min_corner_id,
        })
    }

    /// Parses puzzle text. `#` begins a comment; blank lines are skipped.
    ///
    /// Two line forms are accepted, chosen by the first data line:
    /// - standard: `<id> <N> <E> <S> <W>` (5 fields)
    /// - Eternity-II: `<N> <S> <W> <E>` (4 fields, ids assigned 1..n)
    pub fn parse(text: &str) -> Result<Self> {
        let mut pieces = Vec::new();
        let mut field_count: Option<usize> = None;

        for (line_no, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let fields: Vec<i64> = line
                .split_whitespace()
                .map(|tok| {
                    tok.parse::<i64>().map_err(|_| {
                        SolverError::InvalidPuzzle(format!(
                            "line {}: non-integer field {tok:?}",
                            line_no + 1
                        ))
                    })
                })
                .collect::<Result<_>>()?;
            if fields.is_empty() {
                continue;
            }

            let expected = *field_count.get_or_insert(fields.len());
            if fields.len() != expected || !(4..=5).contains(&expected) {
                return Err(SolverError::InvalidPuzzle(format!(
                    "line {}: expected {expected} fields, found {}",
                    line_no + 1,
                    fields.len()
                )));
            }

            let piece = if expected == 5 {
                let id = u16::try_from(fields[0]).map_err(|_| {
                    SolverError::InvalidPuzzle(format!(
                        "line {}: piece id {} out of range",
                        line_no + 1,
                        fields[0]
                    ))
                })?;
                Piece::from_raw(id, &fields[1..])
            } else {
                // Eternity-II order is N S W E; map into canonical N E S W.
                let id = pieces.len() as u16 + 1;
                Piece::from_raw(id, &[fields[0], fields[3], fields[1], fields[2]])
            }
            .map_err(|e| SolverError::InvalidPuzzle(format!("line {}: {e}", line_no + 1)))?;
            pieces.push(piece);
        }

        Self::new(pieces)
    }

    /// Loads and parses a puzzle file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Number of pieces.
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    /// True if the set holds no pieces (never after construction).
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Piece lookup by 1-based id.
    #[inline]
    pub fn get(&self, id: u16) -> Option<&Piece> {
        if id == 0 {
            return None;
        }
        self.pieces.get(id as usize - 1)
    }

    /// All pieces in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Piece> {
        self.pieces.iter()
    }

    /// Inferred board rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Inferred board columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Smallest id among corner pieces; the canonical top-left piece.
    pub fn min_corner_id(&self) -> u16 {
        self.min_corner_id
    }
}

/// Recovers (rows, cols) from the multiset: `rim = 2(R+C) - 8` rim pieces
/// and `R·C = n` pieces in total, so R and C are the roots of
/// `x^2 - s·x + n` with `s = (rim + 8) / 2`.
fn infer_dims(total: usize, rim: usize) -> Result<(usize, usize)> {
    let err = || {
        SolverError::InvalidPuzzle(format!(
            "piece counts do not form a rectangle ({total} pieces, {rim} rim pieces)"
        ))
    };
    if rim % 2 != 0 {
        return Err(err());
    }
    let s = (rim + 8) / 2;
    let disc = (s * s).checked_sub(4 * total).ok_or_else(err)?;
    let root = disc.isqrt();
    if root * root != disc || (s - root) % 2 != 0 {
        return Err(err());
    }
    let rows = (s - root) / 2;
    let cols = s - rows;
    if rows < 2 || rows * cols != total {
        return Err(err());
    }
    Ok((rows, cols))
}

/// A bit-set over piece ids, tracking which pieces are on the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBits {
    blocks: Vec<u64>,
    len: usize,
}

impl PieceBits {
    /// An empty set sized for `len` pieces (ids 1..=len).
    pub fn new(len: usize) -> Self {
        Self {
            blocks: vec![0; len.div_ceil(64)],
            len,
        }
    }

    #[inline]
    fn slot(id: u16) -> (usize, u64) {
        let bit = id as usize - 1;
        (bit / 64, 1u64 << (bit % 64))
    }

    /// Marks a piece used.
    #[inline]
    pub fn set(&mut self, id: u16) {
        let (block, mask) = Self::slot(id);
        self.blocks[block] |= mask;
    }

    /// Marks a piece unused.
    #[inline]
    pub fn clear(&mut self, id: u16) {
        let (block, mask) = Self::slot(id);
        self.blocks[block] &= !mask;
    }

    /// True if the piece is used.
    #[inline]
    pub fn contains(&self, id: u16) -> bool {
        let (block, mask) = Self::slot(id);
        self.blocks[block] & mask != 0
    }

    /// Number of used pieces.
    pub fn count(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Capacity in pieces.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no piece is used.
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|&b| b == 0)
    }

    /// Ids of pieces not currently used, ascending.
    pub fn unused_ids(&self) -> impl Iterator<Item = u16> + '_ {
        (1..=self.len as u16).filter(move |&id| !self.contains(id))
    }

    /// LSB-first byte encoding: bit `k` set iff piece `k + 1` is used.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.len.div_ceil(8)];
        for id in 1..=self.len as u16 {
            if self.contains(id) {
                let bit = id as usize - 1;
                bytes[bit / 8] |= 1 << (bit % 8);
            }
        }
        bytes
    }

    /// Decodes the LSB-first byte form produced by [`PieceBits::to_bytes`].
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bits = Self::new(len);
        for id in 1..=len as u16 {
            let bit = id as usize - 1;
            if bytes
                .get(bit / 8)
                .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
            {
                bits.set(id);
            }
        }
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_moves_edges_clockwise() {
        let piece = Piece::new(1, [1, 2, 3, 4]).unwrap();
        assert_eq!(piece.edges_rotated(0), [1, 2, 3, 4]);
        // one clockwise quarter turn: the old north color faces east
        assert_eq!(piece.edges_rotated(1), [4, 1, 2, 3]);
        assert_eq!(piece.edges_rotated(2), [3, 4, 1, 2]);
        assert_eq!(piece.edges_rotated(3), [2, 3, 4, 1]);
    }

    #[test]
    fn test_edge_at_matches_edges_rotated() {
        let piece = Piece::new(7, [5, 0, 9, 2]).unwrap();
        for rot in 0..4u8 {
            let rotated = piece.edges_rotated(rot);
            for dir in 0..4 {
                assert_eq!(piece.edge_at(rot, dir), rotated[dir]);
            }
        }
    }

    #[test]
    fn test_piece_classification() {
        assert_eq!(
            Piece::new(1, [0, 1, 2, 0]).unwrap().kind(),
            PieceKind::Corner
        );
        assert_eq!(Piece::new(2, [0, 1, 2, 3]).unwrap().kind(), PieceKind::Edge);
        assert_eq!(
            Piece::new(3, [4, 1, 2, 3]).unwrap().kind(),
            PieceKind::Interior
        );
    }

    #[test]
    fn test_from_raw_rejects_bad_shapes() {
        assert!(Piece::from_raw(1, &[1, 2, 3]).is_err());
        assert!(Piece::from_raw(1, &[1, 2, 3, -1]).is_err());
        assert!(Piece::from_raw(1, &[1, 2, 3, 999]).is_err());
        assert!(Piece::from_raw(0, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_parse_standard_form() {
        let set = PieceSet::parse(
            "# 2x2 of corners\n\
             1 0 1 1 0\n\
             2 0 1 1 0\n\
             3 0 1 1 0\n\
             4 0 1 1 0\n",
        )
        .unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!((set.rows(), set.cols()), (2, 2));
        assert_eq!(set.min_corner_id(), 1);
    }

    #[test]
    fn test_parse_eternity_form_reorders_edges() {
        // N S W E input order maps to canonical N E S W
        let set = PieceSet::parse(
            "0 1 1 0\n\
             0 1 1 0\n\
             0 1 1 0\n\
             0 1 1 0\n",
        )
        .unwrap();
        assert_eq!(set.get(1).unwrap().edges(), [0, 0, 1, 1]);
    }

    #[test]
    fn test_parse_rejects_mixed_and_malformed_lines() {
        assert!(PieceSet::parse("1 0 1 1 0\n2 0 1 1\n").is_err());
        assert!(PieceSet::parse("1 0 x 1 0\n").is_err());
        assert!(PieceSet::parse("1 0 1 1 0\n1 0 1 1 0\n").is_err());
    }

    #[test]
    fn test_cardinality_invariant_enforced() {
        // three corners and an interior piece cannot tile any rectangle
        let result = PieceSet::parse(
            "1 0 1 1 0\n\
             2 0 1 1 0\n\
             3 0 1 1 0\n\
             4 1 1 1 1\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_infer_dims_rectangles() {
        // 3x4: 4 corners, 2*(3+4)-8 = 6 rim, 2 interior
        assert_eq!(infer_dims(12, 6).unwrap(), (3, 4));
        assert_eq!(infer_dims(4, 0).unwrap(), (2, 2));
        assert_eq!(infer_dims(256, 56).unwrap(), (16, 16));
        assert!(infer_dims(12, 5).is_err());
    }

    #[test]
    fn test_piece_bits_roundtrip() {
        let mut bits = PieceBits::new(20);
        for id in [1u16, 3, 8, 9, 17, 20] {
            bits.set(id);
        }
        bits.clear(8);
        assert_eq!(bits.count(), 5);
        assert!(bits.contains(9));
        assert!(!bits.contains(8));

        let decoded = PieceBits::from_bytes(&bits.to_bytes(), 20);
        assert_eq!(decoded, bits);
        assert_eq!(decoded.unused_ids().count() + decoded.count(), 20);
    }
}
