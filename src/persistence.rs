//! Two-tier save persistence for long-running solves.
//!
//! Per puzzle name the manager keeps:
//! - `<name>_current`, overwritten on every tick through a temp file and
//!   an atomic rename so power loss never leaves a torn file;
//! - up to K `<name>_best_<depth>` milestone files, written at most once
//!   per depth and pruned from the shallow end.
//!
//! Binary format (little endian):
//! - u32 magic `0x45544552` ("ETER")
//! - u32 version (currently 1)
//! - u64 timestamp, milliseconds since epoch
//! - u32 rows, u32 cols
//! - u32 placement count
//! - per placement: u16 row, u16 col, u16 piece id, u8 rotation
//! - u32 bit-set byte length, then that many bytes, LSB first, bit k set
//!   iff piece k+1 is on the board
//!
//! A legacy line-oriented text format is accepted on load, recognized by
//! the missing magic.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::board::{Board, PlacementEvent, PlacementOrder};
use crate::error::{Result, SolverError};
use crate::pieces::{PieceBits, PieceSet};

const MAGIC: u32 = 0x4554_4552;
const VERSION: u32 = 1;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A snapshot of one worker's progress: the chronological placements plus
/// the used-piece bit-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveState {
    /// Puzzle name the snapshot belongs to.
    pub puzzle: String,
    /// Board rows; 0 when the legacy text format left it implicit.
    pub rows: u32,
    /// Board columns; 0 when the legacy text format left it implicit.
    pub cols: u32,
    /// Capture time, milliseconds since epoch (binary format only).
    pub timestamp_ms: u64,
    /// Accumulated compute time across resumed runs (text format only).
    pub compute_ms: u64,
    /// Insertions in board order.
    pub placements: PlacementOrder,
    /// LSB-first used bits, bit k for piece k+1.
    pub used_bytes: Vec<u8>,
    /// Total piece count when known exactly (text format).
    pub total_pieces: Option<u32>,
}

impl SaveState {
    /// Captures the current worker state, stamped with the wall clock.
    pub fn capture(
        puzzle: &str,
        rows: usize,
        cols: usize,
        order: &PlacementOrder,
        used: &PieceBits,
        compute_ms: u64,
    ) -> Self {
        Self {
            puzzle: puzzle.to_string(),
            rows: rows as u32,
            cols: cols as u32,
            timestamp_ms: now_ms(),
            compute_ms,
            placements: order.clone(),
            used_bytes: used.to_bytes(),
            total_pieces: Some(used.len() as u32),
        }
    }

    /// Number of recorded placements.
    pub fn depth(&self) -> usize {
        self.placements.len()
    }

    /// True if the bit for `piece` is set.
    pub fn is_used(&self, piece: u16) -> bool {
        let bit = piece as usize - 1;
        self.used_bytes
            .get(bit / 8)
            .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
    }

    /// Dispatches on the magic: binary when present, legacy text
    /// otherwise.
    pub fn decode(bytes: &[u8], puzzle: &str) -> Result<Self> {
        if bytes.len() >= 4 && bytes[..4] == MAGIC.to_le_bytes() {
            Self::decode_binary(bytes, puzzle)
        } else {
            let text = std::str::from_utf8(bytes).map_err(|_| {
                SolverError::CorruptSave("neither binary magic nor utf-8 text".to_string())
            })?;
            Self::decode_text(text, puzzle)
        }
    }

    /// Encodes the binary form.
    pub fn encode_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28 + self.placements.len() * 7 + self.used_bytes.len());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&self.rows.to_le_bytes());
        out.extend_from_slice(&self.cols.to_le_bytes());
        out.extend_from_slice(&(self.placements.len() as u32).to_le_bytes());
        for event in &self.placements {
            out.extend_from_slice(&event.row.to_le_bytes());
            out.extend_from_slice(&event.col.to_le_bytes());
            out.extend_from_slice(&event.piece.to_le_bytes());
            out.push(event.rotation);
        }
        out.extend_from_slice(&(self.used_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.used_bytes);
        out
    }

    fn decode_binary(bytes: &[u8], puzzle: &str) -> Result<Self> {
        let mut reader = Reader { bytes: &bytes[4..] };
        let version = reader.u32()?;
        if version != VERSION {
            return Err(SolverError::CorruptSave(format!(
                "unsupported save version {version}"
            )));
        }
        let timestamp_ms = reader.u64()?;
        let rows = reader.u32()?;
        let cols = reader.u32()?;
        let count = reader.u32()? as usize;
        let mut placements = Vec::with_capacity(count);
        for _ in 0..count {
            let row = reader.u16()?;
            let col = reader.u16()?;
            let piece = reader.u16()?;
            let rotation = reader.u8()?;
            if piece == 0 || rotation > 3 {
                return Err(SolverError::CorruptSave(format!(
                    "bad placement record ({row}, {col}) piece {piece} rot {rotation}"
                )));
            }
            placements.push(PlacementEvent {
                row,
                col,
                piece,
                rotation,
            });
        }
        let bitset_len = reader.u32()? as usize;
        let used_bytes = reader.take(bitset_len)?.to_vec();
        Ok(Self {
            puzzle: puzzle.to_string(),
            rows,
            cols,
            timestamp_ms,
            compute_ms: 0,
            placements,
            used_bytes,
            total_pieces: None,
        })
    }

    /// Encodes the legacy text form.
    pub fn encode_text(&self) -> String {
        let total = self
            .total_pieces
            .map_or(self.used_bytes.len() * 8, |t| t as usize);
        let mut out = String::new();
        out.push_str(&format!("# Puzzle: {}\n", self.puzzle));
        out.push_str(&format!("# Depth: {}\n", self.placements.len()));
        out.push_str(&format!("# TotalComputeTimeMs: {}\n", self.compute_ms));
        out.push_str("PLACEMENTS\n");
        for event in &self.placements {
            out.push_str(&format!(
                "{},{} {} {}\n",
                event.row, event.col, event.piece, event.rotation
            ));
        }
        out.push_str("END_PLACEMENTS\n");
        out.push_str("UNUSED\n");
        for id in 1..=total as u16 {
            if !self.is_used(id) {
                out.push_str(&format!("{id}\n"));
            }
        }
        out.push_str("END_UNUSED\n");
        out
    }

    fn decode_text(text: &str, puzzle: &str) -> Result<Self> {
        #[derive(Clone, Copy, PartialEq)]
        enum Section {
            Preamble,
            Placements,
            BetweenSections,
            Unused,
            Done,
        }
        let corrupt = |line_no: usize, what: &str| {
            SolverError::CorruptSave(format!("line {}: {what}", line_no + 1))
        };

        let mut section = Section::Preamble;
        let mut placements: PlacementOrder = Vec::new();
        let mut unused: Vec<u16> = Vec::new();
        let mut name = puzzle.to_string();
        let mut compute_ms = 0u64;

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                let comment = comment.trim();
                if let Some(value) = comment.strip_prefix("Puzzle:") {
                    name = value.trim().to_string();
                } else if let Some(value) = comment.strip_prefix("TotalComputeTimeMs:") {
                    compute_ms = value
                        .trim()
                        .parse()
                        .map_err(|_| corrupt(line_no, "bad TotalComputeTimeMs"))?;
                }
                continue;
            }
            match section {
                Section::Preamble => {
                    if line != "PLACEMENTS" {
                        return Err(corrupt(line_no, "expected PLACEMENTS"));
                    }
                    section = Section::Placements;
                }
                Section::Placements => {
                    if line == "END_PLACEMENTS" {
                        section = Section::BetweenSections;
                        continue;
                    }
                    let fields: Vec<&str> = line.split_whitespace().collect();
                    if fields.len() != 3 {
                        return Err(corrupt(line_no, "expected `row,col piece rotation`"));
                    }
                    // reject space-separated coordinates outright
                    let Some((row_str, col_str)) = fields[0].split_once(',') else {
                        return Err(corrupt(line_no, "coordinates must be comma-separated"));
                    };
                    let row: u16 = row_str
                        .parse()
                        .map_err(|_| corrupt(line_no, "bad row"))?;
                    let col: u16 = col_str
                        .parse()
                        .map_err(|_| corrupt(line_no, "bad col"))?;
                    let piece: u16 = fields[1]
                        .parse()
                        .map_err(|_| corrupt(line_no, "bad piece id"))?;
                    let rotation: u8 = fields[2]
                        .parse()
                        .map_err(|_| corrupt(line_no, "bad rotation"))?;
                    if piece == 0 || rotation > 3 {
                        return Err(corrupt(line_no, "piece id or rotation out of range"));
                    }
                    placements.push(PlacementEvent {
                        row,
                        col,
                        piece,
                        rotation,
                    });
                }
                Section::BetweenSections => {
                    if line != "UNUSED" {
                        return Err(corrupt(line_no, "expected UNUSED"));
                    }
                    section = Section::Unused;
                }
                Section::Unused => {
                    if line == "END_UNUSED" {
                        section = Section::Done;
                        continue;
                    }
                    let id: u16 = line
                        .parse()
                        .map_err(|_| corrupt(line_no, "bad unused piece id"))?;
                    if id == 0 {
                        return Err(corrupt(line_no, "unused piece id out of range"));
                    }
                    unused.push(id);
                }
                Section::Done => {
                    return Err(corrupt(line_no, "trailing content after END_UNUSED"));
                }
            }
        }
        if section != Section::Done {
            return Err(SolverError::CorruptSave("truncated text save".to_string()));
        }

        let total = placements.len() + unused.len();
        let mut used = PieceBits::new(total);
        for event in &placements {
            if event.piece as usize > total {
                return Err(SolverError::CorruptSave(format!(
                    "placed piece {} exceeds piece count {total}",
                    event.piece
                )));
            }
            if used.contains(event.piece) {
                return Err(SolverError::CorruptSave(format!(
                    "piece {} placed twice",
                    event.piece
                )));
            }
            used.set(event.piece);
        }
        for &id in &unused {
            if id as usize > total || used.contains(id) {
                return Err(SolverError::CorruptSave(format!(
                    "piece {id} is both placed and unused"
                )));
            }
            // mark transiently to catch duplicate unused entries
            used.set(id);
        }
        // drop the transient marks again
        for &id in &unused {
            used.clear(id);
        }

        Ok(Self {
            puzzle: name,
            rows: 0,
            cols: 0,
            timestamp_ms: 0,
            compute_ms,
            placements,
            used_bytes: used.to_bytes(),
            total_pieces: Some(total as u32),
        })
    }

    /// Replays the snapshot onto a fresh board, verifying the invariants:
    /// dimensions, valid and unique piece ids, used bits agreeing with
    /// the placements, and edge consistency of the replayed board.
    pub fn restore(&self, pieces: &PieceSet) -> Result<(Board, PieceBits, PlacementOrder)> {
        let n = pieces.len();
        if let Some(total) = self.total_pieces {
            if total as usize != n {
                return Err(SolverError::CorruptSave(format!(
                    "save holds {total} pieces, puzzle has {n}"
                )));
            }
        }
        if self.rows != 0
            && (self.rows as usize, self.cols as usize) != (pieces.rows(), pieces.cols())
        {
            return Err(SolverError::CorruptSave(format!(
                "save dimensions {}x{} do not match puzzle {}x{}",
                self.rows,
                self.cols,
                pieces.rows(),
                pieces.cols()
            )));
        }

        let mut board = Board::new(pieces.rows(), pieces.cols());
        let mut used = PieceBits::new(n);
        let mut order: PlacementOrder = Vec::with_capacity(self.placements.len());
        for event in &self.placements {
            let piece = pieces.get(event.piece).ok_or_else(|| {
                SolverError::CorruptSave(format!("unknown piece id {}", event.piece))
            })?;
            if !self.is_used(event.piece) {
                return Err(SolverError::CorruptSave(format!(
                    "piece {} is both placed and marked unused",
                    event.piece
                )));
            }
            if used.contains(event.piece) {
                return Err(SolverError::CorruptSave(format!(
                    "piece {} placed twice",
                    event.piece
                )));
            }
            let (row, col) = (event.row as usize, event.col as usize);
            if board.get(row, col).is_some() {
                return Err(SolverError::CorruptSave(format!(
                    "cell ({row}, {col}) placed twice"
                )));
            }
            board.place(row, col, piece, event.rotation).map_err(|_| {
                SolverError::CorruptSave(format!("placement ({row}, {col}) out of bounds"))
            })?;
            used.set(event.piece);
            order.push(*event);
        }

        // used bits beyond the placements would leave phantom pieces;
        // together with the per-placement check this enforces
        // placements + unused = total.
        let mut marked = 0usize;
        for bit in 0..self.used_bytes.len() * 8 {
            if self.used_bytes[bit / 8] & (1 << (bit % 8)) == 0 {
                continue;
            }
            if bit >= n {
                return Err(SolverError::CorruptSave(format!(
                    "used bit set for nonexistent piece {}",
                    bit + 1
                )));
            }
            marked += 1;
        }
        if marked != self.placements.len() {
            return Err(SolverError::CorruptSave(format!(
                "{marked} used bits for {} placements",
                self.placements.len()
            )));
        }
        if !board.is_consistent() {
            return Err(SolverError::CorruptSave(
                "replayed board violates edge constraints".to_string(),
            ));
        }
        Ok((board, used, order))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(SolverError::CorruptSave("truncated save".to_string()));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Owns the save files for one puzzle name.
pub struct SaveManager {
    dir: PathBuf,
    name: String,
    interval: usize,
    keep_best: usize,
    best_saved: AtomicUsize,
    tmp_seq: AtomicUsize,
}

impl SaveManager {
    /// Default cadence: every 5 depths, keeping the 10 deepest milestones.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self::with_limits(dir, name, 5, 10)
    }

    /// Explicit cadence and milestone cap.
    pub fn with_limits(dir: &Path, name: &str, interval: usize, keep_best: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            interval,
            keep_best,
            best_saved: AtomicUsize::new(0),
            tmp_seq: AtomicUsize::new(0),
        }
    }

    /// One manager serves every worker of a solve, so concurrent writes
    /// must not share a temp file; each write stages under a unique name
    /// before the rename.
    fn tmp_path(&self, label: &str) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{}_{label}.tmp{seq}", self.name))
    }

    /// The puzzle name the files are keyed by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True on depths where a tick should write.
    pub fn due(&self, depth: usize) -> bool {
        self.interval != 0 && depth != 0 && depth % self.interval == 0
    }

    /// Seeds the best-known depth, e.g. after restoring a save.
    pub fn note_best(&self, depth: usize) {
        self.best_saved.fetch_max(depth, Ordering::Relaxed);
    }

    /// One save tick: refresh the current file and, when `depth` beats
    /// every depth saved before, add a milestone. I/O errors are logged
    /// and swallowed; losing a checkpoint must never abort the search.
    pub fn tick(&self, depth: usize, state: &SaveState) {
        if !self.due(depth) {
            return;
        }
        if let Err(e) = self.write_current(state) {
            log::warn!("checkpoint write failed: {e}");
        }
        if self.best_saved.fetch_max(depth, Ordering::Relaxed) < depth {
            if let Err(e) = self.write_best(depth, state) {
                log::warn!("milestone write failed: {e}");
            }
        }
    }

    /// Unconditional final save, used when a solution lands.
    pub fn finalize(&self, depth: usize, state: &SaveState) {
        if let Err(e) = self.write_current(state) {
            log::warn!("final checkpoint write failed: {e}");
        }
        self.best_saved.fetch_max(depth, Ordering::Relaxed);
        if let Err(e) = self.write_best(depth, state) {
            log::warn!("final milestone write failed: {e}");
        }
    }

    /// Path of the continuously overwritten snapshot.
    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}_current", self.name))
    }

    fn best_path(&self, depth: usize) -> PathBuf {
        self.dir.join(format!("{}_best_{depth}", self.name))
    }

    /// Writes the current snapshot via temp file + atomic rename.
    pub fn write_current(&self, state: &SaveState) -> Result<()> {
        let tmp = self.tmp_path("current");
        write_file(&tmp, &state.encode_binary())?;
        fs::rename(&tmp, self.current_path())?;
        Ok(())
    }

    /// Writes one milestone. Idempotent: an existing file for the depth
    /// is never overwritten. Prunes shallow milestones past the cap.
    pub fn write_best(&self, depth: usize, state: &SaveState) -> Result<()> {
        let path = self.best_path(depth);
        if path.exists() {
            return Ok(());
        }
        let tmp = self.tmp_path(&format!("best_{depth}"));
        write_file(&tmp, &state.encode_binary())?;
        fs::rename(&tmp, &path)?;
        self.prune_best();
        Ok(())
    }

    /// Removes the shallowest milestones beyond the cap. Best effort:
    /// concurrent prunes may race, so removal failures stay silent.
    fn prune_best(&self) {
        let mut entries = self.best_entries();
        if entries.len() <= self.keep_best {
            return;
        }
        entries.sort_by_key(|&(depth, _)| depth);
        let excess = entries.len() - self.keep_best;
        for (_, path) in entries.into_iter().take(excess) {
            let _ = fs::remove_file(path);
        }
    }

    fn best_entries(&self) -> Vec<(usize, PathBuf)> {
        let prefix = format!("{}_best_", self.name);
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        dir.filter_map(|entry| {
            let entry = entry.ok()?;
            let file_name = entry.file_name();
            let depth: usize = file_name.to_str()?.strip_prefix(&prefix)?.parse().ok()?;
            Some((depth, entry.path()))
        })
        .collect()
    }

    /// Loads the current snapshot; `None` if no file exists.
    pub fn load_current(&self) -> Result<Option<SaveState>> {
        match fs::read(self.current_path()) {
            Ok(bytes) => Ok(Some(SaveState::decode(&bytes, &self.name)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Tries milestone files deepest-first until one decodes.
    pub fn load_best(&self) -> Option<SaveState> {
        let mut entries = self.best_entries();
        entries.sort_by_key(|&(depth, _)| std::cmp::Reverse(depth));
        for (depth, path) in entries {
            match fs::read(&path).map_err(SolverError::from).and_then(|bytes| {
                SaveState::decode(&bytes, &self.name)
            }) {
                Ok(state) => {
                    self.note_best(depth);
                    return Some(state);
                }
                Err(e) => log::warn!("skipping milestone {}: {e}", path.display()),
            }
        }
        None
    }

    /// The resume entry point: the current snapshot when it loads, else
    /// the deepest loadable milestone.
    pub fn load_latest(&self) -> Option<SaveState> {
        match self.load_current() {
            Ok(Some(state)) => {
                self.note_best(state.depth());
                Some(state)
            }
            Ok(None) => self.load_best(),
            Err(e) => {
                log::warn!("current snapshot unreadable ({e}); trying milestones");
                self.load_best()
            }
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
