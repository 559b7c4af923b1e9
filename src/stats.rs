//! Per-worker search counters and the JSON-lines statistics export.
//!
//! One record is appended per save tick; an out-of-process monitor tails
//! the file read-only. The core never opens sockets.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;

/// Counters a single worker accumulates while searching.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SearchStats {
    /// Recursive search invocations.
    pub calls: u64,
    /// Pieces placed, including forced ones.
    pub placements: u64,
    /// Candidate undos.
    pub backtracks: u64,
    /// Placements made by singleton forcing.
    pub singletons: u64,
    /// Branches exhausted without a solution.
    pub dead_ends: u64,
    /// Fit-predicate evaluations.
    pub fit_checks: u64,
}

impl SearchStats {
    /// Adds another worker's counters into this one.
    pub fn merge(&mut self, other: &SearchStats) {
        self.calls += other.calls;
        self.placements += other.placements;
        self.backtracks += other.backtracks;
        self.singletons += other.singletons;
        self.dead_ends += other.dead_ends;
        self.fit_checks += other.fit_checks;
    }

    /// Drains the counters, leaving zeroes behind.
    pub fn take(&mut self) -> SearchStats {
        std::mem::take(self)
    }
}

/// One stats-log line.
#[derive(Debug, Serialize)]
pub struct StatsRecord {
    /// Milliseconds since the epoch.
    pub ts: u64,
    /// Filled cells at the tick.
    pub depth: usize,
    /// Percent of the board filled.
    pub progress: f64,
    #[serde(rename = "computeMs")]
    pub compute_ms: u64,
    #[serde(rename = "piecesPerSec")]
    pub pieces_per_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtracks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placements: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub singletons: Option<u64>,
    #[serde(rename = "deadEnds", skip_serializing_if = "Option::is_none")]
    pub dead_ends: Option<u64>,
    #[serde(rename = "fitChecks", skip_serializing_if = "Option::is_none")]
    pub fit_checks: Option<u64>,
}

impl StatsRecord {
    /// Derives one record from a worker's counters at a save tick.
    pub fn at_tick(
        ts: u64,
        depth: usize,
        total_cells: usize,
        compute_ms: u64,
        stats: &SearchStats,
    ) -> Self {
        let progress = if total_cells == 0 {
            0.0
        } else {
            depth as f64 * 100.0 / total_cells as f64
        };
        let pieces_per_sec = if compute_ms == 0 {
            0.0
        } else {
            stats.placements as f64 * 1000.0 / compute_ms as f64
        };
        Self {
            ts,
            depth,
            progress,
            compute_ms,
            pieces_per_sec,
            backtracks: Some(stats.backtracks),
            calls: Some(stats.calls),
            placements: Some(stats.placements),
            singletons: Some(stats.singletons),
            dead_ends: Some(stats.dead_ends),
            fit_checks: Some(stats.fit_checks),
        }
    }
}

/// Append-only JSON-lines writer shared between workers.
pub struct StatsLogger {
    file: Mutex<File>,
}

impl StatsLogger {
    /// Opens (or creates) the log for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Appends one record. Failures are logged and swallowed; a lost
    /// stats line must never abort the search.
    pub fn append(&self, record: &StatsRecord) {
        match serde_json::to_string(record) {
            Ok(line) => {
                let mut file = self.file.lock();
                if let Err(e) = writeln!(file, "{line}") {
                    log::warn!("stats log write failed: {e}");
                }
            }
            Err(e) => log::warn!("stats record encoding failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_uses_wire_field_names() {
        let stats = SearchStats {
            calls: 10,
            placements: 20,
            backtracks: 3,
            singletons: 5,
            dead_ends: 2,
            fit_checks: 100,
        };
        let record = StatsRecord::at_tick(1_000, 8, 16, 2_000, &stats);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"computeMs\":2000"));
        assert!(json.contains("\"piecesPerSec\":10.0"));
        assert!(json.contains("\"deadEnds\":2"));
        assert!(json.contains("\"fitChecks\":100"));
        assert!(json.contains("\"progress\":50.0"));
    }

    #[test]
    fn test_logger_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        let logger = StatsLogger::open(&path).unwrap();

        let stats = SearchStats::default();
        logger.append(&StatsRecord::at_tick(1, 4, 16, 10, &stats));
        logger.append(&StatsRecord::at_tick(2, 8, 16, 20, &stats));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("depth").is_some());
        }
    }

    #[test]
    fn test_merge_and_take() {
        let mut a = SearchStats {
            calls: 1,
            placements: 2,
            ..Default::default()
        };
        let b = SearchStats {
            calls: 3,
            dead_ends: 4,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.calls, 4);
        assert_eq!(a.placements, 2);
        assert_eq!(a.dead_ends, 4);

        let drained = a.take();
        assert_eq!(drained.calls, 4);
        assert_eq!(a, SearchStats::default());
    }
}
