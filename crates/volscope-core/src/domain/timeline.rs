//! Timeline view - 時刻列で行を並べ、固定幅の軸上に配置する
//!
//! # ルール
//! - 時刻列は明示指定、なければ [`detect_time_column`] で推定
//! - 解釈できない / 欠けている時刻の行は `skipped` に数えて除外
//! - 最古 → 0、最新 → `width - 1` の線形写像（範囲が 0 なら全部 0）

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::records::parse_timestamp;
use super::result::{ResultSchema, ResultSet, Row};

/// Columns tried first, in this order.
pub const TIME_COLUMNS: &[&str] = &["CreateTime", "ExitTime", "Timestamp", "LastWriteTime"];

/// One row placed on the axis.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    /// Position on the axis, `0..width`.
    pub offset: usize,
    pub row: Row,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub column: String,
    pub width: usize,
    /// Sorted by `at`; rows with equal times keep their input order.
    pub entries: Vec<TimelineEntry>,
    /// Rows without a usable timestamp.
    pub skipped: usize,
}

impl Timeline {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|e| e.at)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|e| e.at)
    }
}

fn cell_time(row: &Row, column: &str) -> Option<DateTime<Utc>> {
    row.get(column)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

fn has_time(results: &ResultSet, column: &str) -> bool {
    results.rows().iter().any(|row| cell_time(row, column).is_some())
}

/// First of [`TIME_COLUMNS`] holding a parseable time, else any `*Time` column that does.
pub fn detect_time_column(results: &ResultSet) -> Option<String> {
    if let Some(col) = TIME_COLUMNS.iter().find(|col| has_time(results, col)) {
        return Some(col.to_string());
    }
    ResultSchema::infer(results)
        .columns()
        .iter()
        .find(|col| col.ends_with("Time") && has_time(results, col))
        .cloned()
}

/// Place every row with a parseable `column` onto an axis `width` cells wide.
///
/// A `width` of 0 is treated as 1.
pub fn build_timeline(results: &ResultSet, column: &str, width: usize) -> Timeline {
    let width = width.max(1);
    let mut skipped = 0;
    let mut timed: Vec<(DateTime<Utc>, &Row)> = Vec::with_capacity(results.len());
    for row in results.rows() {
        match cell_time(row, column) {
            Some(at) => timed.push((at, row)),
            None => skipped += 1,
        }
    }
    timed.sort_by_key(|(at, _)| *at);

    let (first, last) = match (timed.first(), timed.last()) {
        (Some((first, _)), Some((last, _))) => (*first, *last),
        _ => {
            return Timeline {
                column: column.to_string(),
                width,
                entries: Vec::new(),
                skipped,
            };
        }
    };
    let span = i128::from((last - first).num_milliseconds());
    let slots = (width - 1) as i128;

    let entries = timed
        .into_iter()
        .map(|(at, row)| {
            let offset = if span <= 0 {
                0
            } else {
                let elapsed = i128::from((at - first).num_milliseconds());
                (elapsed * slots / span) as usize
            };
            TimelineEntry {
                at,
                offset,
                row: row.clone(),
            }
        })
        .collect();

    Timeline {
        column: column.to_string(),
        width,
        entries,
        skipped,
    }
}
