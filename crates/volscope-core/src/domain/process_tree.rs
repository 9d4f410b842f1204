//! Process tree built from `PID` / `PPID` columns (pslist, pstree, ...).

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use super::ids::Pid;
use super::result::{ResultSet, Row};

/// One row of the flattened tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEntry {
    pub depth: usize,
    pub pid: Option<Pid>,
    pub row: Row,
}

fn pid_field(row: &Row, key: &str) -> Option<Pid> {
    match row.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()).map(Pid::new),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Arrange rows into a forest and flatten it depth-first.
///
/// - roots: rows whose parent is absent from the set, or is the row itself
/// - siblings are ordered by pid
/// - rows that only sit on a parent cycle (pid reuse in a dump) are emitted as roots
/// - rows without a `PID` are kept at the end at depth 0
pub fn flatten_process_tree(results: &ResultSet) -> Vec<TreeEntry> {
    let rows = results.rows();

    let mut by_pid: BTreeMap<Pid, Vec<usize>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        if let Some(pid) = pid_field(row, "PID") {
            by_pid.entry(pid).or_default().push(idx);
        }
    }

    let mut children: BTreeMap<Pid, Vec<usize>> = BTreeMap::new();
    let mut roots: Vec<usize> = Vec::new();
    for (&pid, indices) in &by_pid {
        for &idx in indices {
            match pid_field(&rows[idx], "PPID") {
                Some(ppid) if ppid != pid && by_pid.contains_key(&ppid) => {
                    children.entry(ppid).or_default().push(idx);
                }
                _ => roots.push(idx),
            }
        }
    }

    let mut out = Vec::with_capacity(rows.len());
    let mut visited: HashSet<usize> = HashSet::new();
    // (row index, depth)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    let starts = roots
        .into_iter()
        // cycle members never reached from a root
        .chain(by_pid.values().flatten().copied());
    for start in starts {
        stack.push((start, 0));
        while let Some((idx, depth)) = stack.pop() {
            if !visited.insert(idx) {
                continue;
            }
            let pid = pid_field(&rows[idx], "PID");
            out.push(TreeEntry {
                depth,
                pid,
                row: rows[idx].clone(),
            });
            if let Some(kids) = pid.and_then(|p| children.get(&p)) {
                stack.extend(kids.iter().rev().map(|&kid| (kid, depth + 1)));
            }
        }
    }
    for (idx, row) in rows.iter().enumerate() {
        if !visited.contains(&idx) && pid_field(row, "PID").is_none() {
            out.push(TreeEntry {
                depth: 0,
                pid: None,
                row: row.clone(),
            });
        }
    }
    out
}
