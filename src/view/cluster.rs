//! Clustering view slice - collapse runs of similar items into aggregates
//!
//! A caller-supplied classifier assigns each record a cluster key; maximal
//! runs of equal keys at least `threshold` long collapse into one synthetic
//! aggregate built by the reducer, shorter runs pass through unchanged. The
//! run structure is maintained incrementally: a structural delta only splits,
//! extends or merges runs at the affected boundary, never re-evaluates the
//! whole visible range.

use super::{ListenerError, SliceDelta, SliceListener};
use crate::record::RecordId;

/// Classifier: record id -> cluster key
pub type ClusterKeyFn = Box<dyn Fn(RecordId) -> u64 + Send>;

/// Reducer: builds the synthetic aggregate for a collapsed run
pub type ReducerFn = Box<dyn Fn(u64, &[RecordId]) -> Aggregate + Send>;

/// Synthetic aggregate replacing a collapsed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub key: u64,
    pub members: Vec<RecordId>,
    /// Display label produced by the reducer
    pub label: String,
}

/// One projected entry: a single record or a collapsed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusteredItem {
    Single(RecordId),
    Cluster(Aggregate),
}

/// A maximal run of equal cluster keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    key: u64,
    len: usize,
}

/// Run-collapsing decorator over a view slice
pub struct ClusteringViewSlice {
    key_fn: ClusterKeyFn,
    reducer: ReducerFn,
    threshold: usize,
    /// Underlying order with each record's cluster key
    raw: Vec<(RecordId, u64)>,
    /// Maximal equal-key runs covering `raw`
    runs: Vec<Run>,
    /// Runs touched (created, extended, split, merged) by the last delta
    last_touched_runs: usize,
}

impl ClusteringViewSlice {
    /// Threshold 1 clusters every run unconditionally
    pub fn new(order: &[RecordId], threshold: usize, key_fn: ClusterKeyFn, reducer: ReducerFn) -> Self {
        let raw: Vec<(RecordId, u64)> = order.iter().map(|&id| (id, key_fn(id))).collect();
        let mut runs: Vec<Run> = Vec::new();
        for &(_, key) in &raw {
            match runs.last_mut() {
                Some(run) if run.key == key => run.len += 1,
                _ => runs.push(Run { key, len: 1 }),
            }
        }
        Self {
            key_fn,
            reducer,
            threshold: threshold.max(1),
            raw,
            runs,
            last_touched_runs: 0,
        }
    }

    /// Default reducer: count-labelled aggregate
    pub fn count_reducer() -> ReducerFn {
        Box::new(|key, members| Aggregate {
            key,
            members: members.to_vec(),
            label: format!("{} items", members.len()),
        })
    }

    /// Project the clustered view
    pub fn items(&self) -> Vec<ClusteredItem> {
        let mut out = Vec::new();
        let mut start = 0;
        for run in &self.runs {
            let members = &self.raw[start..start + run.len];
            if run.len >= self.threshold {
                let ids: Vec<RecordId> = members.iter().map(|(id, _)| *id).collect();
                out.push(ClusteredItem::Cluster((self.reducer)(run.key, &ids)));
            } else {
                for (id, _) in members {
                    out.push(ClusteredItem::Single(*id));
                }
            }
            start += run.len;
        }
        out
    }

    /// Runs touched by the most recent structural delta
    pub fn last_touched_runs(&self) -> usize {
        self.last_touched_runs
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    // ========================================================================
    // Incremental Run Maintenance
    // ========================================================================

    /// Run index and in-run offset covering raw position `pos`
    fn run_at(&self, pos: usize) -> (usize, usize) {
        let mut start = 0;
        for (i, run) in self.runs.iter().enumerate() {
            if pos < start + run.len {
                return (i, pos - start);
            }
            start += run.len;
        }
        (self.runs.len(), 0)
    }

    fn insert_at(&mut self, index: usize, id: RecordId) {
        let key = (self.key_fn)(id);
        self.raw.insert(index, (id, key));

        let (ri, off) = self.run_at(index);
        if ri == self.runs.len() {
            // Appending past the last run.
            if let Some(last) = self.runs.last_mut() {
                if last.key == key {
                    last.len += 1;
                    self.last_touched_runs = 1;
                    return;
                }
            }
            self.runs.push(Run { key, len: 1 });
            self.last_touched_runs = 1;
            return;
        }

        let run = self.runs[ri];
        if run.key == key {
            self.runs[ri].len += 1;
            self.last_touched_runs = 1;
        } else if off == 0 {
            // At a run boundary; the left neighbor may absorb it.
            if ri > 0 && self.runs[ri - 1].key == key {
                self.runs[ri - 1].len += 1;
                self.last_touched_runs = 1;
            } else {
                self.runs.insert(ri, Run { key, len: 1 });
                self.last_touched_runs = 1;
            }
        } else {
            // Mid-run with a different key: split into three.
            self.runs[ri].len = off;
            self.runs.insert(ri + 1, Run { key, len: 1 });
            self.runs.insert(ri + 2, Run { key: run.key, len: run.len - off });
            self.last_touched_runs = 3;
        }
    }

    fn remove_at(&mut self, index: usize) {
        if index >= self.raw.len() {
            return;
        }
        // Find the covering run before the raw order shifts.
        let mut start = 0;
        let mut target = self.runs.len();
        for (i, run) in self.runs.iter().enumerate() {
            if index < start + run.len {
                target = i;
                break;
            }
            start += run.len;
        }
        self.raw.remove(index);
        if target == self.runs.len() {
            return;
        }

        self.runs[target].len -= 1;
        self.last_touched_runs = 1;
        if self.runs[target].len == 0 {
            self.runs.remove(target);
            // Removing a singleton run may expose two equal-key neighbors.
            if target > 0 && target < self.runs.len() && self.runs[target - 1].key == self.runs[target].key
            {
                self.runs[target - 1].len += self.runs[target].len;
                self.runs.remove(target);
                self.last_touched_runs = 2;
            }
        }
    }
}

impl SliceListener for ClusteringViewSlice {
    fn on_delta(&mut self, delta: &SliceDelta) -> std::result::Result<(), ListenerError> {
        match delta {
            SliceDelta::SpliceAdd { index, items } => {
                for (i, id) in items.iter().enumerate() {
                    self.insert_at(index + i, *id);
                }
            }
            SliceDelta::SpliceRemove { index, count } => {
                for _ in 0..*count {
                    self.remove_at(*index);
                }
            }
            SliceDelta::Move { from, to, count } => {
                for _ in 0..*count {
                    if *from >= self.raw.len() {
                        continue;
                    }
                    let (id, _) = self.raw[*from];
                    self.remove_at(*from);
                    self.insert_at(*to, id);
                }
            }
        }
        Ok(())
    }
}
