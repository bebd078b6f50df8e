//! N+1 fetch detection for lazy references.
//!
//! Resolving one lazy reference per entity in a loop costs one storage fetch
//! each. The tracker counts lazy fetches per association and warns when one
//! association reaches the threshold.
//!
//! ```ignore
//! let config = SessionConfig::default().with_n1_detection(3);
//! // warns on the third fetch:
//! for member in &members {
//!     session.resolve(&cx, &read_model(member).team).await;
//! }
//! // one fetch instead:
//! session.resolve_batch(&cx, &members, |m| &m.team).await;
//! ```

use std::collections::HashMap;
use std::time::Instant;

/// Where a lazy fetch was triggered.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub table: &'static str,
    pub association: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub at: Instant,
}

/// Summary of recorded lazy fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct N1Stats {
    pub total_loads: usize,
    /// Distinct associations fetched lazily
    pub associations: usize,
    /// Associations at or over the threshold
    pub potential_n1: usize,
}

/// Counts lazy fetches per `(table, association)`.
#[derive(Debug)]
pub struct N1QueryTracker {
    counts: HashMap<(&'static str, &'static str), usize>,
    threshold: usize,
    call_sites: Vec<CallSite>,
}

impl N1QueryTracker {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold: threshold.max(1),
            call_sites: Vec::new(),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one lazy fetch of `association` into `table`.
    #[track_caller]
    pub fn record_load(&mut self, table: &'static str, association: &'static str) {
        let count = self.counts.entry((table, association)).or_insert(0);
        *count += 1;
        let count = *count;

        let caller = std::panic::Location::caller();
        self.call_sites.push(CallSite {
            table,
            association,
            file: caller.file(),
            line: caller.line(),
            at: Instant::now(),
        });

        if count == self.threshold {
            self.emit_warning(table, association, count);
        }
    }

    fn emit_warning(&self, table: &'static str, association: &'static str, count: usize) {
        tracing::warn!(
            target: "persist::n1",
            table,
            association,
            fetches = count,
            threshold = self.threshold,
            "N+1 fetch pattern detected; consider Session::resolve_batch()"
        );
        for (i, site) in self
            .call_sites
            .iter()
            .filter(|s| s.table == table && s.association == association)
            .take(5)
            .enumerate()
        {
            tracing::debug!(target: "persist::n1", index = i, file = site.file, line = site.line, "lazy fetch site");
        }
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.call_sites.clear();
    }

    #[must_use]
    pub fn count_for(&self, table: &'static str, association: &'static str) -> usize {
        self.counts.get(&(table, association)).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            associations: self.counts.len(),
            potential_n1: self.counts.values().filter(|c| **c >= self.threshold).count(),
        }
    }

    #[must_use]
    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }
}
