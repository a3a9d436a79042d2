//! Static work partitioning across the two-level thread hierarchy.
//!
//! The pool of `jc_ways * ic_ways` threads is split once at call entry: the
//! outer group divides the column range of C, and every outer member owns an
//! inner group that divides the row range. There is no work stealing.

use std::env;

use crate::{error::validation_error, Result};

/// Position of one thread within one level of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Number of members at this level.
    pub n_way: usize,
    /// Rank of this member, `0..n_way`.
    pub work_id: usize,
}

impl ThreadInfo {
    pub const fn single() -> Self {
        ThreadInfo { n_way: 1, work_id: 0 }
    }

    /// The chief is the member responsible for allocation and publication.
    #[inline]
    pub fn am_chief(&self) -> bool {
        self.work_id == 0
    }
}

/// Which member receives the partial granule when `total` is not a multiple
/// of the granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The last member; every other range is a whole number of granules.
    High,
    /// The first member.
    Low,
}

/// Returns the `[start, end)` sub-range of `0..total` owned by `info`.
///
/// Ranges are disjoint, ordered by rank and cover `0..total` exactly. Every
/// boundary falls on a multiple of `granularity` except the end (for
/// [`Edge::High`]) or the first boundary (for [`Edge::Low`]), so no micro-tile
/// is ever split between two threads. When there are more members than
/// granules some members receive an empty range.
pub fn range_for(info: &ThreadInfo, total: usize, granularity: usize, edge: Edge) -> (usize, usize) {
    debug_assert!(granularity > 0);
    debug_assert!(info.work_id < info.n_way);

    let n_way = info.n_way;
    let whole = total / granularity;
    let per = whole / n_way;
    let extra = whole % n_way;

    match edge {
        Edge::High => {
            // Low ranks take the extra whole granules; the last rank the partial one.
            let t = info.work_id;
            let start = granularity * (t * per + t.min(extra));
            let units = per + usize::from(t < extra);
            let end = if t + 1 == n_way {
                total
            } else {
                start + units * granularity
            };
            (start, end)
        }
        Edge::Low => {
            // Mirror image: high ranks take the extra whole granules.
            let t = info.work_id;
            let r = n_way - 1 - t;
            let units = per + usize::from(r < extra);
            let after = granularity * (r * per + r.min(extra));
            let end = total - after;
            let start = if t == 0 { 0 } else { end - units * granularity };
            (start, end)
        }
    }
}

/// Shape of the thread hierarchy: `jc_ways` outer groups of `ic_ways` threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threading {
    pub jc_ways: usize,
    pub ic_ways: usize,
}

impl Default for Threading {
    fn default() -> Self {
        Threading::single()
    }
}

impl Threading {
    pub const fn single() -> Self {
        Threading { jc_ways: 1, ic_ways: 1 }
    }

    pub fn new(jc_ways: usize, ic_ways: usize) -> Result<Self> {
        if jc_ways == 0 || ic_ways == 0 {
            return Err(validation_error(format!(
                "thread ways must be non-zero (jc: {jc_ways}, ic: {ic_ways})"
            )));
        }
        Ok(Threading { jc_ways, ic_ways })
    }

    pub fn num_threads(&self) -> usize {
        self.jc_ways * self.ic_ways
    }

    /// Factors `nt` into `jc_ways × ic_ways` so that each thread's share of an
    /// `m × n` output is as close to square as possible.
    pub fn from_num_threads(nt: usize, m: usize, n: usize) -> Self {
        let nt = nt.max(1);
        let (m, n) = (m.max(1) as f64, n.max(1) as f64);

        let mut best = Threading::single();
        let mut best_score = f64::INFINITY;
        for jc in (1..=nt).filter(|jc| nt % jc == 0) {
            let ic = nt / jc;
            let score = ((m / ic as f64) - (n / jc as f64)).abs();
            // ties go to the larger jc count, which visits later
            if score <= best_score {
                best_score = score;
                best = Threading { jc_ways: jc, ic_ways: ic };
            }
        }
        best
    }

    /// Reads `GEMMLY_JC_NT` / `GEMMLY_IC_NT`, falling back to a factorization
    /// of `GEMMLY_NUM_THREADS` for an `m × n` problem. Unset or unparsable
    /// variables count as absent.
    pub fn from_env(m: usize, n: usize) -> Self {
        fn var(name: &str) -> Option<usize> {
            env::var(name).ok()?.trim().parse().ok().filter(|&v: &usize| v > 0)
        }

        match (var("GEMMLY_JC_NT"), var("GEMMLY_IC_NT")) {
            (None, None) => match var("GEMMLY_NUM_THREADS") {
                Some(nt) => Threading::from_num_threads(nt, m, n),
                None => Threading::single(),
            },
            (jc, ic) => Threading {
                jc_ways: jc.unwrap_or(1),
                ic_ways: ic.unwrap_or(1),
            },
        }
    }

    /// Splits a flat thread id into its (outer, inner) positions.
    pub fn thread_infos(&self, tid: usize) -> (ThreadInfo, ThreadInfo) {
        let jc = ThreadInfo {
            n_way: self.jc_ways,
            work_id: tid / self.ic_ways,
        };
        let ic = ThreadInfo {
            n_way: self.ic_ways,
            work_id: tid % self.ic_ways,
        };
        (jc, ic)
    }
}
