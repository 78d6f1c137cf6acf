//! Rank-attributed statistics over local measurements.
//!
//! Each rank contributes one (value, rank) pair; three reductions later the
//! master rank knows the maximum and minimum with their owning ranks, the
//! arithmetic mean, and the aggregate sum, and reports each owner by
//! hostname. Ties in the located reductions resolve to the lowest rank
//! index — the underlying reduction's native policy, preserved here rather
//! than re-broken.

use crate::error::RingmarkResult;
use crate::hosts::HostTable;
use crate::runtime::{Communicator, RankStat, MASTER_RANK};
use crate::session::{site, CallSite, DiagnosticSession};

const REDUCE_MAXLOC: CallSite = site(13, 1, "reduce_maxloc");
const REDUCE_MINLOC: CallSite = site(13, 2, "reduce_minloc");
const REDUCE_SUM: CallSite = site(13, 3, "reduce_sum");

/// Bytes per MB for bandwidth conversion.
pub const MB_SIZE: f64 = (1 << 20) as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatUnit {
    MbPerSec,
    Seconds,
}

impl StatUnit {
    pub fn label(self) -> &'static str {
        match self {
            StatUnit::MbPerSec => "MB/s",
            StatUnit::Seconds => "s",
        }
    }
}

/// Reduced view of one statistic, present on the master rank only.
#[derive(Debug, Clone, PartialEq)]
pub struct StatSummary {
    pub max: RankStat,
    pub min: RankStat,
    pub mean: f64,
    pub aggregate: f64,
}

/// Bandwidth of `bytes` moved in `elapsed_secs`, in MB/s. A zero or negative
/// elapsed time yields zero bandwidth rather than an error.
pub fn bandwidth_mbs(bytes: usize, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        0.0
    } else {
        bytes as f64 / elapsed_secs / MB_SIZE
    }
}

/// Run the three guarded reductions for one local stat. Returns the summary
/// on the master, `None` elsewhere; a failed reduction aborts the statistic
/// through the generic guarded-call path.
pub fn reduce(
    session: &DiagnosticSession,
    comm: &dyn Communicator,
    stat: RankStat,
) -> RingmarkResult<Option<StatSummary>> {
    let max = session.guarded(REDUCE_MAXLOC, || comm.reduce_maxloc(stat));
    session.ensure_clean("statistics reduction")?;
    let min = session.guarded(REDUCE_MINLOC, || comm.reduce_minloc(stat));
    session.ensure_clean("statistics reduction")?;
    let sum = session.guarded(REDUCE_SUM, || comm.reduce_sum(stat.value));
    session.ensure_clean("statistics reduction")?;

    if comm.rank() != MASTER_RANK {
        return Ok(None);
    }
    let aggregate = sum.flatten().expect("master holds the sum");
    Ok(Some(StatSummary {
        max: max.flatten().expect("master holds the max"),
        min: min.flatten().expect("master holds the min"),
        mean: aggregate / comm.size() as f64,
        aggregate,
    }))
}

/// Reduce one statistic and print the attributed report on the master rank.
pub fn report(
    session: &DiagnosticSession,
    comm: &dyn Communicator,
    hosts: &HostTable,
    stat: RankStat,
    label: &str,
    unit: StatUnit,
) -> RingmarkResult<()> {
    let Some(summary) = reduce(session, comm, stat)? else {
        return Ok(());
    };
    let unit = unit.label();
    println!("   --- {label}:");
    println!(
        "          max rank: {:06} ({})",
        summary.max.rank,
        hosts.get(summary.max.rank)
    );
    println!("          max {label}: {:.3} {unit}", summary.max.value);
    println!(
        "          min rank: {:06} ({})",
        summary.min.rank,
        hosts.get(summary.min.rank)
    );
    println!("          min {label}: {:.3} {unit}", summary.min.value);
    println!("          ave {label}: {:.3} {unit}", summary.mean);
    println!("          aggregate {label}: {:.3} {unit}", summary.aggregate);
    Ok(())
}
