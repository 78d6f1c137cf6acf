//! Suite execution.
//!
//! Runs the selected suite for the configured number of passes with a
//! barrier between probes, so "probe k has completed everywhere" holds
//! before probe k+1 starts anywhere. A failing probe is fatal to the whole
//! run — unlike a failing guarded call inside a probe, which is recorded and
//! cleaned up after, a failed probe leaves global state the next probe
//! cannot assume anything about.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::config::{RunConfig, DEFAULT_FILE_SIZE, DEFAULT_MSG_SIZE};
use crate::error::RingmarkResult;
use crate::hosts::{local_hostname, HostTable};
use crate::runtime::{AccelFactory, Communicator, MASTER_RANK};
use crate::session::{site, CallSite, DiagnosticSession, ProbeDepth};
use crate::suite::{self, ProbeCtx};
use crate::watchdog::{fatal_escape, Watchdog};

const INTER_PROBE_BARRIER: CallSite = site(1, 1, "inter-probe barrier");
const FINAL_BARRIER: CallSite = site(1, 2, "final barrier");

/// Run the battery over `comm`. Returns the first failure; the caller owns
/// the decision to abort the job on it.
pub fn run(
    comm: &dyn Communicator,
    mut config: RunConfig,
    accel_factory: &AccelFactory,
) -> RingmarkResult<()> {
    let suite = suite::select(&mut config, comm.size());
    let session = DiagnosticSession::new(config.msg_level(), ProbeDepth::All);
    let hosts = Arc::new(HostTable::new());
    let watchdog = Watchdog::new(fatal_escape(comm.rank(), Arc::clone(&hosts)));

    let ctx = ProbeCtx {
        session: &session,
        comm,
        hosts: hosts.as_ref(),
        watchdog: &watchdog,
        config: &config,
        accel_factory,
    };

    let start = Instant::now();
    print_header(&ctx, suite.len());

    for pass in 1..=config.passes {
        ctx.announce(format!(
            "   === starting pass {pass} of {}\n",
            config.passes
        ));
        for probe in &suite {
            ctx.announce(format!("   === starting : {} test", probe.name));
            if let Err(err) = (probe.run)(&ctx) {
                error!(probe = probe.name, %err, "probe failed, aborting the run");
                return Err(err);
            }
            ctx.announce(format!("   === done     : {} test\n", probe.name));

            session.guarded(INTER_PROBE_BARRIER, || comm.barrier());
            session.ensure_clean(probe.name)?;
        }
    }

    session.guarded(FINAL_BARRIER, || comm.barrier());
    session.ensure_clean("final barrier")?;

    let exec_secs = start.elapsed().as_secs_f64();
    info!(exec_secs, ranks = comm.size(), "run complete");
    if comm.rank() == MASTER_RANK {
        println!("   exec time        : {exec_secs:.6} (s)\n");
        println!("   <results> PASSED");
    }
    Ok(())
}

fn print_header(ctx: &ProbeCtx<'_>, num_probes: usize) {
    let started_at = chrono::Local::now().format("%Y%m%d-%H%M%S");
    ctx.announce(format!(
        "\n   $$$ ringmark {} $$$\n",
        env!("CARGO_PKG_VERSION")
    ));
    ctx.announce(format!("   start yyyymmdd-hhmmss  : {started_at}"));
    ctx.announce(format!("   hostname               : {}", local_hostname()));
    ctx.announce(format!("   numpe                  : {}", ctx.comm.size()));
    ctx.announce(format!("   default msg size       : {DEFAULT_MSG_SIZE} B"));
    ctx.announce(format!(
        "   actual msg size        : {} B",
        ctx.config.msg_size
    ));
    ctx.announce(format!("   default file size/rank : {DEFAULT_FILE_SIZE} B"));
    ctx.announce(format!(
        "   actual file size/rank  : {} B",
        ctx.config.file_size
    ));
    ctx.announce(format!("   num iters              : {}", ctx.config.passes));
    ctx.announce(format!("   num tests              : {num_probes}\n"));
}
