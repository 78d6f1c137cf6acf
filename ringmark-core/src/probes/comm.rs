//! Communication probes: rings, all-pairs exchanges, broadcasts, reductions.

use std::time::Duration;

use rand::Rng;

use crate::error::RingmarkResult;
use crate::hosts::{decode_records, encode_record, local_hostname, HOST_RECORD_LEN};
use crate::runtime::MASTER_RANK;
use crate::session::{site, CallSite};
use crate::suite::ProbeCtx;
use crate::watchdog::HangContext;

const HOSTNAME_ALLGATHER: CallSite = site(2, 1, "hostname allgather");
const SMALL_ALL_TO_ALL: CallSite = site(3, 1, "small all-to-all sendrecv");
const LARGE_ALL_TO_ALL: CallSite = site(4, 1, "large all-to-all sendrecv");
const ALT_RING_FORWARD: CallSite = site(5, 1, "alternating ring forward");
const ALT_RING_BACKWARD: CallSite = site(5, 2, "alternating ring backward");
const LARGE_RING_FORWARD: CallSite = site(6, 1, "large ring forward");
const LARGE_RING_BACKWARD: CallSite = site(6, 2, "large ring backward");
const ALLREDUCE_MAX: CallSite = site(7, 1, "allreduce max");
const CHECK_ALLREDUCE: CallSite = site(7, 2, "allreduce max equals highest rank");
const ROOT_BCAST: CallSite = site(8, 1, "root broadcast");
const RAND_ROOT_ID_BCAST: CallSite = site(9, 1, "random root id broadcast");
const RAND_ROOT_BCAST: CallSite = site(9, 2, "random root broadcast");
const ALL_TO_ROOT_SEND: CallSite = site(10, 1, "all-to-root send");
const ALL_TO_ROOT_RECV: CallSite = site(10, 2, "all-to-root recv");
const PROCESSOR_NAME: CallSite = site(12, 1, "processor name");

const RING_ITERS: usize = 4;
const RING_TAG: i32 = 42;
const RAND_BCAST_ROUNDS: usize = 8;

/// Immediate ring neighbors of `rank` in a ring of `size`.
pub fn ring_neighbors(rank: usize, size: usize) -> (usize, usize) {
    let right = (rank + 1) % size;
    let left = (rank + size - 1) % size;
    (left, right)
}

/// Exchange hostnames through an all-gather and populate the rank lookup
/// table used by the statistics reports and the watchdog's hang attribution.
pub fn hostname_exchange(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    let size = ctx.comm.size();
    let record = encode_record(&local_hostname());
    let mut gathered = vec![0u8; HOST_RECORD_LEN * size];

    ctx.announce(format!(
        "       allgather buffer size: {} B",
        gathered.len()
    ));
    ctx.announce("       exchanging host name information");

    ctx.session
        .guarded(HOSTNAME_ALLGATHER, || ctx.comm.allgather(&record, &mut gathered));
    ctx.session.ensure_clean("hostname_exchange")?;

    ctx.hosts.populate(decode_records(&gathered));
    Ok(())
}

fn all_to_all(
    ctx: &ProbeCtx<'_>,
    buff_size: usize,
    at: CallSite,
    with_watchdog: bool,
) -> RingmarkResult<()> {
    let size = ctx.comm.size();
    let rank = ctx.comm.rank();
    let send = vec![0u8; buff_size];
    let mut recv = vec![0u8; buff_size];

    ctx.announce(format!("       message size: {buff_size} B"));
    ctx.announce("       all to all");

    for i in 1..=size {
        let right = (rank + i) % size;
        let left = (rank + size - (i % size)) % size;

        let deadline = ctx.config.hang_timeout_secs;
        if with_watchdog && deadline > 0 {
            ctx.watchdog.arm(
                Duration::from_secs(deadline),
                HangContext {
                    iteration: i,
                    left,
                    right,
                },
            );
        }
        ctx.session.guarded(at, || {
            ctx.comm.sendrecv(right, &send, left, &mut recv, i as i32)
        });
        if with_watchdog {
            ctx.watchdog.disarm();
        }
        ctx.session.ensure_clean(at.name)?;
    }
    Ok(())
}

/// One-byte all-pairs exchange with the watchdog armed around every step;
/// the cheapest way to find the one link in the fabric that hangs.
pub fn small_all_to_all(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    all_to_all(ctx, 1, SMALL_ALL_TO_ALL, true)
}

/// Full-size all-pairs exchange.
pub fn large_all_to_all(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    all_to_all(ctx, ctx.config.msg_size, LARGE_ALL_TO_ALL, false)
}

fn sendrecv_ring(
    ctx: &ProbeCtx<'_>,
    buff_size: usize,
    forward: CallSite,
    backward: CallSite,
) -> RingmarkResult<()> {
    let (left, right) = ring_neighbors(ctx.comm.rank(), ctx.comm.size());
    let send = vec![0u8; buff_size];
    let mut recv = vec![0u8; buff_size];

    ctx.session.guarded(forward, || {
        ctx.comm.sendrecv(right, &send, left, &mut recv, RING_TAG)
    });
    ctx.session.ensure_clean(forward.name)?;

    ctx.session.guarded(backward, || {
        ctx.comm.sendrecv(left, &send, right, &mut recv, RING_TAG)
    });
    ctx.session.ensure_clean(backward.name)
}

/// Bidirectional ring exchange at full message size.
pub fn large_sendrecv_ring(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    ctx.announce(format!("       message size: {} B", ctx.config.msg_size));
    for _ in 0..RING_ITERS {
        sendrecv_ring(
            ctx,
            ctx.config.msg_size,
            LARGE_RING_FORWARD,
            LARGE_RING_BACKWARD,
        )?;
    }
    Ok(())
}

/// Ring exchange alternating between a one-byte and a full-size message,
/// catching eager/rendezvous path asymmetries.
pub fn alt_sendrecv_ring(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    let large = ctx.config.msg_size;
    ctx.announce(format!("       message size key: === {large} B, --- 1 B"));
    for i in 0..RING_ITERS {
        let buff_size = if i % 2 != 0 { large } else { 1 };
        sendrecv_ring(ctx, buff_size, ALT_RING_FORWARD, ALT_RING_BACKWARD)?;
    }
    Ok(())
}

/// Allreduce the rank index and verify every rank sees the highest one.
pub fn small_allreduce_max(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    let rank = ctx.comm.rank();
    ctx.announce(format!(
        "       message size: {} B",
        std::mem::size_of::<f64>()
    ));
    ctx.announce("       allreducing");

    let got = ctx
        .session
        .guarded(ALLREDUCE_MAX, || ctx.comm.allreduce_max(rank as f64));
    ctx.session.ensure_clean("small_allreduce_max")?;

    ctx.announce("       verifying result");
    let expected = (ctx.comm.size() - 1) as f64;
    let got = got.expect("guarded success carries the value");
    ctx.session
        .check(CHECK_ALLREDUCE, got == expected, got as i32);
    ctx.session.ensure_clean("small_allreduce_max")
}

/// Master-rooted broadcast at full message size.
pub fn root_bcast(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    let mut buf = vec![0u8; ctx.config.msg_size];
    ctx.announce(format!("       message size: {} B", buf.len()));
    ctx.announce(format!(
        "       rank {:06} broadcasting to the job",
        MASTER_RANK
    ));

    ctx.session
        .guarded(ROOT_BCAST, || ctx.comm.broadcast(MASTER_RANK, &mut buf));
    ctx.session.ensure_clean("root_bcast")
}

/// Several rounds of broadcast from a root the master draws at random,
/// spreading root duty across the fabric.
pub fn rand_root_bcast(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    let size = ctx.comm.size();
    let mut payload = vec![0u8; ctx.config.msg_size];
    ctx.announce(format!("       message size: {} B", payload.len()));

    for _ in 0..RAND_BCAST_ROUNDS {
        let mut root_wire = [0u8; 4];
        if ctx.is_master() {
            let root = rand::thread_rng().gen_range(0..size) as u32;
            root_wire = root.to_be_bytes();
        }
        ctx.session.guarded(RAND_ROOT_ID_BCAST, || {
            ctx.comm.broadcast(MASTER_RANK, &mut root_wire)
        });
        ctx.session.ensure_clean("rand_root_bcast")?;

        let root = u32::from_be_bytes(root_wire) as usize;
        ctx.announce(format!(
            "       {:06} ({}) broadcasting to the job",
            root,
            ctx.hosts.get(root)
        ));
        ctx.session
            .guarded(RAND_ROOT_BCAST, || ctx.comm.broadcast(root, &mut payload));
        ctx.session.ensure_clean("rand_root_bcast")?;
    }
    Ok(())
}

/// Every rank sends a full-size message to the master, which receives them
/// rank by rank; deliberately synchronous at the root.
pub fn all_to_root(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    let size = ctx.comm.size();
    let rank = ctx.comm.rank();
    let buff_size = ctx.config.msg_size;
    ctx.announce(format!("       message size: {buff_size} B"));

    if rank != MASTER_RANK {
        let send = vec![0u8; buff_size];
        ctx.session
            .guarded(ALL_TO_ROOT_SEND, || ctx.comm.send(MASTER_RANK, 0, &send));
        return ctx.session.ensure_clean("all_to_root");
    }

    let mut recv = vec![0u8; buff_size];
    for src in 0..size {
        if src == rank {
            continue;
        }
        ctx.session
            .guarded(ALL_TO_ROOT_RECV, || ctx.comm.recv(src, 0, &mut recv));
        ctx.session.ensure_clean("all_to_root")?;
    }
    Ok(())
}

/// Every rank announces itself; the only probe whose output is meant to be
/// one line per rank.
pub fn hello_world(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    let name = ctx
        .session
        .guarded(PROCESSOR_NAME, || ctx.comm.processor_name());
    ctx.session.ensure_clean("hello_world")?;

    println!(
        "       hello from rank {:06} ({}) of {:06}",
        ctx.comm.rank(),
        name.expect("guarded success carries the value"),
        ctx.comm.size()
    );
    Ok(())
}
