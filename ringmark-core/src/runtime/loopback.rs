//! In-process loopback cluster.
//!
//! One thread per rank, buffered point-to-point mailboxes, collectives built
//! on top of them. The bundled binary and the test suite drive the probe
//! battery over this implementation; the semantics mirror what the harness
//! expects from a production runtime: blocking matched receives, rank-ordered
//! gathers, master-rooted reductions with lowest-rank tie-break.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::error;

use super::{
    Accelerator, CommError, CommResult, Communicator, RankStat, SharedFile, MASTER_RANK,
};
use crate::hosts::local_hostname;

const TAG_BCAST: i32 = -1;
const TAG_GATHER: i32 = -2;
const TAG_MAXLOC: i32 = -3;
const TAG_MINLOC: i32 = -4;
const TAG_SUM: i32 = -5;

const ERR_RANK_RANGE: i32 = 5;
const ERR_TRUNCATE: i32 = 15;
const ERR_INVALID: i32 = 22;
const ERR_IO: i32 = 30;
const ERR_INJECTED: i32 = 50;

struct Envelope {
    src: usize,
    tag: i32,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    cv: Condvar,
}

struct Shared {
    size: usize,
    host: String,
    barrier: std::sync::Barrier,
    mailboxes: Vec<Mailbox>,
}

/// Handle construction for an in-process cluster of `size` ranks.
pub struct LoopbackCluster;

impl LoopbackCluster {
    /// Build one [`LoopbackRank`] handle per rank, to be moved into the
    /// thread that plays that rank.
    pub fn new(size: usize) -> Vec<LoopbackRank> {
        assert!(size > 0, "cluster needs at least one rank");
        let shared = Arc::new(Shared {
            size,
            host: local_hostname(),
            barrier: std::sync::Barrier::new(size),
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
        });
        (0..size)
            .map(|rank| LoopbackRank {
                shared: Arc::clone(&shared),
                rank,
            })
            .collect()
    }
}

/// Run `f` once per rank on its own thread and collect the results in rank
/// order.
pub fn run_on<T: Send>(
    size: usize,
    f: impl Fn(LoopbackRank) -> T + Send + Sync,
) -> Vec<T> {
    let ranks = LoopbackCluster::new(size);
    std::thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|rank| scope.spawn(move || f(rank)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// One rank's view of the loopback cluster.
pub struct LoopbackRank {
    shared: Arc<Shared>,
    rank: usize,
}

impl LoopbackRank {
    fn check_rank(&self, rank: usize, role: &str) -> CommResult<()> {
        if rank < self.shared.size {
            Ok(())
        } else {
            Err(CommError::new(
                ERR_RANK_RANGE,
                format!("{role} rank {rank} out of range for {} ranks", self.shared.size),
            ))
        }
    }

    fn encode_stat(stat: RankStat) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&stat.value.to_be_bytes());
        buf[8..].copy_from_slice(&(stat.rank as u64).to_be_bytes());
        buf
    }

    fn decode_stat(buf: &[u8; 16]) -> RankStat {
        let mut value = [0u8; 8];
        let mut rank = [0u8; 8];
        value.copy_from_slice(&buf[..8]);
        rank.copy_from_slice(&buf[8..]);
        RankStat {
            value: f64::from_be_bytes(value),
            rank: u64::from_be_bytes(rank) as usize,
        }
    }

    /// Gather the (value, rank) pair of every rank on the master,
    /// rank-ascending, which is what gives located reductions their
    /// lowest-rank tie-break.
    fn gather_stats(&self, value: RankStat, tag: i32) -> CommResult<Option<Vec<RankStat>>> {
        if self.rank != MASTER_RANK {
            self.send(MASTER_RANK, tag, &Self::encode_stat(value))?;
            return Ok(None);
        }
        let mut stats = vec![value];
        for src in 1..self.shared.size {
            let mut buf = [0u8; 16];
            self.recv(src, tag, &mut buf)?;
            stats.push(Self::decode_stat(&buf));
        }
        Ok(Some(stats))
    }
}

impl Communicator for LoopbackRank {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn processor_name(&self) -> CommResult<String> {
        Ok(format!("{}/slot{}", self.shared.host, self.rank))
    }

    fn barrier(&self) -> CommResult<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn send(&self, dest: usize, tag: i32, buf: &[u8]) -> CommResult<()> {
        self.check_rank(dest, "destination")?;
        let mailbox = &self.shared.mailboxes[dest];
        mailbox.queue.lock().push_back(Envelope {
            src: self.rank,
            tag,
            payload: buf.to_vec(),
        });
        mailbox.cv.notify_all();
        Ok(())
    }

    fn recv(&self, src: usize, tag: i32, buf: &mut [u8]) -> CommResult<usize> {
        self.check_rank(src, "source")?;
        let mailbox = &self.shared.mailboxes[self.rank];
        let mut queue = mailbox.queue.lock();
        let envelope = loop {
            if let Some(pos) = queue.iter().position(|e| e.src == src && e.tag == tag) {
                break queue.remove(pos).expect("matched position");
            }
            mailbox.cv.wait(&mut queue);
        };
        drop(queue);

        if envelope.payload.len() > buf.len() {
            return Err(CommError::new(
                ERR_TRUNCATE,
                format!(
                    "message truncated: {} B payload, {} B buffer",
                    envelope.payload.len(),
                    buf.len()
                ),
            ));
        }
        buf[..envelope.payload.len()].copy_from_slice(&envelope.payload);
        Ok(envelope.payload.len())
    }

    fn sendrecv(
        &self,
        dest: usize,
        send: &[u8],
        src: usize,
        recv: &mut [u8],
        tag: i32,
    ) -> CommResult<()> {
        self.send(dest, tag, send)?;
        self.recv(src, tag, recv)?;
        Ok(())
    }

    fn broadcast(&self, root: usize, buf: &mut [u8]) -> CommResult<()> {
        self.check_rank(root, "root")?;
        if self.rank == root {
            for dest in 0..self.shared.size {
                if dest != root {
                    self.send(dest, TAG_BCAST, buf)?;
                }
            }
            Ok(())
        } else {
            self.recv(root, TAG_BCAST, buf).map(|_| ())
        }
    }

    fn allgather(&self, send: &[u8], recv: &mut [u8]) -> CommResult<()> {
        let chunk = send.len();
        if recv.len() != chunk * self.shared.size {
            return Err(CommError::new(
                ERR_INVALID,
                format!(
                    "allgather buffer is {} B, expected {} B",
                    recv.len(),
                    chunk * self.shared.size
                ),
            ));
        }
        for dest in 0..self.shared.size {
            if dest != self.rank {
                self.send(dest, TAG_GATHER, send)?;
            }
        }
        recv[self.rank * chunk..(self.rank + 1) * chunk].copy_from_slice(send);
        for src in 0..self.shared.size {
            if src != self.rank {
                self.recv(src, TAG_GATHER, &mut recv[src * chunk..(src + 1) * chunk])?;
            }
        }
        Ok(())
    }

    fn allreduce_max(&self, value: f64) -> CommResult<f64> {
        let mut gathered = vec![0u8; 8 * self.shared.size];
        self.allgather(&value.to_be_bytes(), &mut gathered)?;
        let max = gathered
            .chunks_exact(8)
            .map(|c| f64::from_be_bytes(c.try_into().expect("8-byte chunk")))
            .fold(f64::NEG_INFINITY, f64::max);
        Ok(max)
    }

    fn reduce_maxloc(&self, value: RankStat) -> CommResult<Option<RankStat>> {
        Ok(self.gather_stats(value, TAG_MAXLOC)?.map(|stats| {
            stats
                .into_iter()
                .reduce(|best, next| if next.value > best.value { next } else { best })
                .expect("at least one rank")
        }))
    }

    fn reduce_minloc(&self, value: RankStat) -> CommResult<Option<RankStat>> {
        Ok(self.gather_stats(value, TAG_MINLOC)?.map(|stats| {
            stats
                .into_iter()
                .reduce(|best, next| if next.value < best.value { next } else { best })
                .expect("at least one rank")
        }))
    }

    fn reduce_sum(&self, value: f64) -> CommResult<Option<f64>> {
        Ok(self
            .gather_stats(RankStat::new(value, self.rank), TAG_SUM)?
            .map(|stats| stats.into_iter().map(|s| s.value).sum()))
    }

    fn open_shared(&self, path: &Path) -> CommResult<Box<dyn SharedFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(io_err)?;
        Ok(Box::new(LoopbackSharedFile {
            file,
            path: path.to_path_buf(),
        }))
    }

    fn abort(&self, code: i32) -> ! {
        error!(rank = self.rank, code, "aborting the job");
        std::process::exit(code);
    }
}

fn io_err(err: std::io::Error) -> CommError {
    CommError::new(err.raw_os_error().unwrap_or(ERR_IO), err.to_string())
}

struct LoopbackSharedFile {
    file: std::fs::File,
    path: PathBuf,
}

impl Drop for LoopbackSharedFile {
    // Delete-on-close also covers handles dropped on a probe's failure path.
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl SharedFile for LoopbackSharedFile {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> CommResult<usize> {
        self.file.write_at(buf, offset).map_err(io_err)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> CommResult<usize> {
        self.file.read_at(buf, offset).map_err(io_err)
    }

    fn close(self: Box<Self>) -> CommResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            // Another rank already deleted the shared file.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }
}

/// Lifecycle stages of the loopback accelerator, used for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelStage {
    Init,
    Available,
    Reserve,
    Start,
    Send,
    Recv,
    Mailbox,
    Wait,
    Release,
    Shutdown,
}

/// Increment-and-echo accelerator: receives a word-order-normalized u32,
/// adds one, and sends it back, reporting a clean mailbox code and a zero
/// exit status. Knobs exist to make any stage fail, skew the increment, or
/// dirty the mailbox, so the handshake probe's failure paths are testable.
pub struct LoopbackAccel {
    initialized: bool,
    reserved: u32,
    started: bool,
    wire: Option<[u8; 4]>,
    increment: u32,
    mailbox_code: u64,
    exit_status: i32,
    fail_stage: Option<AccelStage>,
}

impl Default for LoopbackAccel {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackAccel {
    pub fn new() -> Self {
        Self {
            initialized: false,
            reserved: 0,
            started: false,
            wire: None,
            increment: 1,
            mailbox_code: 0,
            exit_status: 0,
            fail_stage: None,
        }
    }

    /// Fail with an injected fault at the given stage.
    pub fn failing_at(stage: AccelStage) -> Self {
        Self {
            fail_stage: Some(stage),
            ..Self::new()
        }
    }

    /// Echo back `value + increment` instead of `value + 1`.
    pub fn with_increment(increment: u32) -> Self {
        Self {
            increment,
            ..Self::new()
        }
    }

    /// Report a non-zero aggregated fail code through the mailbox.
    pub fn with_mailbox_code(code: u64) -> Self {
        Self {
            mailbox_code: code,
            ..Self::new()
        }
    }

    /// Exit with a non-zero status.
    pub fn with_exit_status(status: i32) -> Self {
        Self {
            exit_status: status,
            ..Self::new()
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn reserved_count(&self) -> u32 {
        self.reserved
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn trip(&self, stage: AccelStage) -> CommResult<()> {
        if self.fail_stage == Some(stage) {
            Err(CommError::new(
                ERR_INJECTED,
                format!("injected fault at {stage:?}"),
            ))
        } else {
            Ok(())
        }
    }

    fn require(&self, ok: bool, what: &str) -> CommResult<()> {
        if ok {
            Ok(())
        } else {
            Err(CommError::new(ERR_INVALID, what.to_string()))
        }
    }
}

impl Accelerator for LoopbackAccel {
    fn init(&mut self) -> CommResult<()> {
        self.trip(AccelStage::Init)?;
        self.initialized = true;
        Ok(())
    }

    fn available(&mut self) -> CommResult<u32> {
        self.trip(AccelStage::Available)?;
        self.require(self.initialized, "available before init")?;
        Ok(1)
    }

    fn reserve(&mut self, count: u32) -> CommResult<u32> {
        self.trip(AccelStage::Reserve)?;
        self.require(self.initialized, "reserve before init")?;
        self.reserved = count.min(1);
        Ok(self.reserved)
    }

    fn start(&mut self, _args: &[String]) -> CommResult<()> {
        self.trip(AccelStage::Start)?;
        self.require(self.reserved > 0, "start before reserve")?;
        self.started = true;
        Ok(())
    }

    fn send_u32(&mut self, value: u32) -> CommResult<()> {
        self.trip(AccelStage::Send)?;
        self.require(self.started, "send before start")?;
        self.wire = Some(value.to_be_bytes());
        Ok(())
    }

    fn recv_u32(&mut self) -> CommResult<u32> {
        self.trip(AccelStage::Recv)?;
        self.require(self.started, "recv before start")?;
        let wire = self
            .wire
            .take()
            .ok_or_else(|| CommError::new(ERR_INVALID, "nothing to receive"))?;
        Ok(u32::from_be_bytes(wire).wrapping_add(self.increment))
    }

    fn mailbox_read(&mut self) -> CommResult<u64> {
        self.trip(AccelStage::Mailbox)?;
        self.require(self.started, "mailbox read before start")?;
        Ok(self.mailbox_code)
    }

    fn wait(&mut self) -> CommResult<i32> {
        self.trip(AccelStage::Wait)?;
        self.require(self.started, "wait before start")?;
        self.started = false;
        Ok(self.exit_status)
    }

    fn release(&mut self) -> CommResult<()> {
        self.trip(AccelStage::Release)?;
        self.require(self.reserved > 0, "release before reserve")?;
        self.reserved = 0;
        Ok(())
    }

    fn shutdown(&mut self) -> CommResult<()> {
        self.trip(AccelStage::Shutdown)?;
        self.require(self.initialized, "shutdown before init")?;
        self.initialized = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sendrecv_ring_completes() {
        let results = run_on(4, |comm| {
            let right = (comm.rank() + 1) % comm.size();
            let left = (comm.rank() + comm.size() - 1) % comm.size();
            let send = [comm.rank() as u8; 8];
            let mut recv = [0u8; 8];
            comm.sendrecv(right, &send, left, &mut recv, 42).unwrap();
            recv[0] as usize
        });
        assert_eq!(results, vec![3, 0, 1, 2]);
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        let results = run_on(3, |comm| {
            let mut buf = if comm.rank() == 0 { [7u8; 16] } else { [0u8; 16] };
            comm.broadcast(0, &mut buf).unwrap();
            buf[15]
        });
        assert_eq!(results, vec![7, 7, 7]);
    }

    #[test]
    fn allgather_orders_by_rank() {
        let results = run_on(3, |comm| {
            let send = [comm.rank() as u8];
            let mut recv = [0u8; 3];
            comm.allgather(&send, &mut recv).unwrap();
            recv
        });
        for recv in results {
            assert_eq!(recv, [0, 1, 2]);
        }
    }

    #[test]
    fn allreduce_max_finds_highest_rank() {
        let results = run_on(4, |comm| comm.allreduce_max(comm.rank() as f64).unwrap());
        assert_eq!(results, vec![3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn located_reductions_report_owner() {
        let values = [10.0, 30.0, 20.0];
        let results = run_on(3, |comm| {
            let stat = RankStat::new(values[comm.rank()], comm.rank());
            let max = comm.reduce_maxloc(stat).unwrap();
            let min = comm.reduce_minloc(stat).unwrap();
            let sum = comm.reduce_sum(stat.value).unwrap();
            (max, min, sum)
        });

        let (max, min, sum) = results[0].clone();
        assert_eq!(max, Some(RankStat::new(30.0, 1)));
        assert_eq!(min, Some(RankStat::new(10.0, 0)));
        assert_eq!(sum, Some(60.0));
        for (max, min, sum) in &results[1..] {
            assert!(max.is_none() && min.is_none() && sum.is_none());
        }
    }

    #[test]
    fn located_reduction_ties_go_to_the_lowest_rank() {
        let results = run_on(3, |comm| {
            let stat = RankStat::new(5.0, comm.rank());
            comm.reduce_maxloc(stat).unwrap()
        });
        assert_eq!(results[0], Some(RankStat::new(5.0, 0)));

        let results = run_on(3, |comm| {
            let stat = RankStat::new(5.0, comm.rank());
            comm.reduce_minloc(stat).unwrap()
        });
        assert_eq!(results[0], Some(RankStat::new(5.0, 0)));
    }

    #[test]
    fn truncated_receive_is_an_error() {
        let results = run_on(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, 9, &[0u8; 32]).unwrap();
                Ok(0)
            } else {
                let mut small = [0u8; 8];
                comm.recv(0, 9, &mut small).map(|_| 0)
            }
        });
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().code(), ERR_TRUNCATE);
    }

    #[test]
    fn out_of_range_rank_is_an_error() {
        let results = run_on(2, |comm| comm.send(5, 0, &[0u8; 1]));
        assert_eq!(results[0].as_ref().unwrap_err().code(), ERR_RANK_RANGE);
    }

    #[test]
    fn accel_echoes_incremented_payload() {
        let mut accel = LoopbackAccel::new();
        accel.init().unwrap();
        assert_eq!(accel.available().unwrap(), 1);
        assert_eq!(accel.reserve(1).unwrap(), 1);
        accel.start(&[]).unwrap();
        accel.send_u32(123).unwrap();
        assert_eq!(accel.recv_u32().unwrap(), 124);
        assert_eq!(accel.mailbox_read().unwrap(), 0);
        assert_eq!(accel.wait().unwrap(), 0);
        accel.release().unwrap();
        accel.shutdown().unwrap();
    }

    #[test]
    fn accel_enforces_stage_order() {
        let mut accel = LoopbackAccel::new();
        assert_eq!(accel.reserve(1).unwrap_err().code(), ERR_INVALID);
        accel.init().unwrap();
        assert_eq!(accel.start(&[]).unwrap_err().code(), ERR_INVALID);
    }

    #[test]
    fn accel_fault_injection_hits_the_right_stage() {
        let mut accel = LoopbackAccel::failing_at(AccelStage::Reserve);
        accel.init().unwrap();
        assert_eq!(accel.reserve(1).unwrap_err().code(), ERR_INJECTED);
    }
}
