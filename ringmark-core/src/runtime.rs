//! Seam to the distributed runtime.
//!
//! The harness never talks to an interconnect directly. Everything it needs
//! from the parallel job — point-to-point exchange, collectives, shared-file
//! I/O, accelerator launch — goes through the traits below, and every
//! operation reports failure as a [`CommError`] carrying the runtime's raw
//! integer code plus a human-readable description. The bundled loopback
//! implementation lives in [`loopback`]; production deployments implement
//! [`Communicator`] over their own runtime.

use std::fmt;
use std::path::Path;

pub mod loopback;

/// The rank that prints reports and roots the reductions.
pub const MASTER_RANK: usize = 0;

/// Raw failure surfaced by a runtime operation.
#[derive(Debug, Clone)]
pub struct CommError {
    code: i32,
    message: String,
}

impl CommError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The runtime's raw error code, fed into the fail-code encoder.
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn description(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)
    }
}

impl std::error::Error for CommError {}

pub type CommResult<T> = std::result::Result<T, CommError>;

/// A (value, owning rank) pair for the located reductions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankStat {
    pub value: f64,
    pub rank: usize,
}

impl RankStat {
    pub fn new(value: f64, rank: usize) -> Self {
        Self { value, rank }
    }
}

/// Blocking communication surface of the parallel job.
///
/// All operations are collective or matched point-to-point calls that may
/// block indefinitely if a peer has crashed or diverged; callers that need a
/// bound on that wrap the call with the watchdog.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Name of the processor this rank runs on.
    fn processor_name(&self) -> CommResult<String>;

    fn barrier(&self) -> CommResult<()>;

    fn send(&self, dest: usize, tag: i32, buf: &[u8]) -> CommResult<()>;

    /// Receive a message from `src` with `tag` into `buf`; returns the number
    /// of bytes received.
    fn recv(&self, src: usize, tag: i32, buf: &mut [u8]) -> CommResult<usize>;

    /// Combined exchange: send to `dest` while receiving from `src`.
    fn sendrecv(
        &self,
        dest: usize,
        send: &[u8],
        src: usize,
        recv: &mut [u8],
        tag: i32,
    ) -> CommResult<()>;

    /// Broadcast `buf` from `root` to every rank.
    fn broadcast(&self, root: usize, buf: &mut [u8]) -> CommResult<()>;

    /// Gather `send` from every rank into `recv` on every rank, ordered by
    /// rank. `recv` must be `send.len() * size()` bytes.
    fn allgather(&self, send: &[u8], recv: &mut [u8]) -> CommResult<()>;

    fn allreduce_max(&self, value: f64) -> CommResult<f64>;

    /// Maximum-with-location rooted at [`MASTER_RANK`]; `Some` on the master,
    /// `None` elsewhere. Ties resolve to the lowest rank index.
    fn reduce_maxloc(&self, value: RankStat) -> CommResult<Option<RankStat>>;

    /// Minimum-with-location rooted at [`MASTER_RANK`]; ties resolve to the
    /// lowest rank index.
    fn reduce_minloc(&self, value: RankStat) -> CommResult<Option<RankStat>>;

    /// Sum rooted at [`MASTER_RANK`].
    fn reduce_sum(&self, value: f64) -> CommResult<Option<f64>>;

    /// Open a file shared by every rank of the job for windowed read/write.
    fn open_shared(&self, path: &Path) -> CommResult<Box<dyn SharedFile>>;

    /// Abnormal termination of the whole job.
    fn abort(&self, code: i32) -> !;
}

/// A job-shared file handle with explicit offsets, deleted on close.
pub trait SharedFile: Send {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> CommResult<usize>;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> CommResult<usize>;

    /// Close the handle and delete the underlying file.
    fn close(self: Box<Self>) -> CommResult<()>;
}

/// Remote accelerator reservation and its launched process.
///
/// Acquisition stages must be driven in order (init, reserve, start); the
/// handshake payload travels word-byte-order-normalized in both directions.
pub trait Accelerator: Send {
    fn init(&mut self) -> CommResult<()>;

    /// Number of accelerator devices available for reservation.
    fn available(&mut self) -> CommResult<u32>;

    /// Reserve `count` devices; returns the number actually reserved.
    fn reserve(&mut self, count: u32) -> CommResult<u32>;

    /// Launch the accelerator-side program on the reservation.
    fn start(&mut self, args: &[String]) -> CommResult<()>;

    fn send_u32(&mut self, value: u32) -> CommResult<()>;

    fn recv_u32(&mut self) -> CommResult<u32>;

    /// Out-of-band read of the accelerator program's aggregated fail code.
    fn mailbox_read(&mut self) -> CommResult<u64>;

    /// Wait for the accelerator process; returns its exit status.
    fn wait(&mut self) -> CommResult<i32>;

    /// Release the device reservation.
    fn release(&mut self) -> CommResult<()>;

    /// Tear down the accelerator runtime session.
    fn shutdown(&mut self) -> CommResult<()>;
}

/// Builder for per-probe accelerator sessions.
pub type AccelFactory = dyn Fn() -> Box<dyn Accelerator> + Sync;
