//! Per-process diagnostic session and the guarded-call wrapper.
//!
//! One `DiagnosticSession` exists per rank for the lifetime of the process.
//! Every runtime operation a probe makes goes through [`DiagnosticSession::guarded`],
//! which logs the call according to the configured verbosity and records the
//! *first* failure as an encoded fail code. Guarded calls never panic and
//! never abort: callers must consult [`DiagnosticSession::failed`] before
//! proceeding to the next guarded step, which is what lets a partially failed
//! probe still run its cleanup stages.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error};

use crate::error::{RingmarkError, RingmarkResult};
use crate::failcode::FailCode;
use crate::runtime::CommResult;

/// Protocol version folded into every fail code.
pub const PROTOCOL_VERSION: u32 = 11;

/// Message verbosity, ordered: each level includes everything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MsgLevel {
    /// No messages ever; results via fail code only.
    None,
    /// Failures only, to the error stream.
    Fail,
    /// Raw call results.
    Result,
    /// Call announcements before invocation.
    Progress,
    /// Everything.
    Debug,
}

/// How far the staged acquisition probes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbeDepth {
    /// Runtime session init/teardown only.
    Init,
    /// Also reserve devices.
    Reserve,
    /// Also launch the remote program.
    Start,
    /// Also exchange handshake messages.
    SendRecv,
    /// Everything.
    All,
}

/// Identifies one guarded call site. Major/minor pairs are unique across the
/// crate so a fail code pins down exactly one call.
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    pub major: u32,
    pub minor: u32,
    pub name: &'static str,
}

pub const fn site(major: u32, minor: u32, name: &'static str) -> CallSite {
    CallSite { major, minor, name }
}

/// Process-wide diagnostic state for one rank.
pub struct DiagnosticSession {
    version: u32,
    msg_level: MsgLevel,
    depth: ProbeDepth,
    fail: AtomicU64,
}

impl DiagnosticSession {
    pub fn new(msg_level: MsgLevel, depth: ProbeDepth) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_level,
            depth,
            fail: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn msg_level(&self) -> MsgLevel {
        self.msg_level
    }

    pub fn depth(&self) -> ProbeDepth {
        self.depth
    }

    pub fn failed(&self) -> bool {
        self.fail.load(Ordering::Acquire) != 0
    }

    pub fn fail_code(&self) -> FailCode {
        FailCode::from_raw(self.fail.load(Ordering::Acquire))
    }

    /// Record a failure; the first recorded code wins, later ones are dropped.
    pub fn record_failure(&self, code: FailCode) {
        let _ = self
            .fail
            .compare_exchange(0, code.value(), Ordering::AcqRel, Ordering::Acquire);
    }

    /// Fold another session's aggregated fail code into this one (used for
    /// the accelerator's mailbox-reported code). First write still wins.
    pub fn absorb(&self, code: u64) {
        if code != 0 {
            self.record_failure(FailCode::from_raw(code));
        }
    }

    /// Invoke a runtime operation behind the guard: log it, capture its
    /// status, and on failure encode and record a fail code. Returns the
    /// operation's value on success, `None` on failure.
    pub fn guarded<T>(&self, at: CallSite, op: impl FnOnce() -> CommResult<T>) -> Option<T> {
        if self.msg_level >= MsgLevel::Progress {
            debug!(call = at.name, major = at.major, minor = at.minor, "calling");
        }
        match op() {
            Ok(value) => {
                if self.msg_level >= MsgLevel::Result {
                    debug!(call = at.name, code = 0, "ok");
                }
                Some(value)
            }
            Err(err) => {
                if self.msg_level >= MsgLevel::Result {
                    debug!(
                        call = at.name,
                        code = err.code(),
                        description = err.description(),
                        "failed"
                    );
                }
                let fail_code = FailCode::encode(self.version, at.major, at.minor, err.code());
                self.record_failure(fail_code);
                if self.msg_level >= MsgLevel::Fail {
                    error!(
                        fail_code = fail_code.value(),
                        call = at.name,
                        code = err.code(),
                        description = err.description(),
                        "guarded call failed"
                    );
                }
                None
            }
        }
    }

    /// Post-condition variant of [`guarded`](Self::guarded): records `raw`
    /// under the call site when `ok` is false. Returns the predicate value.
    pub fn check(&self, at: CallSite, ok: bool, raw: i32) -> bool {
        if ok {
            if self.msg_level >= MsgLevel::Progress {
                debug!(check = at.name, "check ok");
            }
        } else {
            let fail_code = FailCode::encode(self.version, at.major, at.minor, raw);
            self.record_failure(fail_code);
            if self.msg_level >= MsgLevel::Fail {
                error!(
                    fail_code = fail_code.value(),
                    check = at.name,
                    raw,
                    "check failed"
                );
            }
        }
        ok
    }

    /// Error out of a probe if a guarded step has failed.
    pub fn ensure_clean(&self, context: &str) -> RingmarkResult<()> {
        let code = self.fail_code();
        if code.is_clean() {
            Ok(())
        } else {
            Err(RingmarkError::ProbeFailed {
                probe: context.to_string(),
                code: code.value(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CommError;

    fn session() -> DiagnosticSession {
        DiagnosticSession::new(MsgLevel::Fail, ProbeDepth::All)
    }

    #[test]
    fn clean_session_reports_no_failure() {
        let s = session();
        assert!(!s.failed());
        assert!(s.fail_code().is_clean());
        assert!(s.ensure_clean("x").is_ok());
    }

    #[test]
    fn guarded_success_passes_value_through() {
        let s = session();
        let got = s.guarded(site(1, 1, "op"), || Ok::<_, CommError>(42));
        assert_eq!(got, Some(42));
        assert!(!s.failed());
    }

    #[test]
    fn guarded_failure_records_encoded_code() {
        let s = session();
        let got: Option<()> =
            s.guarded(site(4, 2, "send"), || Err(CommError::new(-7, "link down")));
        assert!(got.is_none());
        assert_eq!(
            s.fail_code(),
            FailCode::encode(PROTOCOL_VERSION, 4, 2, 7)
        );
    }

    #[test]
    fn first_failure_wins() {
        let s = session();
        let first = FailCode::encode(PROTOCOL_VERSION, 2, 1, 5);
        s.guarded::<()>(site(2, 1, "reserve"), || Err(CommError::new(5, "no devices")));
        s.guarded::<()>(site(3, 1, "start"), || Err(CommError::new(9, "launch failed")));
        assert_eq!(s.fail_code(), first);
    }

    #[test]
    fn check_records_raw_code_on_false() {
        let s = session();
        assert!(s.check(site(4, 6, "echo+1"), true, 0));
        assert!(!s.failed());
        assert!(!s.check(site(4, 6, "echo+1"), false, 124));
        assert_eq!(
            s.fail_code(),
            FailCode::encode(PROTOCOL_VERSION, 4, 6, 124)
        );
    }

    #[test]
    fn absorb_folds_remote_code_first_write_wins() {
        let s = session();
        s.absorb(0);
        assert!(!s.failed());
        s.absorb(110_202_005);
        s.absorb(110_303_009);
        assert_eq!(s.fail_code().value(), 110_202_005);
    }

    #[test]
    fn ensure_clean_surfaces_probe_failure() {
        let s = session();
        s.guarded::<()>(site(1, 1, "init"), || Err(CommError::new(1, "boom")));
        let err = s.ensure_clean("handshake").unwrap_err();
        match err {
            RingmarkError::ProbeFailed { probe, code } => {
                assert_eq!(probe, "handshake");
                assert_eq!(code, s.fail_code().value());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
