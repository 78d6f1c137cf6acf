//! Accelerator reservation and handshake probe.
//!
//! The acquisition chain runs init, reserve, start in strict order, each
//! stage attempted only while the session is still clean and recorded in the
//! stage ledger. Teardown then walks the ledger in reverse: collect the
//! launched process (mailbox fail code, exit status), release the
//! reservation, shut the runtime session down — each step only if its stage
//! actually succeeded, so a reservation that never happened is never
//! released.

use crate::error::RingmarkResult;
use crate::lifecycle::StageLedger;
use crate::runtime::Accelerator;
use crate::session::{site, CallSite, DiagnosticSession, ProbeDepth};
use crate::suite::ProbeCtx;

/// Payload the parent sends; the accelerator must echo it back plus one.
pub const HANDSHAKE_PAYLOAD: u32 = 123;

const ACCEL_INIT: CallSite = site(21, 1, "accel init");
const ACCEL_AVAILABLE: CallSite = site(22, 1, "accel available");
const CHECK_AVAILABLE: CallSite = site(22, 2, "an accelerator is available");
const ACCEL_RESERVE: CallSite = site(22, 3, "accel reserve");
const CHECK_RESERVED: CallSite = site(22, 4, "exactly one accelerator reserved");
const ACCEL_START: CallSite = site(23, 1, "accel start");
const ACCEL_SEND: CallSite = site(24, 2, "accel send");
const ACCEL_RECV: CallSite = site(24, 4, "accel recv");
const CHECK_ECHO: CallSite = site(24, 6, "echo equals payload plus one");
const ACCEL_MAILBOX: CallSite = site(25, 1, "accel mailbox read");
const CHECK_MAILBOX: CallSite = site(25, 2, "accelerator fail code is clean");
const ACCEL_WAIT: CallSite = site(25, 3, "accel wait");
const CHECK_EXIT: CallSite = site(25, 4, "accelerator exit status is zero");
const ACCEL_RELEASE: CallSite = site(26, 1, "accel release");
const ACCEL_SHUTDOWN: CallSite = site(26, 2, "accel shutdown");

const STAGE_INIT: &str = "init";
const STAGE_RESERVE: &str = "reserve";
const STAGE_START: &str = "start";

/// Registry entry: run the full handshake against a fresh accelerator
/// session from the context's factory.
pub fn accel_handshake(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    ctx.announce("       running accelerator diagnostics");
    let mut accel = (ctx.accel_factory)();
    run_handshake(ctx.session, accel.as_mut());
    ctx.session.ensure_clean("accel_handshake")
}

/// Acquisition, handshake, and reverse-order teardown. Failures land in the
/// session (first write wins); the caller decides what a dirty session means.
pub fn run_handshake(session: &DiagnosticSession, accel: &mut dyn Accelerator) {
    let mut ledger = StageLedger::new();
    acquire_and_exchange(session, accel, &mut ledger);
    teardown(session, accel, &mut ledger);
}

fn acquire_and_exchange(
    session: &DiagnosticSession,
    accel: &mut dyn Accelerator,
    ledger: &mut StageLedger,
) {
    let depth = session.depth();

    let init_ok = session.guarded(ACCEL_INIT, || accel.init()).is_some();
    ledger.record(STAGE_INIT, init_ok);

    if depth < ProbeDepth::Reserve {
        return;
    }

    let mut available = None;
    if !session.failed() {
        available = session.guarded(ACCEL_AVAILABLE, || accel.available());
    }
    if !session.failed() {
        let n = available.unwrap_or(0);
        session.check(CHECK_AVAILABLE, n >= 1, n as i32);
    }

    let mut reserved = None;
    if !session.failed() {
        reserved = session.guarded(ACCEL_RESERVE, || accel.reserve(1));
    }
    ledger.record(STAGE_RESERVE, reserved.is_some());
    if !session.failed() {
        let n = reserved.unwrap_or(0);
        session.check(CHECK_RESERVED, n == 1, n as i32);
    }

    if depth < ProbeDepth::Start {
        return;
    }

    let mut start_ok = false;
    if !session.failed() {
        let args = [format!("{:?}", session.msg_level()), format!("{depth:?}")];
        start_ok = session.guarded(ACCEL_START, || accel.start(&args)).is_some();
    }
    ledger.record(STAGE_START, start_ok);

    if depth < ProbeDepth::SendRecv {
        return;
    }

    if !session.failed() {
        session.guarded(ACCEL_SEND, || accel.send_u32(HANDSHAKE_PAYLOAD));
    }
    let mut echo = None;
    if !session.failed() {
        echo = session.guarded(ACCEL_RECV, || accel.recv_u32());
    }
    if !session.failed() {
        let got = echo.unwrap_or(0);
        session.check(CHECK_ECHO, got == HANDSHAKE_PAYLOAD + 1, got as i32);
    }
}

/// Reverse-order release of whatever was acquired, even with the session
/// dirty: best-effort cleanup must still return the devices it holds.
fn teardown(session: &DiagnosticSession, accel: &mut dyn Accelerator, ledger: &mut StageLedger) {
    ledger.release_in_reverse(|stage| match stage {
        STAGE_START => {
            if let Some(code) = session.guarded(ACCEL_MAILBOX, || accel.mailbox_read()) {
                session.absorb(code);
                session.check(CHECK_MAILBOX, code == 0, (code % 1000) as i32);
            }
            if let Some(status) = session.guarded(ACCEL_WAIT, || accel.wait()) {
                session.check(CHECK_EXIT, status == 0, status);
            }
        }
        STAGE_RESERVE => {
            session.guarded(ACCEL_RELEASE, || accel.release());
        }
        STAGE_INIT => {
            session.guarded(ACCEL_SHUTDOWN, || accel.shutdown());
        }
        _ => {}
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failcode::FailCode;
    use crate::runtime::loopback::{AccelStage, LoopbackAccel};
    use crate::session::{MsgLevel, PROTOCOL_VERSION};

    fn session() -> DiagnosticSession {
        DiagnosticSession::new(MsgLevel::None, ProbeDepth::All)
    }

    #[test]
    fn clean_handshake_leaves_nothing_acquired() {
        let s = session();
        let mut accel = LoopbackAccel::new();
        run_handshake(&s, &mut accel);

        assert!(!s.failed(), "fail code {}", s.fail_code());
        assert!(!accel.is_initialized());
        assert_eq!(accel.reserved_count(), 0);
        assert!(!accel.is_started());
    }

    #[test]
    fn wrong_increment_is_an_echo_check_failure() {
        let s = session();
        let mut accel = LoopbackAccel::with_increment(2);
        run_handshake(&s, &mut accel);

        // 123 + 2 came back, so the recorded raw code is the bad echo 125.
        assert_eq!(
            s.fail_code(),
            FailCode::encode(PROTOCOL_VERSION, CHECK_ECHO.major, CHECK_ECHO.minor, 125)
        );
        // Cleanup still ran to completion.
        assert!(!accel.is_initialized());
        assert_eq!(accel.reserved_count(), 0);
    }

    #[test]
    fn reserve_failure_releases_init_only() {
        let s = session();
        let mut accel = LoopbackAccel::failing_at(AccelStage::Reserve);
        run_handshake(&s, &mut accel);

        assert_eq!(
            s.fail_code(),
            FailCode::encode(PROTOCOL_VERSION, ACCEL_RESERVE.major, ACCEL_RESERVE.minor, 50)
        );
        // Shutdown ran (init was acquired); release was never attempted
        // because the reservation never existed.
        assert!(!accel.is_initialized());
        assert_eq!(accel.reserved_count(), 0);
        assert!(!accel.is_started());
    }

    #[test]
    fn accelerator_reported_fail_code_is_absorbed_first() {
        let s = session();
        let mut accel = LoopbackAccel::with_mailbox_code(910_512_007);
        run_handshake(&s, &mut accel);

        // The mailbox code wins over the local mailbox check that follows it.
        assert_eq!(s.fail_code().value(), 910_512_007);
    }

    #[test]
    fn nonzero_exit_status_is_a_check_failure() {
        let s = session();
        let mut accel = LoopbackAccel::with_exit_status(3);
        run_handshake(&s, &mut accel);

        assert_eq!(
            s.fail_code(),
            FailCode::encode(PROTOCOL_VERSION, CHECK_EXIT.major, CHECK_EXIT.minor, 3)
        );
    }

    #[test]
    fn shallow_depth_stops_after_init() {
        let s = DiagnosticSession::new(MsgLevel::None, ProbeDepth::Init);
        let mut accel = LoopbackAccel::with_increment(99);
        run_handshake(&s, &mut accel);

        // Init/shutdown only: the skewed echo path was never exercised.
        assert!(!s.failed());
        assert!(!accel.is_initialized());
        assert_eq!(accel.reserved_count(), 0);
    }
}
