//! Asynchronous crash reporting.
//!
//! A handler is installed over the fault signal set at process start, with
//! the previously active dispositions saved. Faults are diagnosed, never
//! handled: the handler logs what it can, prints a symbolized backtrace,
//! restores the original handlers, and re-raises so the OS-level disposition
//! (typically termination with a core dump) still takes effect. A
//! termination request only re-arms the handler and returns, leaving the
//! deliberate-shutdown decision to the rest of the process.

use std::backtrace::Backtrace;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};
use std::time::Duration;

use crate::error::{RingmarkError, RingmarkResult};

/// Signals the crash handler covers.
pub const GUARDED_SIGNALS: [i32; 6] = [
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGABRT,
    libc::SIGTERM,
];

/// Pause between the report and the re-raise so the message reaches the
/// stream before the process dies.
const FLUSH_PAUSE: Duration = Duration::from_secs(1);

struct SavedActions(UnsafeCell<MaybeUninit<[libc::sigaction; GUARDED_SIGNALS.len()]>>);

// SAFETY: written only under the INSTALLED install/restore protocol; the
// handler reads it only after install completed.
unsafe impl Sync for SavedActions {}

static SAVED: SavedActions = SavedActions(UnsafeCell::new(MaybeUninit::uninit()));
static INSTALLED: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicPtr<AtomicI32> = AtomicPtr::new(ptr::null_mut());

pub fn signal_name(signo: i32) -> &'static str {
    match signo {
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGABRT => "SIGABRT",
        libc::SIGTERM => "SIGTERM",
        _ => "UNKNOWN",
    }
}

fn is_fault(signo: i32) -> bool {
    matches!(
        signo,
        libc::SIGFPE | libc::SIGILL | libc::SIGSEGV | libc::SIGBUS
    )
}

fn handler_action() -> libc::sigaction {
    // SAFETY: an all-zero sigaction is a valid starting point on every
    // supported platform.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction =
        handler as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    action
}

extern "C" fn handler(signo: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let slot = LAST_SIGNAL.load(Ordering::Acquire);
    if !slot.is_null() {
        // SAFETY: the slot is a 'static AtomicI32 registered at install time.
        unsafe { (*slot).store(signo, Ordering::Release) };
    }

    let (errno, code) = if info.is_null() {
        (0, 0)
    } else {
        // SAFETY: the kernel hands a valid siginfo_t to an SA_SIGINFO handler.
        unsafe { ((*info).si_errno, (*info).si_code) }
    };

    if is_fault(signo) && !info.is_null() {
        // SAFETY: si_addr is valid for memory and arithmetic faults.
        let addr = unsafe { (*info).si_addr() };
        eprintln!(
            "{}({}) errno:{} code:{} address {:p}",
            signal_name(signo),
            signo,
            errno,
            code,
            addr
        );
    } else {
        eprintln!(
            "{}({}) errno:{} code:{}",
            signal_name(signo),
            signo,
            errno,
            code
        );
    }

    if signo == libc::SIGTERM {
        // Re-arm so future termination requests are still caught, then hand
        // control back to the interrupted thread.
        let action = handler_action();
        // SAFETY: installing a valid handler for a valid signal number.
        unsafe { libc::sigaction(libc::SIGTERM, &action, ptr::null_mut()) };
        return;
    }

    // Fault path: report the stack, restore the saved dispositions, and let
    // the signal take its default effect on the re-raise.
    let backtrace = Backtrace::force_capture();
    eprintln!("{backtrace}");
    std::thread::sleep(FLUSH_PAUSE);
    let _ = restore();
    // SAFETY: re-raising the signal we are handling.
    unsafe { libc::raise(signo) };
}

/// Install the crash handler over [`GUARDED_SIGNALS`], saving the previous
/// dispositions for [`restore`]. An optional last-signal slot receives the
/// number of every caught signal, letting callers distinguish a deliberate
/// termination request from a fault.
pub fn install(last_signal: Option<&'static AtomicI32>) -> RingmarkResult<()> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(RingmarkError::InvalidArgument {
            field: "crash handler".to_string(),
            message: "already installed".to_string(),
        });
    }

    match last_signal {
        Some(slot) => {
            slot.store(0, Ordering::Release);
            LAST_SIGNAL.store(slot as *const AtomicI32 as *mut AtomicI32, Ordering::Release);
        }
        None => LAST_SIGNAL.store(ptr::null_mut(), Ordering::Release),
    }

    let action = handler_action();
    // SAFETY: SAVED is only written here, before any handler can read it.
    let saved = unsafe { (*SAVED.0.get()).as_mut_ptr() };
    for (i, &signo) in GUARDED_SIGNALS.iter().enumerate() {
        // SAFETY: valid signal number, valid action, valid save slot.
        let rc = unsafe { libc::sigaction(signo, &action, &mut (*saved)[i]) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            INSTALLED.store(false, Ordering::Release);
            return Err(RingmarkError::Generic(format!(
                "sigaction for {} failed: {err}",
                signal_name(signo)
            )));
        }
    }
    Ok(())
}

/// Restore every disposition saved at install time. Idempotent.
pub fn restore() -> RingmarkResult<()> {
    if !INSTALLED.swap(false, Ordering::AcqRel) {
        return Ok(());
    }
    // SAFETY: install completed, so SAVED holds valid saved actions.
    let saved = unsafe { &*(*SAVED.0.get()).as_ptr() };
    for (i, &signo) in GUARDED_SIGNALS.iter().enumerate() {
        // SAFETY: restoring a previously saved action for a valid signal.
        let rc = unsafe { libc::sigaction(signo, &saved[i], ptr::null_mut()) };
        if rc != 0 {
            return Err(RingmarkError::Generic(format!(
                "restoring handler for {} failed: {}",
                signal_name(signo),
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    static LAST: AtomicI32 = AtomicI32::new(0);

    #[test]
    #[serial]
    fn termination_request_is_caught_and_rearmed() {
        install(Some(&LAST)).expect("install");

        // SAFETY: raising a signal we installed a returning handler for.
        unsafe { libc::raise(libc::SIGTERM) };
        assert_eq!(LAST.load(Ordering::Acquire), libc::SIGTERM);

        // The handler re-armed itself: a second request is caught too.
        LAST.store(0, Ordering::Release);
        unsafe { libc::raise(libc::SIGTERM) };
        assert_eq!(LAST.load(Ordering::Acquire), libc::SIGTERM);

        restore().expect("restore");
    }

    #[test]
    #[serial]
    fn double_install_is_rejected() {
        install(None).expect("install");
        assert!(install(None).is_err());
        restore().expect("restore");
        // Restoring twice is fine.
        restore().expect("second restore");
    }

    #[test]
    fn signal_names_cover_the_guarded_set() {
        for signo in GUARDED_SIGNALS {
            assert_ne!(signal_name(signo), "UNKNOWN");
        }
        assert_eq!(signal_name(9999), "UNKNOWN");
    }
}
