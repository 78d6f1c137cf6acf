//! Deadline watchdog for blocking exchanges.
//!
//! A collective or point-to-point call can block forever if a peer rank has
//! crashed or diverged. The watchdog converts that silent hang into an
//! attributed failure report: callers arm it immediately before a risky
//! blocking call and disarm it immediately after the call returns. If the
//! deadline expires first, the escape handler identifies the loop iteration
//! and both ring neighbors involved in the stalled exchange and terminates
//! the process — the remote peer's state is unknown, so there is nothing to
//! recover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::hosts::{local_hostname, HostTable};

/// Which exchange a deadline covers: the loop iteration and the ring
/// neighbors the blocked call talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HangContext {
    pub iteration: usize,
    pub left: usize,
    pub right: usize,
}

struct Armed {
    deadline: Instant,
    ctx: HangContext,
}

struct State {
    armed: Mutex<Option<Armed>>,
    cv: Condvar,
    stop: AtomicBool,
}

/// A cancellable deadline around one blocking call at a time.
pub struct Watchdog {
    state: Arc<State>,
    monitor: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the monitor thread with the given escape action. The default
    /// production escape is [`fatal_escape`]; tests inject an observer.
    pub fn new(escape: impl Fn(&HangContext) + Send + Sync + 'static) -> Self {
        let state = Arc::new(State {
            armed: Mutex::new(None),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let monitor_state = Arc::clone(&state);
        let monitor = std::thread::Builder::new()
            .name("ringmark-watchdog".into())
            .spawn(move || monitor_loop(monitor_state, escape))
            .expect("spawn watchdog thread");
        Self {
            state,
            monitor: Some(monitor),
        }
    }

    /// Arm a deadline for the exchange described by `ctx`. Arming while
    /// already armed replaces the pending deadline; deadlines never stack.
    pub fn arm(&self, deadline: Duration, ctx: HangContext) {
        let mut armed = self.state.armed.lock();
        *armed = Some(Armed {
            deadline: Instant::now() + deadline,
            ctx,
        });
        self.state.cv.notify_all();
    }

    /// Cancel any pending deadline.
    pub fn disarm(&self) {
        let mut armed = self.state.armed.lock();
        *armed = None;
        self.state.cv.notify_all();
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed.lock().is_some()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::Release);
        self.state.cv.notify_all();
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
    }
}

fn monitor_loop(state: Arc<State>, escape: impl Fn(&HangContext)) {
    loop {
        let mut armed = state.armed.lock();
        if state.stop.load(Ordering::Acquire) {
            return;
        }
        match armed.as_ref().map(|a| a.deadline) {
            None => {
                state.cv.wait(&mut armed);
            }
            Some(deadline) => {
                if Instant::now() >= deadline {
                    let expired = armed.take().expect("deadline present");
                    drop(armed);
                    escape(&expired.ctx);
                } else {
                    let _ = state.cv.wait_until(&mut armed, deadline);
                }
            }
        }
    }
}

/// Render the attributed hang report for a fired deadline.
pub fn hang_report(rank: usize, hosts: &HostTable, ctx: &HangContext) -> String {
    format!(
        "########## HANG DETECTED [on loop iteration: {}] {} ({}) ==> {} ({}) ==> {} ({}) ##########",
        ctx.iteration,
        ctx.left,
        hosts.get(ctx.left),
        rank,
        local_hostname(),
        ctx.right,
        hosts.get(ctx.right),
    )
}

/// Production escape: write the hang report to the error stream and
/// terminate the process immediately. No unwind, no cleanup — in-flight
/// collective state is undefined once a peer has stalled.
pub fn fatal_escape(rank: usize, hosts: Arc<HostTable>) -> impl Fn(&HangContext) + Send + Sync {
    move |ctx| {
        eprintln!("{}", hang_report(rank, &hosts, ctx));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const CTX: HangContext = HangContext {
        iteration: 3,
        left: 1,
        right: 3,
    };

    fn observed() -> (Watchdog, mpsc::Receiver<(Instant, HangContext)>) {
        let (tx, rx) = mpsc::channel();
        let dog = Watchdog::new(move |ctx| {
            let _ = tx.send((Instant::now(), *ctx));
        });
        (dog, rx)
    }

    #[test]
    fn fires_after_deadline_not_before() {
        let (dog, rx) = observed();
        let armed_at = Instant::now();
        dog.arm(Duration::from_millis(80), CTX);

        let (fired_at, ctx) = rx.recv_timeout(Duration::from_secs(2)).expect("must fire");
        let elapsed = fired_at - armed_at;
        assert!(elapsed >= Duration::from_millis(75), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");
        assert_eq!(ctx, CTX);
        assert!(!dog.is_armed());
    }

    #[test]
    fn disarm_suppresses_the_escape() {
        let (dog, rx) = observed();
        dog.arm(Duration::from_millis(60), CTX);
        dog.disarm();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn rearming_replaces_the_pending_deadline() {
        let (dog, rx) = observed();
        dog.arm(Duration::from_millis(40), CTX);
        dog.arm(
            Duration::from_millis(300),
            HangContext {
                iteration: 4,
                ..CTX
            },
        );
        // The first deadline must not fire.
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        let (_, ctx) = rx.recv_timeout(Duration::from_secs(2)).expect("replacement fires");
        assert_eq!(ctx.iteration, 4);
    }

    #[test]
    fn report_attributes_both_neighbors() {
        let hosts = HostTable::new();
        hosts.populate(vec!["h0".into(), "h1".into()]);
        let report = hang_report(0, &hosts, &CTX);
        assert!(report.contains("loop iteration: 3"));
        assert!(report.contains("1 (h1)"));
        assert!(report.contains("3 (UNKNOWN)"));
    }
}
