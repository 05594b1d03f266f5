//! Two-role hand-off barrier
//!
//! One producer and one consumer pass a unit of work back and forth.
//! A worker owns two of these: `data_ready` (dispatcher signals, worker
//! waits) and `task_done` (worker signals, dispatcher waits).
//!
//! The barrier is reusable: every `signal()` is consumed by exactly one
//! successful wait, and the generation counter advances on each hand-off.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a barrier wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The producer handed work over
    Signaled,
    /// Woken without work (tear-down or retirement)
    Interrupted,
    /// Deadline passed with nothing signaled
    TimedOut,
}

/// `signal()` on a barrier whose consumer has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierClosed;

#[derive(Debug, Default)]
struct State {
    pending: bool,
    interrupted: bool,
    closed: bool,
    generation: u64,
}

/// Reusable producer/consumer hand-off
#[derive(Debug)]
pub struct Barrier {
    name: &'static str,
    state: Mutex<State>,
    cond: Condvar,
}

impl Barrier {
    /// Create an open barrier with nothing pending
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    /// Barrier label, for logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Producer: hand work to the consumer.
    ///
    /// Everything written before this call is visible to the consumer once
    /// its wait returns `Signaled`.
    pub fn signal(&self) -> Result<(), BarrierClosed> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BarrierClosed);
        }
        debug_assert!(!state.pending, "{}: signaled twice without a wait", self.name);
        state.pending = true;
        state.generation += 1;
        self.cond.notify_one();
        Ok(())
    }

    /// Consumer: block until signaled or interrupted
    pub fn wait(&self) -> WaitResult {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = Self::take(&mut state) {
                return result;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Consumer: block for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(result) = Self::take(&mut state) {
                return result;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Self::take(&mut state).unwrap_or(WaitResult::TimedOut);
            }
        }
    }

    /// Consumer: consume a pending signal without blocking
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::take(&mut state.pending)
    }

    /// Wake the consumer without handing over work
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_one();
    }

    /// Consumer: refuse all future signals.
    ///
    /// Returns `false` and leaves the barrier open if a signal is already
    /// pending; the consumer must handle that work before closing again.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending {
            return false;
        }
        state.closed = true;
        true
    }

    /// Whether `close()` has succeeded
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of completed `signal()` calls
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn take(state: &mut State) -> Option<WaitResult> {
        if state.pending {
            state.pending = false;
            return Some(WaitResult::Signaled);
        }
        if state.interrupted {
            state.interrupted = false;
            return Some(WaitResult::Interrupted);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_then_wait() {
        let b = Barrier::new("test");
        b.signal().unwrap();
        assert_eq!(b.wait(), WaitResult::Signaled);
        assert_eq!(b.generation(), 1);
        assert!(!b.try_wait());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let b = Barrier::new("test");
        let start = Instant::now();
        assert_eq!(b.wait_timeout(Duration::from_millis(20)), WaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_interrupt_wakes_waiter() {
        let b = Arc::new(Barrier::new("test"));
        let waiter = {
            let b = b.clone();
            thread::spawn(move || b.wait())
        };
        thread::sleep(Duration::from_millis(10));
        b.interrupt();
        assert_eq!(waiter.join().unwrap(), WaitResult::Interrupted);
    }

    #[test]
    fn test_close_refuses_signal() {
        let b = Barrier::new("test");
        assert!(b.close());
        assert!(b.is_closed());
        assert_eq!(b.signal(), Err(BarrierClosed));
    }

    #[test]
    fn test_close_with_pending_work_stays_open() {
        let b = Barrier::new("test");
        b.signal().unwrap();
        assert!(!b.close());
        assert_eq!(b.wait(), WaitResult::Signaled);
        assert!(b.close());
    }

    #[test]
    fn test_ping_pong() {
        let ready = Arc::new(Barrier::new("data_ready"));
        let done = Arc::new(Barrier::new("task_done"));
        let consumer = {
            let (ready, done) = (ready.clone(), done.clone());
            thread::spawn(move || {
                for _ in 0..100 {
                    assert_eq!(ready.wait(), WaitResult::Signaled);
                    done.signal().unwrap();
                }
            })
        };
        for _ in 0..100 {
            ready.signal().unwrap();
            assert_eq!(done.wait_timeout(Duration::from_secs(5)), WaitResult::Signaled);
        }
        consumer.join().unwrap();
        assert_eq!(ready.generation(), 100);
        assert_eq!(done.generation(), 100);
    }
}
