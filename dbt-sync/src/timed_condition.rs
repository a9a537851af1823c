use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Outcome of a timed wait on a [`GuestCondition`].
///
/// Spurious wakeups are permitted by design — a caller
/// that gets `Signalled` back must still re-check its own predicate, the
/// same way `std::sync::Condvar::wait_timeout` callers must.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signalled,
    TimedOut,
}

struct Inner {
    state: Mutex<u64>,
    condvar: Condvar,
}

/// A guest-synchronisation condition variable: threads park here while
/// waiting on a guest-visible primitive, and are woken either by a
/// `signal`/`signal_all` from another guest thread or by a caller-supplied
/// timeout.
///
/// An `Arc<Inner>` + `Mutex`/`Condvar` shape specialised for a generation
/// counter: this primitive only ever has one waiter parking at a chunk
/// boundary, so no async multiplexing is needed here.
#[derive(Clone)]
pub struct GuestCondition(Arc<Inner>);

impl Default for GuestCondition {
    fn default() -> Self {
        Self(Arc::new(Inner {
            state: Mutex::new(0),
            condvar: Condvar::new(),
        }))
    }
}

impl GuestCondition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes exactly one waiter.
    pub fn signal(&self) {
        let mut generation = self.0.state.lock().unwrap();
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.0.condvar.notify_one();
    }

    /// Wakes every waiter.
    pub fn signal_all(&self) {
        let mut generation = self.0.state.lock().unwrap();
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.0.condvar.notify_all();
    }

    /// Blocks until signalled or `timeout` elapses, whichever comes first.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        let generation = self.0.state.lock().unwrap();
        let observed = *generation;
        let (guard, result) = self
            .0
            .condvar
            .wait_timeout_while(generation, timeout, |g| *g == observed)
            .unwrap();
        drop(guard);
        if result.timed_out() {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Signalled
        }
    }

    /// Blocks with no timeout.
    pub fn wait(&self) {
        let generation = self.0.state.lock().unwrap();
        let observed = *generation;
        let _guard = self
            .0
            .condvar
            .wait_while(generation, |g| *g == observed)
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn times_out_with_no_signal() {
        let cond = GuestCondition::new();
        assert_eq!(
            cond.wait_timeout(Duration::from_millis(20)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn wakes_on_signal() {
        let cond = GuestCondition::new();
        let waiter = cond.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        cond.signal();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Signalled);
    }
}
