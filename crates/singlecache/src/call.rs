//! One execution of an operation for one key, and its result fan-out.
//!
//! The originator writes the result exactly once through
//! [`Call::complete`], which wakes every blocked [`Call::wait`]er. Channel
//! subscribers are drained separately by [`Call::deliver`].
//!
//! Lock order: the owning group's registry lock is always taken before a
//! call's `ledger` lock. `state` is never held together with either.

use std::sync::mpsc::SyncSender;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// What every caller of a coalesced call receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult<V, E> {
    /// The operation's value or error, verbatim.
    pub result: Result<V, E>,
    /// `true` if at least one caller joined the call instead of originating it.
    pub shared: bool,
}

impl<V, E> CallResult<V, E> {
    /// Drop the shared flag.
    pub fn into_result(self) -> Result<V, E> {
        self.result
    }

    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared
    }

    /// The value, if the operation succeeded.
    pub fn value(&self) -> Option<&V> {
        self.result.as_ref().ok()
    }

    /// The error, if the operation failed.
    pub fn error(&self) -> Option<&E> {
        self.result.as_ref().err()
    }
}

enum CallState<V, E> {
    /// The operation is still running.
    Pending,
    /// Written once by the executing thread.
    Done(Result<V, E>),
}

/// Fields only touched while the group's registry lock is held.
struct Ledger<V, E> {
    duplicates: usize,
    forgotten: bool,
    sinks: Vec<SyncSender<CallResult<V, E>>>,
}

pub(crate) struct Call<V, E> {
    state: Mutex<CallState<V, E>>,
    done: Condvar,
    ledger: Mutex<Ledger<V, E>>,
}

impl<V: Clone, E: Clone> Call<V, E> {
    pub(crate) const fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    /// A call created by a channel subscriber, which is its first sink.
    pub(crate) fn with_sink(sink: SyncSender<CallResult<V, E>>) -> Self {
        Self::with_sinks(vec![sink])
    }

    const fn with_sinks(sinks: Vec<SyncSender<CallResult<V, E>>>) -> Self {
        Self {
            state: Mutex::new(CallState::Pending),
            done: Condvar::new(),
            ledger: Mutex::new(Ledger {
                duplicates: 0,
                forgotten: false,
                sinks,
            }),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger<V, E>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- registry-lock-held operations ---------------------------------------

    /// Record a joiner. Returns the new duplicate count.
    pub(crate) fn add_duplicate(&self) -> usize {
        let mut ledger = self.ledger();
        ledger.duplicates += 1;
        ledger.duplicates
    }

    /// Record a joiner that wants the result on a channel.
    pub(crate) fn add_duplicate_sink(&self, sink: SyncSender<CallResult<V, E>>) -> usize {
        let mut ledger = self.ledger();
        ledger.duplicates += 1;
        ledger.sinks.push(sink);
        ledger.duplicates
    }

    pub(crate) fn mark_forgotten(&self) {
        self.ledger().forgotten = true;
    }

    pub(crate) fn is_forgotten(&self) -> bool {
        self.ledger().forgotten
    }

    #[cfg(test)]
    pub(crate) fn duplicates(&self) -> usize {
        self.ledger().duplicates
    }

    /// Send the result to every registered sink, in registration order, and
    /// clear the sink list. Returns the shared flag that was delivered.
    ///
    /// A sink whose receiver was dropped is skipped.
    pub(crate) fn deliver(&self, result: &Result<V, E>) -> bool {
        let mut ledger = self.ledger();
        let shared = ledger.duplicates > 0;
        for sink in ledger.sinks.drain(..) {
            // Capacity-1 channel with a single send: never full.
            let _ = sink.try_send(CallResult {
                result: result.clone(),
                shared,
            });
        }
        shared
    }

    // -- completion signal ----------------------------------------------------

    /// Publish the result and wake all blocked waiters.
    pub(crate) fn complete(&self, result: &Result<V, E>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = CallState::Done(result.clone());
        drop(state);
        self.done.notify_all();
    }

    /// Block until [`complete`](Self::complete) has run, then clone the result.
    pub(crate) fn wait(&self) -> Result<V, E> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = self
            .done
            .wait_while(guard, |s| matches!(s, CallState::Pending))
            .unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            CallState::Done(result) => result.clone(),
            CallState::Pending => unreachable!("wait_while returned with a pending call"),
        }
    }

    /// Non-blocking peek at the published result.
    #[cfg(test)]
    pub(crate) fn try_result(&self) -> Option<Result<V, E>> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            CallState::Done(result) => Some(result.clone()),
            CallState::Pending => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn waiters_see_published_value() {
        let call = Arc::new(Call::<i32, String>::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let call = Arc::clone(&call);
                thread::spawn(move || call.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        assert!(call.try_result().is_none());
        call.complete(&Ok(42));

        for w in waiters {
            assert_eq!(w.join().unwrap(), Ok(42));
        }
        assert_eq!(call.try_result(), Some(Ok(42)));
    }

    #[test]
    fn wait_after_completion_returns_immediately() {
        let call = Call::<i32, String>::new();
        call.complete(&Err("boom".into()));
        assert_eq!(call.wait(), Err("boom".to_string()));
    }

    #[test]
    fn deliver_fans_out_in_registration_order() {
        let (tx0, rx0) = mpsc::sync_channel(1);
        let call = Call::<&str, String>::with_sink(tx0);
        assert_eq!(call.duplicates(), 0);

        let (tx1, rx1) = mpsc::sync_channel(1);
        let (tx2, rx2) = mpsc::sync_channel(1);
        assert_eq!(call.add_duplicate_sink(tx1), 1);
        assert_eq!(call.add_duplicate_sink(tx2), 2);

        let shared = call.deliver(&Ok("bar"));
        assert!(shared);
        for rx in [rx0, rx1, rx2] {
            let got = rx.recv().unwrap();
            assert_eq!(got.result, Ok("bar"));
            assert!(got.shared);
        }
    }

    #[test]
    fn deliver_drains_sinks_exactly_once() {
        let (tx, rx) = mpsc::sync_channel(1);
        let call = Call::<i32, String>::with_sink(tx);

        assert!(!call.deliver(&Ok(1)));
        assert!(!call.deliver(&Ok(2)));

        assert_eq!(rx.recv().unwrap().result, Ok(1));
        // Sender was dropped by the first drain.
        assert!(rx.recv().is_err());
    }

    #[test]
    fn deliver_skips_dropped_receivers() {
        let (tx0, rx0) = mpsc::sync_channel(1);
        let (tx1, rx1) = mpsc::sync_channel(1);
        let call = Call::<i32, String>::with_sink(tx0);
        call.add_duplicate_sink(tx1);
        drop(rx0);

        assert!(call.deliver(&Ok(5)));
        assert_eq!(rx1.recv().unwrap().result, Ok(5));
    }

    #[test]
    fn plain_duplicates_count_toward_shared() {
        let call = Call::<i32, String>::new();
        assert!(!call.deliver(&Ok(0)));
        call.add_duplicate();
        assert!(call.deliver(&Ok(0)));
    }

    #[test]
    fn forgotten_flag_is_sticky() {
        let call = Call::<i32, String>::new();
        assert!(!call.is_forgotten());
        call.mark_forgotten();
        call.mark_forgotten();
        assert!(call.is_forgotten());
    }

    #[test]
    fn call_result_accessors() {
        let ok: CallResult<i32, String> = CallResult {
            result: Ok(7),
            shared: true,
        };
        assert!(ok.is_shared());
        assert_eq!(ok.value(), Some(&7));
        assert_eq!(ok.error(), None);
        assert_eq!(ok.into_result(), Ok(7));

        let err: CallResult<i32, String> = CallResult {
            result: Err("e".into()),
            shared: false,
        };
        assert_eq!(err.value(), None);
        assert_eq!(err.error().map(String::as_str), Some("e"));
    }
}
