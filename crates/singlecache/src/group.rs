//! Time-bounded call coalescing (singleflight with a join window).
//!
//! A [`Group`] keeps, per key, at most one registered in-flight call and the
//! instant until which new arrivals may join it. A caller either joins the
//! registered call and shares its result, or originates a fresh call that
//! replaces the registry entry and runs the operation.
//!
//! Nothing is retained once a call completes: its entry is evicted and the
//! next caller originates again. The join window only limits how long late
//! arrivals may pile onto a running call, so a caller never waits on work a
//! fronting cache would already consider stale.
//!
//! Design:
//! - **One lock**: a single `Mutex<HashMap>` guards the registry. The
//!   join-or-create decision and the registry mutation happen under it
//!   atomically; the operation itself always runs outside it.
//! - **Two delivery paths**: [`Group::do_call`] joiners block on the call's
//!   `Condvar`; [`Group::do_chan`] subscribers get a capacity-1 channel that
//!   is filled once at completion.
//! - **Identity-checked eviction**: a completing call removes the registry
//!   entry only if the entry still points at that same call and the call was
//!   not forgotten. A slow call whose window elapsed and was replaced never
//!   evicts its successor.
//! - **No unwinding recovery**: a panicking operation leaves its joiners
//!   blocked and its entry registered until `forget`.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::call::{Call, CallResult};
use crate::clock::{Clock, Expiry, SystemClock};
use crate::config::GroupConfig;
use crate::error::{GroupError, GroupResult};
use crate::metrics::{CoalesceCounters, CoalesceMetrics};

struct Entry<V, E> {
    call: Arc<Call<V, E>>,
    expiry: Expiry,
}

type Registry<K, V, E> = HashMap<K, Entry<V, E>>;

struct Inner<K, V, E> {
    registry: Mutex<Registry<K, V, E>>,
    clock: Arc<dyn Clock>,
    config: GroupConfig,
    counters: CoalesceCounters,
}

/// A registry of in-flight calls keyed by `K`.
///
/// Cloning a `Group` is cheap and yields a handle to the same registry.
///
/// # Type Parameters
///
/// - `K`: the coalescing key.
/// - `V`, `E`: the operation's value and error. Both are cloned once per
///   joiner, so wrap expensive or non-`Clone` errors in an `Arc`.
pub struct Group<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for Group<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for Group<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.inner.config.name)
            .finish_non_exhaustive()
    }
}

impl<K, V, E> Default for Group<K, V, E>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

enum Role<V, E> {
    Originator(Arc<Call<V, E>>, Origination),
    Joiner(Arc<Call<V, E>>),
}

/// How a new call entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origination {
    Fresh,
    ReplacedExpired,
}

impl<K, V, E> Group<K, V, E>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
    E: Clone,
{
    /// An empty group with default configuration and the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(GroupConfig::default())
    }

    #[must_use]
    pub fn with_config(config: GroupConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// A group whose join windows are measured on `clock`.
    #[must_use]
    pub fn with_clock(config: GroupConfig, clock: Arc<dyn Clock>) -> Self {
        let counters = CoalesceCounters::new(config.metrics_enabled);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(HashMap::new()),
                clock,
                config,
                counters,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.inner.config
    }

    /// Run `op` for `key`, or wait for an in-flight run of it.
    ///
    /// If a call for `key` is registered and its window has not elapsed, this
    /// blocks until that call completes and returns its result with
    /// `shared = true`. Otherwise this thread originates a call that new
    /// arrivals may join for `validity` (zero: until it completes), runs
    /// `op` inline, and returns with `shared` set iff anyone joined.
    pub fn do_call<F>(&self, key: K, validity: Duration, op: F) -> CallResult<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let mut registry = self.inner.lock_registry();
        match self.inner.join_or_create(&mut registry, &key, validity) {
            Role::Joiner(call) => {
                let duplicates = call.add_duplicate();
                drop(registry);
                tracing::trace!(
                    group = %self.inner.config.name,
                    key = ?key,
                    duplicates,
                    decision = "joined",
                    "coalesce: joined in-flight call"
                );
                CallResult {
                    result: call.wait(),
                    shared: true,
                }
            }
            Role::Originator(call, origination) => {
                drop(registry);
                self.inner.log_origination(&key, validity, origination);
                let result = op();
                let shared = self.inner.complete(&key, &call, &result);
                CallResult { result, shared }
            }
        }
    }

    /// Like [`do_call`](Self::do_call), but never blocks: the result arrives
    /// on the returned receiver, exactly once.
    ///
    /// An originating call runs `op` on a fresh worker thread.
    pub fn do_chan<F>(
        &self,
        key: K,
        validity: Duration,
        op: F,
    ) -> GroupResult<Receiver<CallResult<V, E>>>
    where
        F: FnOnce() -> Result<V, E> + Send + 'static,
        K: Send + 'static,
        V: Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut registry = self.inner.lock_registry();
        let now = self.inner.clock.now();

        if let Some(call) = Inner::joinable(&registry, &key, now) {
            let duplicates = call.add_duplicate_sink(tx);
            drop(registry);
            self.inner.counters.record_joined();
            tracing::trace!(
                group = %self.inner.config.name,
                key = ?key,
                duplicates,
                decision = "joined",
                "coalesce: subscribed to in-flight call"
            );
            return Ok(rx);
        }

        let call = Arc::new(Call::with_sink(tx));
        let origination = self
            .inner
            .register(&mut registry, &key, Arc::clone(&call), validity, now);

        // Spawned while the registry is held: if the OS refuses, nobody has
        // had a chance to join the call yet. Every other key's join/create
        // waits out the spawn syscall meanwhile.
        let worker = {
            let inner = Arc::clone(&self.inner);
            let call = Arc::clone(&call);
            let key = key.clone();
            move || {
                let result = op();
                inner.complete(&key, &call, &result);
            }
        };
        match self.inner.worker_builder().spawn(worker) {
            Ok(_detached) => {
                drop(registry);
                self.inner.log_origination(&key, validity, origination);
                Ok(rx)
            }
            Err(source) => {
                if let Some(entry) = registry.get(&key)
                    && Arc::ptr_eq(&entry.call, &call)
                {
                    registry.remove(&key);
                }
                drop(registry);
                tracing::warn!(
                    group = %self.inner.config.name,
                    key = ?key,
                    error = %source,
                    "coalesce: failed to spawn worker, call unregistered"
                );
                Err(GroupError::Spawn {
                    group: self.inner.config.name.clone(),
                    source,
                })
            }
        }
    }

    /// Unregister the call for `key`, if any.
    ///
    /// The call keeps running and its current joiners still receive its
    /// result, but every caller arriving after this returns originates a
    /// fresh call.
    pub fn forget<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + fmt::Debug + ?Sized,
    {
        let mut registry = self.inner.lock_registry();
        let removed = registry.remove(key);
        if let Some(entry) = &removed {
            entry.call.mark_forgotten();
        }
        drop(registry);

        if removed.is_some() {
            self.inner.counters.record_forgotten();
            tracing::debug!(
                group = %self.inner.config.name,
                key = ?key,
                "coalesce: forgot in-flight call"
            );
        }
    }

    /// Whether a call for `key` is registered and still accepting joiners.
    #[must_use]
    pub fn is_joinable<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let registry = self.inner.lock_registry();
        let now = self.inner.clock.now();
        registry
            .get(key)
            .is_some_and(|entry| entry.expiry.is_joinable_at(now))
    }

    /// Number of registered calls, expired or not.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inner.lock_registry().len()
    }

    /// Returns a snapshot of coalescing metrics.
    #[must_use]
    pub fn metrics(&self) -> CoalesceMetrics {
        self.inner.counters.snapshot()
    }

    /// Reset all metrics counters to zero.
    pub fn reset_metrics(&self) {
        self.inner.counters.reset();
    }
}

impl<K, V, E> Inner<K, V, E>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
    E: Clone,
{
    fn lock_registry(&self) -> MutexGuard<'_, Registry<K, V, E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn joinable(registry: &Registry<K, V, E>, key: &K, now: Instant) -> Option<Arc<Call<V, E>>> {
        registry
            .get(key)
            .filter(|entry| entry.expiry.is_joinable_at(now))
            .map(|entry| Arc::clone(&entry.call))
    }

    /// The join-or-create decision. Must run under the registry lock.
    fn join_or_create(
        &self,
        registry: &mut Registry<K, V, E>,
        key: &K,
        validity: Duration,
    ) -> Role<V, E> {
        let now = self.clock.now();
        if let Some(call) = Self::joinable(registry, key, now) {
            self.counters.record_joined();
            return Role::Joiner(call);
        }
        let call = Arc::new(Call::new());
        let origination = self.register(registry, key, Arc::clone(&call), validity, now);
        Role::Originator(call, origination)
    }

    /// Install `call` as the registered call for `key`, replacing any
    /// (necessarily expired) predecessor.
    fn register(
        &self,
        registry: &mut Registry<K, V, E>,
        key: &K,
        call: Arc<Call<V, E>>,
        validity: Duration,
        now: Instant,
    ) -> Origination {
        let expiry = Expiry::from_validity(now, validity);
        self.counters.record_originated();
        if registry.insert(key.clone(), Entry { call, expiry }).is_some() {
            self.counters.record_expired_replacement();
            Origination::ReplacedExpired
        } else {
            Origination::Fresh
        }
    }

    /// Called once the registry lock is released.
    fn log_origination(&self, key: &K, validity: Duration, origination: Origination) {
        match origination {
            Origination::ReplacedExpired => tracing::debug!(
                group = %self.config.name,
                key = ?key,
                ?validity,
                decision = "replaced_expired",
                "coalesce: join window elapsed, originating replacement call"
            ),
            Origination::Fresh => tracing::trace!(
                group = %self.config.name,
                key = ?key,
                ?validity,
                decision = "originated",
                "coalesce: originating call"
            ),
        }
    }

    /// Completion handling for an originated call. Returns the shared flag.
    fn complete(&self, key: &K, call: &Arc<Call<V, E>>, result: &Result<V, E>) -> bool {
        call.complete(result);

        let mut registry = self.lock_registry();
        let outcome = if call.is_forgotten() {
            "kept_forgotten"
        } else if let Some(entry) = registry.get(key)
            && Arc::ptr_eq(&entry.call, call)
        {
            registry.remove(key);
            "evicted"
        } else {
            "kept_replaced"
        };
        let shared = call.deliver(result);
        drop(registry);

        if outcome != "evicted" {
            self.counters.record_stale_completion();
        }
        tracing::trace!(
            group = %self.config.name,
            key = ?key,
            outcome,
            shared,
            ok = result.is_ok(),
            "coalesce: call completed"
        );
        shared
    }

    fn worker_builder(&self) -> thread::Builder {
        let builder = thread::Builder::new().name(format!("{}-call", self.config.name));
        match self.config.worker_stack_bytes {
            Some(bytes) => builder.stack_size(bytes),
            None => builder,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
