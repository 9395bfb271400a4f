use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use parking_lot::Mutex;

use crate::{
    cache::ResultCache,
    data::{KeySet, Token as KeyToken, ValueSet},
    wakerset::{Token as WakerToken, WakerSet},
};

struct AccumulatingState<Key: Eq + Hash, Delay> {
    keys: KeySet<Key>,
    delay: Option<Delay>,
    wakers: WakerSet,
}

impl<Key, Delay> Debug for AccumulatingState<Key, Delay>
where
    Key: Debug + Hash + Eq,
    Delay: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatingState")
            .field("keys", &self.keys)
            .field("delay", &self.delay)
            .field("wakers", &self.wakers)
            .finish()
    }
}

#[derive(Debug)]
struct RunningState<Key, Fut> {
    fut: Fut,
    wakers: WakerSet,

    // The keys that were actually handed to the batch function. Late callers
    // may only join a running batch for one of these.
    requested: HashMap<KeyToken, Key>,

    // Futures that joined after dispatch, and futures that lost interest
    // after dispatch. Both are applied to the ValueSet once it exists.
    late_tokens: Vec<KeyToken>,
    dropped_tokens: Vec<KeyToken>,
}

enum State<Key: Hash + Eq, Value, Error, Fut, Delay> {
    Accum(AccumulatingState<Key, Delay>),
    Running(RunningState<Key, Fut>),
    Done(Result<ValueSet<Value>, Error>),
}

type SharedState<Key, Value, Error, Fut, Delay> = Arc<Mutex<State<Key, Value, Error, Fut, Delay>>>;
type WeakState<Key, Value, Error, Fut, Delay> = Weak<Mutex<State<Key, Value, Error, Fut, Delay>>>;

/// Configuration for a [`BatchController`].
///
/// - `batcher` is the async function that performs a multi-key lookup.
/// - `window` creates the future that defines how long keys are collected
///   before the batch is dispatched. [`next_turn`] gives the "everything
///   requested before the executor gets control back" window; a timer such as
///   `futures_timer::Delay` gives a fixed-duration one.
/// - `max_keys`, if set, dispatches the batch as soon as it holds that many
///   distinct keys, regardless of the window.
/// - `cache` enables the process-lifetime result cache: found values are
///   remembered and later loads for the same key never touch the batcher.
#[derive(Debug, Clone, Default)]
pub struct BatchRules<Batcher, Delayer> {
    pub batcher: Batcher,
    pub window: Delayer,
    pub max_keys: Option<NonZeroUsize>,
    pub cache: bool,
}

// Everything the controller and its futures share. Lock order is always
// `index` before any batch state.
struct Core<Key: Hash + Eq, Value, Error, Fut, Batcher, Delay, Delayer> {
    rules: BatchRules<Batcher, Delayer>,
    cache: Option<ResultCache<Key, Value>>,
    index: Mutex<Index<Key, Value, Error, Fut, Delay>>,
}

struct Index<Key: Hash + Eq, Value, Error, Fut, Delay> {
    // The batch currently accepting new keys, if any
    accumulating: WeakState<Key, Value, Error, Fut, Delay>,

    // Every key that belongs to a batch which hasn't delivered yet
    inflight: HashMap<Key, (KeyToken, WeakState<Key, Value, Error, Fut, Delay>)>,
}

impl<Key: Hash + Eq, Value, Error, Fut, Delay> Index<Key, Value, Error, Fut, Delay> {
    fn forget(&mut self, state: &SharedState<Key, Value, Error, Fut, Delay>, keys: impl Iterator<Item = Key>) {
        let state = Arc::downgrade(state);
        for key in keys {
            if let Some((_token, owner)) = self.inflight.get(&key) {
                if owner.ptr_eq(&state) {
                    self.inflight.remove(&key);
                }
            }
        }
    }
}

/// A `BatchController` coalesces single-key loads into batched calls of the
/// batch function. It's the entry point for creating [`BatchFuture`]s, and
/// it can be shared by reference between any number of tasks or threads.
///
/// Each call to [`load`](Self::load) adds the key to the currently
/// accumulating batch, until:
///
/// - the batch's window future completes (this is usually very short)
/// - the batch reaches its maximum number of keys
///
/// At this point the batch is "launched"; it is detached from the controller
/// and the futures associated with it drive it to completion. While a batch
/// is in flight, further loads for one of its keys join it instead of
/// starting another request for that key.
pub struct BatchController<Key: Hash + Eq, Value, Error, Fut, Batcher, Delay, Delayer> {
    // TODO: find a good way to rewrite this type so that this lint passes
    #[allow(clippy::type_complexity)]
    core: Arc<Core<Key, Value, Error, Fut, Batcher, Delay, Delayer>>,
}

impl<Key, Value, Error, Fut, Batcher, Delay, Delayer> Debug
    for BatchController<Key, Value, Error, Fut, Batcher, Delay, Delayer>
where
    Key: Hash + Eq,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchController")
            .field("max_keys", &self.core.rules.max_keys)
            .field("cache", &self.core.cache)
            .field("inflight", &self.core.index.lock().inflight.len())
            .finish()
    }
}

impl<Key, Value, Error, Fut, Batcher, Delay, Delayer>
    BatchController<Key, Value, Error, Fut, Batcher, Delay, Delayer>
where
    Key: Eq + Hash + Clone,
    Value: Clone,
    Error: Clone,
    Delayer: Fn() -> Delay,
    Delay: Future<Output = ()>,
    Batcher: Fn(KeySet<Key>) -> Fut,
    Fut: Future<Output = Result<ValueSet<Value>, Error>>,
{
    pub fn new(rules: BatchRules<Batcher, Delayer>) -> Self {
        let cache = if rules.cache {
            Some(ResultCache::new())
        } else {
            None
        };

        Self {
            core: Arc::new(Core {
                rules,
                cache,
                index: Mutex::new(Index {
                    accumulating: Weak::new(),
                    inflight: HashMap::new(),
                }),
            }),
        }
    }

    pub fn rules(&self) -> &BatchRules<Batcher, Delayer> {
        &self.core.rules
    }

    /// Request the value for a single key. The returned future resolves to
    /// `Ok(Some(value))` if the batch function produced a value for the key,
    /// `Ok(None)` if it didn't know the key, or `Err` with a clone of the
    /// batch function's error if the whole batch failed.
    pub fn load(&self, key: Key) -> BatchFuture<Key, Value, Error, Fut, Batcher, Delay, Delayer> {
        if let Some(value) = self.cached(&key) {
            tracing::trace!("batch load served from cache");
            return BatchFuture {
                core: Arc::clone(&self.core),
                inner: Inner::Cached(Some(value)),
            };
        }

        let mut index = self.core.index.lock();

        // If the key is already part of a batch that hasn't delivered yet,
        // ride along with it.
        let existing = index
            .inflight
            .get(&key)
            .map(|(token, state)| (token.duplicate(), state.upgrade()));

        if let Some((key_token, state_handle)) = existing {
            if let Some(state_handle) = state_handle {
                if self.join_existing(&mut index, &key, &key_token, &state_handle) {
                    return self.waiting(key_token, state_handle);
                }
            }
            index.inflight.remove(&key);
        }

        // If there is an accumulating batch, add the key to it. Note that at
        // no point do we check the timing; we assume that if its window has
        // closed, a future poll will advance the state to Running.
        if let Some(state_handle) = index.accumulating.upgrade() {
            let mut state_guard = state_handle.lock();

            if let State::Accum(ref mut state) = *state_guard {
                let key_token = state.keys.add_key(key.clone());
                index.inflight.insert(
                    key,
                    (key_token.duplicate(), Arc::downgrade(&state_handle)),
                );

                // If we've hit the key limit:
                // - Clear the timer
                // - Wake the driver so that it dispatches the batch
                // - Detach the batch from the controller
                match self.core.rules.max_keys {
                    Some(max_keys) if state.keys.len() >= max_keys.get() => {
                        state.delay = None;
                        state.wakers.wake_driver();
                        index.accumulating = Weak::new();
                    }
                    _ => {}
                }

                drop(state_guard);
                return self.waiting(key_token, Arc::clone(&state_handle));
            }
        }

        let mut keys = KeySet::new();
        let key_token = keys.add_key(key.clone());

        let single = matches!(self.core.rules.max_keys, Some(max_keys) if max_keys.get() <= 1);

        let state_handle = Arc::new(Mutex::new(State::Accum(AccumulatingState {
            keys,
            delay: if single {
                None
            } else {
                Some((self.core.rules.window)())
            },
            wakers: WakerSet::default(),
        })));

        if !single {
            index.accumulating = Arc::downgrade(&state_handle);
        }

        index.inflight.insert(
            key,
            (key_token.duplicate(), Arc::downgrade(&state_handle)),
        );

        tracing::trace!("opened new batch");
        self.waiting(key_token, state_handle)
    }

    // Try to attach another waiter for `key` to a batch found in the
    // in-flight index. Returns false if that batch can't take it, in which
    // case the index entry is stale.
    fn join_existing(
        &self,
        index: &mut Index<Key, Value, Error, Fut, Delay>,
        key: &Key,
        key_token: &KeyToken,
        state_handle: &SharedState<Key, Value, Error, Fut, Delay>,
    ) -> bool {
        let is_current = index.accumulating.ptr_eq(&Arc::downgrade(state_handle));
        let mut guard = state_handle.lock();

        match *guard {
            State::Accum(ref mut state) => {
                // A batch that's already full and detached only takes keys it
                // is going to send anyway.
                if !is_current && !state.keys.has_waiters(key_token) {
                    return false;
                }

                let token = state.keys.add_key(key.clone());
                debug_assert_eq!(&token, key_token);

                if let Some(max_keys) = self.core.rules.max_keys {
                    if is_current && state.keys.len() >= max_keys.get() {
                        state.delay = None;
                        state.wakers.wake_driver();
                        index.accumulating = Weak::new();
                    }
                }
                true
            }
            State::Running(ref mut state) => {
                if !state.requested.contains_key(key_token) {
                    return false;
                }
                tracing::trace!("joining running batch");
                state.late_tokens.push(key_token.duplicate());
                true
            }
            State::Done(Ok(ref mut values)) => values.add_waiter(key_token),
            State::Done(Err(..)) => false,
        }
    }

    fn waiting(
        &self,
        key_token: KeyToken,
        state: SharedState<Key, Value, Error, Fut, Delay>,
    ) -> BatchFuture<Key, Value, Error, Fut, Batcher, Delay, Delayer> {
        BatchFuture {
            core: Arc::clone(&self.core),
            inner: Inner::Waiting {
                key_token,
                waker_token: None,
                state,
            },
        }
    }

    /// Look a key up in the result cache. Always `None` when caching is
    /// disabled.
    pub fn cached<Q>(&self, key: &Q) -> Option<Value>
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.core.cache.as_ref()?.get(key)
    }

    /// Drop a single key from the result cache, so that the next load for it
    /// goes to the batch function again.
    pub fn invalidate<Q>(&self, key: &Q) -> bool
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.core
            .cache
            .as_ref()
            .map_or(false, |cache| cache.invalidate(key))
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.core.cache {
            cache.clear();
        }
    }

    /// Number of keys currently waiting on a batch that hasn't delivered.
    pub fn in_flight(&self) -> usize {
        self.core
            .index
            .lock()
            .inflight
            .values()
            .filter(|(_token, state)| state.strong_count() > 0)
            .count()
    }
}

enum Inner<Key: Hash + Eq, Value, Error, Fut, Delay> {
    Cached(Option<Value>),
    Waiting {
        key_token: KeyToken,
        waker_token: Option<WakerToken>,
        state: SharedState<Key, Value, Error, Fut, Delay>,
    },
    Finished,
}

/// A request for a single key-value lookup, which shares its batch with
/// several other futures so that the request can be made as
/// `[Keys] -> [Values]`. It is created by [`BatchController::load`], and when
/// awaited, it waits along with the rest of its batch until the window has
/// passed, then runs the batch function and resolves with the value for its
/// specific key.
pub struct BatchFuture<Key: Hash + Eq, Value, Error, Fut, Batcher, Delay, Delayer> {
    #[allow(clippy::type_complexity)]
    core: Arc<Core<Key, Value, Error, Fut, Batcher, Delay, Delayer>>,
    inner: Inner<Key, Value, Error, Fut, Delay>,
}

// The batch state lives behind an Arc and is never moved out of it, and a
// cached value is never pinned.
impl<Key: Hash + Eq, Value, Error, Fut, Batcher, Delay, Delayer> Unpin
    for BatchFuture<Key, Value, Error, Fut, Batcher, Delay, Delayer>
{
}

impl<Key, Value, Error, Fut, Batcher, Delay, Delayer> Future
    for BatchFuture<Key, Value, Error, Fut, Batcher, Delay, Delayer>
where
    Key: Eq + Hash + Clone,
    Value: Clone,
    Error: Clone,
    Delay: Future<Output = ()>,
    Batcher: Fn(KeySet<Key>) -> Fut,
    Fut: Future<Output = Result<ValueSet<Value>, Error>>,
{
    type Output = Result<Option<Value>, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        if let Inner::Cached(value) = &mut unpinned.inner {
            let value = value.take();
            unpinned.inner = Inner::Finished;
            return Poll::Ready(Ok(value));
        }

        let core = &unpinned.core;
        let (key_token, waker_token, state) = match &mut unpinned.inner {
            Inner::Waiting {
                key_token,
                waker_token,
                state,
            } => (key_token, waker_token, state),
            _ => panic!("Can't re-poll a completed BatchFuture"),
        };

        // Note about this mutex: the lock is released when poll returns; it
        // isn't held between async polls.
        let mut guard = state.lock();

        if let State::Accum(ref mut accum) = *guard {
            if let Some(ref mut delay) = accum.delay {
                // Only the driver polls the window. A passenger that polled it
                // would close a `next_turn` window within the same turn.
                if !accum.wakers.is_driving(waker_token) {
                    accum.wakers.register_passenger(waker_token, ctx.waker());
                    return Poll::Pending;
                }

                // Safety: the delay is inside an arc and we don't pull it out.
                // It is destructed in-place below when the state transitions.
                let pinned_delay = unsafe { Pin::new_unchecked(delay) };
                if pinned_delay.poll(ctx).is_pending() {
                    // This waker is now the driving waker for the window.
                    accum.wakers.register(waker_token, ctx.waker());
                    return Poll::Pending;
                }
            }

            // Window is closed. Transition to the Running state.
            let wakers = mem::take(&mut accum.wakers);
            let keyset = accum.keys.take();
            let requested = keyset
                .entries()
                .map(|(key, token)| (token.duplicate(), key.clone()))
                .collect();

            tracing::trace!(keys = keyset.len(), "dispatching batch");

            // Safety note: the batcher's future has not been pinned yet and
            // is free to move into the state.
            let fut = (core.rules.batcher)(keyset);

            // This is where the delay is destructed in place, upholding the
            // pin contract.
            *guard = State::Running(RunningState {
                fut,
                wakers,
                requested,
                late_tokens: Vec::new(),
                dropped_tokens: Vec::new(),
            });
        }

        let mut delivered = None;

        if let State::Running(ref mut running) = *guard {
            // Safety: we don't ever move this reference, which is behind an
            // arc.
            let fut = unsafe { Pin::new_unchecked(&mut running.fut) };

            let mut result = match fut.poll(ctx) {
                Poll::Pending => {
                    running.wakers.register(waker_token, ctx.waker());
                    return Poll::Pending;
                }
                Poll::Ready(result) => result,
            };

            let requested = mem::take(&mut running.requested);

            match result {
                Ok(ref mut values) => {
                    // Late joiners first, so that a late joiner that was
                    // also dropped cancels out cleanly.
                    for token in &running.late_tokens {
                        values.add_waiter(token);
                    }
                    running
                        .dropped_tokens
                        .iter()
                        .for_each(|token| values.discard(token));

                    if let Some(cache) = &core.cache {
                        for (token, key) in &requested {
                            if let Some(value) = values.peek(token) {
                                cache.insert(key.clone(), value.clone());
                            }
                        }
                    }
                }
                Err(..) => {
                    tracing::debug!(keys = requested.len(), "batch function failed");
                }
            }

            // Signal every other waiting future so they can collect their
            // results. We're about to collect our own.
            mem::take(&mut running.wakers).wake_all_except(waker_token.take());

            // This is where the batch future is destructed in place.
            *guard = State::Done(result);
            delivered = Some(requested);
        }

        let outcome = match *guard {
            State::Done(Ok(ref mut values)) => match values.take(key_token) {
                Some(value) => Ok(value),
                None => panic!("Unknown logic error: no value in ValueSet associated with Token"),
            },
            State::Done(Err(ref err)) => Err(err.clone()),
            _ => unreachable!("BatchFuture contained invalid state"),
        };
        drop(guard);

        // Nobody should join this batch from now on; the cache (if any) or a
        // fresh batch takes over.
        if let Some(requested) = delivered {
            core.index.lock().forget(state, requested.into_values());
        }

        unpinned.inner = Inner::Finished;
        Poll::Ready(outcome)
    }
}

impl<Key: Hash + Eq, Value, Error, Fut, Batcher, Delay, Delayer> Drop
    for BatchFuture<Key, Value, Error, Fut, Batcher, Delay, Delayer>
{
    fn drop(&mut self) {
        // The shared batch is only ever driven by a single task, so if this
        // was the driver, another task has to be woken to take over. The
        // WakerSet takes care of choosing one.
        if let Inner::Waiting {
            key_token,
            waker_token,
            state,
        } = &mut self.inner
        {
            let mut guard = state.lock();
            match *guard {
                State::Accum(ref mut state) => {
                    if let Some(waker_token) = waker_token.take() {
                        state.wakers.discard_and_wake(waker_token);
                    }

                    state.keys.discard_token(key_token);
                }
                State::Running(ref mut state) => {
                    if let Some(waker_token) = waker_token.take() {
                        state.wakers.discard_and_wake(waker_token);
                    }

                    // The KeySet is frozen (owned by the executing future), so
                    // remember the token and discard it from the ValueSet
                    // when that's ready.
                    state.dropped_tokens.push(key_token.duplicate());
                }
                State::Done(Ok(ref mut values)) => values.discard(key_token),
                State::Done(Err(..)) => {}
            }
        }
    }
}

/// A window that closes as soon as the executor has had one chance to run
/// other tasks. Every `load` issued before control returns to the executor
/// lands in the same batch.
pub fn next_turn() -> NextTurn {
    NextTurn { yielded: false }
}

/// Future returned by [`next_turn`].
#[derive(Debug, Clone)]
pub struct NextTurn {
    yielded: bool,
}

impl Future for NextTurn {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            ctx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
