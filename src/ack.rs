//! Read-acknowledgement tracking.
//!
//! [`AckTracker`] keeps the "last read message" pointer for each
//! conversation. Updates land in the shared [`StateStore`] immediately, so
//! the UI reflects them right away, while the backend hears about them
//! through a per-conversation debounced sync: once on the leading edge of a
//! burst, and once more with the latest id when the burst settles.
//!
//! Updates that don't move the pointer forward are dropped. Syncs for one
//! conversation are serialized: while one is in flight, newer ids wait for
//! it to finish, so the backend never receives an older id after a newer
//! one. Failed syncs are logged and otherwise ignored; the local pointer
//! stays authoritative.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use futures_timer::Delay;
use serde_json::json;

use crate::clock::{Clock, SystemClock};
use crate::config::ClientSettings;
use crate::debounce::{DebounceOptions, Debouncer};
use crate::error::TransportError;
use crate::store::{ChatAction, StateStore};
use crate::transport::Transport;

const UPDATE_ACK_PATH: &str = "/api/chat/ack/update";

/// Where acknowledgement pointers are persisted.
pub trait AckSink {
    fn persist_ack(
        &self,
        converse_id: &str,
        last_message_id: &str,
    ) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Persists acknowledgements through the backend's ack endpoint.
#[derive(Debug, Clone)]
pub struct RemoteAckSink<T> {
    transport: T,
}

impl<T: Transport> RemoteAckSink<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: Transport> AckSink for RemoteAckSink<T> {
    fn persist_ack(
        &self,
        converse_id: &str,
        last_message_id: &str,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        self.transport
            .post(
                UPDATE_ACK_PATH,
                json!({
                    "converseId": converse_id,
                    "lastMessageId": last_message_id,
                }),
            )
            .map(|result| result.map(drop))
            .boxed()
    }
}

type PersistFuture = BoxFuture<'static, (String, String, Result<(), TransportError>)>;

#[derive(Debug, Default)]
struct SyncSlot {
    in_flight: bool,
    queued: Option<String>,
}

pub struct AckTracker<Store, Sink, C = SystemClock> {
    store: Store,
    sink: Sink,
    clock: C,
    debouncer: Debouncer<String, String>,
    syncs: HashMap<String, SyncSlot>,
    persisting: FuturesUnordered<PersistFuture>,
}

impl<Store, Sink, C> Debug for AckTracker<Store, Sink, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckTracker")
            .field("debouncer", &self.debouncer)
            .field("syncs", &self.syncs)
            .field("persisting", &self.persisting.len())
            .finish()
    }
}

impl<Store: StateStore, Sink: AckSink> AckTracker<Store, Sink, SystemClock> {
    pub fn new(store: Store, sink: Sink, settings: &ClientSettings) -> Self {
        Self::with_clock(store, sink, SystemClock, settings.ack_debounce)
    }
}

impl<Store: StateStore, Sink: AckSink, C: Clock> AckTracker<Store, Sink, C> {
    pub fn with_clock(store: Store, sink: Sink, clock: C, debounce: Duration) -> Self {
        Self {
            store,
            sink,
            clock,
            debouncer: Debouncer::new(debounce, DebounceOptions::default()),
            syncs: HashMap::new(),
            persisting: FuturesUnordered::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// A handle bound to one conversation, mirroring what a conversation view
    /// needs.
    pub fn converse<'a>(&'a mut self, converse_id: &'a str) -> ConverseAck<'a, Store, Sink, C> {
        ConverseAck {
            tracker: self,
            converse_id,
        }
    }

    /// The acknowledged message id for a conversation, if any.
    pub fn converse_ack(&self, converse_id: &str) -> Option<String> {
        self.store
            .read(|state| state.converse_ack(converse_id).map(str::to_owned))
    }

    /// Move the read pointer of `converse_id` to `last_message_id`. Returns
    /// false, without doing anything, if that wouldn't move it forward.
    pub fn update_converse_ack(&mut self, converse_id: &str, last_message_id: &str) -> bool {
        if last_message_id.is_empty() {
            return false;
        }

        let current = self.converse_ack(converse_id).unwrap_or_default();
        if !current.is_empty() && last_message_id <= current.as_str() {
            tracing::debug!(
                converse_id,
                last_message_id,
                current = current.as_str(),
                "ignoring stale ack update"
            );
            return false;
        }

        self.store.dispatch(ChatAction::SetConverseAck {
            converse_id: converse_id.to_owned(),
            last_message_id: last_message_id.to_owned(),
        });

        let now = self.clock.now();
        if let Some(leading) =
            self.debouncer
                .call(converse_id.to_owned(), last_message_id.to_owned(), now)
        {
            self.send(converse_id.to_owned(), leading);
        }

        true
    }

    /// Acknowledge everything up to the latest known message. No-op if
    /// nothing is known about the conversation or it's already caught up.
    pub fn mark_converse_all_ack(&mut self, converse_id: &str) -> bool {
        let last_message = self
            .store
            .read(|state| state.converse_last_message(converse_id).map(str::to_owned));

        match last_message {
            Some(last_message_id) => self.update_converse_ack(converse_id, &last_message_id),
            None => false,
        }
    }

    /// Whether a trailing sync is still pending for `converse_id`.
    pub fn is_debouncing(&self, converse_id: &str) -> bool {
        self.debouncer.is_pending(converse_id)
    }

    /// When the next debounce window closes, if any are open.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debouncer.next_deadline()
    }

    /// Send every trailing sync whose window has closed. Returns how many
    /// were started (or queued behind one already in flight).
    pub fn flush_due(&mut self) -> usize {
        let fired = self.debouncer.advance(self.clock.now());
        let count = fired.len();

        for (converse_id, last_message_id) in fired {
            tracing::debug!(
                converse_id = converse_id.as_str(),
                last_message_id = last_message_id.as_str(),
                "trailing ack sync"
            );
            self.send(converse_id, last_message_id);
        }

        count
    }

    /// Close the debounce window of one conversation right away, sending its
    /// held id if there is one. Useful when the conversation view goes away.
    pub fn flush_converse(&mut self, converse_id: &str) -> bool {
        match self.debouncer.flush(converse_id) {
            Some(last_message_id) => {
                self.send(converse_id.to_owned(), last_message_id);
                true
            }
            None => false,
        }
    }

    fn send(&mut self, converse_id: String, last_message_id: String) {
        let slot = self.syncs.entry(converse_id.clone()).or_default();

        if slot.in_flight {
            match slot.queued {
                Some(ref queued) if *queued >= last_message_id => {}
                _ => slot.queued = Some(last_message_id),
            }
            return;
        }

        slot.in_flight = true;
        let persist = self.sink.persist_ack(&converse_id, &last_message_id);
        self.persisting.push(
            async move {
                let result = persist.await;
                (converse_id, last_message_id, result)
            }
            .boxed(),
        );
    }

    /// Drive in-flight syncs. Ready once nothing is in flight.
    pub fn poll_persistence(&mut self, ctx: &mut Context<'_>) -> Poll<()> {
        loop {
            let (converse_id, last_message_id, result) =
                match self.persisting.poll_next_unpin(ctx) {
                    Poll::Ready(Some(done)) => done,
                    Poll::Ready(None) => return Poll::Ready(()),
                    Poll::Pending => return Poll::Pending,
                };

            match result {
                Ok(()) => tracing::trace!(
                    converse_id = converse_id.as_str(),
                    last_message_id = last_message_id.as_str(),
                    "ack persisted"
                ),
                Err(err) => tracing::warn!(
                    converse_id = converse_id.as_str(),
                    last_message_id = last_message_id.as_str(),
                    error = %err,
                    "failed to persist ack"
                ),
            }

            let queued = self.syncs.get_mut(&converse_id).and_then(|slot| {
                slot.in_flight = false;
                slot.queued.take()
            });

            match queued {
                Some(next) => self.send(converse_id, next),
                None => {
                    self.syncs.remove(&converse_id);
                }
            }
        }
    }

    /// Wait until every started sync, including any queued behind them, has
    /// finished.
    pub async fn settle(&mut self) {
        future::poll_fn(|ctx| self.poll_persistence(ctx)).await
    }

    /// Run the tracker until it's idle: sleep until each debounce window
    /// closes, send its trailing sync, and keep in-flight syncs moving in the
    /// meantime. Returns once no window is open and nothing is in flight.
    ///
    /// Dropping the returned future is harmless; in-flight syncs are kept and
    /// picked up by the next `drive` or `settle`. An event loop can therefore
    /// race it against incoming updates and call it again afterwards. Sleeps
    /// use real time, so this is meant for the [`SystemClock`].
    pub async fn drive(&mut self) {
        loop {
            self.flush_due();

            let deadline = match self.next_deadline() {
                Some(deadline) => deadline,
                None => break,
            };

            let mut window = Delay::new(deadline.saturating_duration_since(self.clock.now()));
            future::poll_fn(|ctx| {
                // Syncs finishing doesn't end the wait; the window does.
                let _ = self.poll_persistence(ctx);
                window.poll_unpin(ctx)
            })
            .await;
        }

        self.settle().await;
    }

    /// Close a conversation's debounce window without sending the held id,
    /// e.g. when the pointer is about to be replaced by a server snapshot.
    /// The local pointer is unaffected.
    pub fn cancel_converse(&mut self, converse_id: &str) {
        self.debouncer.cancel(converse_id);
    }
}

/// The acknowledgement operations for a single conversation.
pub struct ConverseAck<'a, Store, Sink, C> {
    tracker: &'a mut AckTracker<Store, Sink, C>,
    converse_id: &'a str,
}

impl<'a, Store: StateStore, Sink: AckSink, C: Clock> ConverseAck<'a, Store, Sink, C> {
    pub fn update_converse_ack(&mut self, last_message_id: &str) -> bool {
        self.tracker
            .update_converse_ack(self.converse_id, last_message_id)
    }

    pub fn mark_converse_all_ack(&mut self) -> bool {
        self.tracker.mark_converse_all_ack(self.converse_id)
    }

    pub fn acked(&self) -> Option<String> {
        self.tracker.converse_ack(self.converse_id)
    }
}
