//! Chatloader provides the two pieces of client-side plumbing that keep a
//! chat client from flooding its backend: a request coalescer, which batches
//! many single-key lookups into one multi-key request (in the style of
//! facebook's [dataloader](https://github.com/graphql/dataloader)), and an
//! acknowledgement tracker, which keeps each conversation's "last read
//! message" pointer monotonic and syncs it to the server with debouncing.
//!
//! ## Request coalescing
//!
//! Suppose your backend can fetch many user profiles by id in one request,
//! but every message row in your UI wants exactly one profile. The batching
//! function is adapted to take a [`KeySet`], which holds all the (unique)
//! keys collected during a window, and to return a [`ValueSet`] pairing each
//! key with its value. The only way to create a [`ValueSet`] is through the
//! methods on [`KeySet`], which guarantees every requested key is accounted
//! for. Keys the backend doesn't know are not an error; they simply resolve
//! to `None`.
//!
//! ```
//! use chatloader::{KeySet, KeyedEntry, OnDuplicate, ValueSet};
//! # #[derive(Debug, Clone)] struct ApiError;
//!
//! #[derive(Debug, Clone)]
//! struct User {
//!     id: String,
//!     nickname: String,
//! }
//!
//! impl KeyedEntry<str> for User {
//!     fn get_key(&self) -> &str {
//!         &self.id
//!     }
//! }
//!
//! async fn get_users(ids: Vec<String>) -> Result<Vec<User>, ApiError> {
//!     # Ok(vec![])
//!     // perform the API request
//! }
//!
//! async fn batch_get_users(ids: KeySet<String>) -> Result<ValueSet<User>, ApiError> {
//!     let users = get_users(ids.keys().cloned().collect()).await?;
//!     Ok(ids.values_from_iter(OnDuplicate::Ignore, users))
//! }
//! ```
//!
//! A [`BatchController`] then coordinates the batching. It's configured with
//! [`BatchRules`]:
//!
//! - `batcher` is the async function described above.
//! - `window` creates a future that defines how long keys are collected.
//!   [`next_turn`] closes the window as soon as the executor gets control
//!   back, so every load issued in the same synchronous stretch of code
//!   shares a batch. A timer such as `futures_timer::Delay` gives a fixed
//!   window instead.
//! - `max_keys` optionally dispatches a batch early once it's this big.
//! - `cache` keeps every found value for the life of the controller, so
//!   later loads for that key never reach the batcher.
//!
//! ```
//! use chatloader::{next_turn, BatchController, BatchRules, KeySet, ValueSet};
//! use futures::{executor::block_on, future::join};
//!
//! async fn shout(keys: KeySet<String>) -> Result<ValueSet<String>, ()> {
//!     Ok(keys.into_values(|key| key.to_uppercase()))
//! }
//!
//! let controller = BatchController::new(BatchRules {
//!     batcher: shout,
//!     window: next_turn,
//!     max_keys: None,
//!     cache: true,
//! });
//!
//! let (a, b) = block_on(join(
//!     controller.load("alice".to_owned()),
//!     controller.load("bob".to_owned()),
//! ));
//!
//! assert_eq!(a, Ok(Some("ALICE".to_owned())));
//! assert_eq!(b, Ok(Some("BOB".to_owned())));
//! ```
//!
//! While a batch is in flight, further loads for one of its keys join it
//! rather than starting another request. If the batch function fails, every
//! waiter of that batch gets a clone of the error and nothing is cached, so
//! the next load simply tries again.
//!
//! ## Acknowledgements
//!
//! [`AckTracker`] owns the read pointers. An update is applied to the shared
//! [`StateStore`] synchronously, but only if it moves the pointer forward;
//! stale updates are ignored. Persisting to the backend goes through a
//! per-conversation [`Debouncer`] that fires on both the leading and the
//! trailing edge of a burst, and syncs for one conversation never overlap.
//! Time is read from a [`Clock`], so tests can step it with a
//! [`ManualClock`].
//!
//! ## Design notes
//!
//! ### Poll-driven batching
//!
//! All of the asynchronous work in the coalescer is driven through polling
//! [`BatchFuture`]. Nothing is spawned onto a runtime. The first future to
//! poll a batch becomes its driver, and only the driver polls the window, so
//! a window like [`next_turn`] closes on the driver's next poll rather than
//! on some other future's first one. Once the window closes, the batch
//! function is driven in the foreground by whichever future polls. The other
//! futures are woken only when data is available, or when the driving future
//! is dropped and one of them has to take over.
//!
//! ### Deduplication
//!
//! [`KeySet`] deduplicates incoming keys and only passes unique keys to the
//! batch function. [`ValueSet`] tracks how many futures wait on each key and
//! clones values only for waiters past the first.

mod ack;
mod batch;
mod cache;
mod clock;
mod config;
mod data;
mod debounce;
mod error;
mod store;
mod transport;
mod user;
mod wakerset;

pub use ack::{AckSink, AckTracker, ConverseAck, RemoteAckSink};
pub use batch::{next_turn, BatchController, BatchFuture, BatchRules, NextTurn};
pub use cache::{CacheEntry, CachedRequest, ResultCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ClientSettings, GlobalConfig};
pub use data::{KeySet, KeyedEntry, OnDuplicate, ValueSet};
pub use debounce::{DebounceOptions, Debouncer};
pub use error::{ApiError, TransportError};
pub use store::{ChatAction, ChatState, ChatStore, StateStore};
pub use transport::{Transport, TransportFuture};
pub use user::{builtin_user_info, parse_url_str, UserApi, UserBaseInfo, UserLoader, SYSTEM_USERID};
