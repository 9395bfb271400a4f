//! These tests are intended to ensure that a batch function is called the
//! correct number of times for different configurations

use chatloader::{next_turn, BatchController, BatchRules, KeySet, ValueSet};
use cooked_waker::{IntoWaker, ViaRawPointer, Wake, WakeRef};
use futures::{executor, future, FutureExt};
use futures_timer::Delay;
use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    task::{Context, Poll},
    thread,
    time::Duration,
};

async fn stringify(keys: KeySet<usize>) -> Result<ValueSet<String>, ()> {
    Ok(keys.into_values(|value| value.to_string()))
}

fn call_counter<'a, T, R>(
    counter: &'a AtomicUsize,
    function: impl Clone + Fn(T) -> R + 'a,
) -> impl Clone + Fn(T) -> R + 'a {
    move |argument| {
        counter.fetch_add(1, Ordering::SeqCst);
        function(argument)
    }
}

fn found(value: &str) -> Result<Option<String>, ()> {
    Ok(Some(value.to_owned()))
}

#[test]
fn simple_test() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: move || future::ready(()),
        max_keys: None,
        batcher: call_counter(&counter, stringify),
        cache: false,
    });

    let fut1 = controller.load(10);
    let fut2 = controller.load(20);

    let res1 = executor::block_on(fut1);
    let res2 = executor::block_on(fut2);

    assert_eq!(res1, found("10"));
    assert_eq!(res2, found("20"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn next_turn_window_collects_everything_issued_before_awaiting() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: next_turn,
        max_keys: None,
        batcher: call_counter(&counter, stringify),
        cache: false,
    });

    let results = executor::block_on(future::join_all((0..5).map(|key| controller.load(key))));

    assert_eq!(
        results,
        ["0", "1", "2", "3", "4"].iter().map(|v| found(v)).collect::<Vec<_>>()
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // A later turn is a new batch
    let result = executor::block_on(controller.load(5));
    assert_eq!(result, found("5"));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

/// Loads that only start when their async block is first polled still land
/// in the batch opened earlier in the same turn.
#[test]
fn next_turn_window_includes_lazily_started_loads() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: next_turn,
        max_keys: None,
        batcher: call_counter(&counter, stringify),
        cache: false,
    });
    let controller = &controller;

    let results = executor::block_on(future::join_all(
        (1..=3).map(|key| async move { controller.load(key).await }),
    ));

    assert_eq!(results, [found("1"), found("2"), found("3")]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn low_key_test() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: || future::ready(()),
        max_keys: NonZeroUsize::new(2),
        batcher: call_counter(&counter, stringify),
        cache: false,
    });

    let fut1 = controller.load(10);
    let fut2 = controller.load(20);
    let fut3 = controller.load(30);

    let res1 = executor::block_on(fut1);
    let res2 = executor::block_on(fut2);
    let res3 = executor::block_on(fut3);

    assert_eq!(res1, found("10"));
    assert_eq!(res2, found("20"));
    assert_eq!(res3, found("30"));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_duplicate_keys() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: || future::ready(()),
        max_keys: None,
        batcher: call_counter(&counter, |keys: KeySet<usize>| {
            assert_eq!(keys.len(), 2);
            stringify(keys)
        }),
        cache: false,
    });

    let fut1 = controller.load(10);
    let fut2 = controller.load(10);
    let fut3 = controller.load(10);
    let fut4 = controller.load(20);

    let res1 = executor::block_on(fut1);
    let res2 = executor::block_on(fut2);
    let res3 = executor::block_on(fut3);
    let res4 = executor::block_on(fut4);

    assert_eq!(res1, found("10"));
    assert_eq!(res2, found("10"));
    assert_eq!(res3, found("10"));
    assert_eq!(res4, found("20"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// Spawn several batch futures in different threads, and confirm that a single
/// batch call was made fulfilling all of them
#[test]
fn test_threaded() {
    let counter = AtomicUsize::new(0);

    let controller = BatchController::new(BatchRules {
        window: || Delay::new(Duration::from_millis(50)),
        max_keys: None,
        batcher: call_counter(&counter, stringify),
        cache: false,
    });
    let controller_ref = &controller;

    let result: Vec<Option<String>> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..4)
            .map(move |i| {
                s.spawn(move |_s| {
                    thread::sleep(Duration::from_millis(i + 2));
                    let fut = controller_ref.load(i as usize);
                    executor::block_on(fut).unwrap()
                })
            })
            .collect();

        threads.into_iter().map(|t| t.join().unwrap()).collect()
    })
    .unwrap();

    assert_eq!(
        result,
        ["0", "1", "2", "3"]
            .iter()
            .map(|v| Some(v.to_string()))
            .collect::<Vec<_>>()
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone)]
struct NoOpWaker;

unsafe impl ViaRawPointer for NoOpWaker {
    type Target = ();

    fn into_raw(self) -> *mut () {
        std::ptr::null_mut()
    }

    unsafe fn from_raw(_ptr: *mut ()) -> Self {
        NoOpWaker
    }
}

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

#[test]
fn test_key_limit_instant_trigger() {
    let controller = BatchController::new(BatchRules {
        batcher: |keys: KeySet<usize>| stringify(keys),
        window: || future::pending::<()>(),
        max_keys: NonZeroUsize::new(3),
        cache: false,
    });

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = controller.load(1);
    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Pending);

    let mut fut2 = controller.load(2);
    assert_eq!(fut2.poll_unpin(&mut ctx), Poll::Pending);

    // Reusing a key means we won't yet be at the key limit
    let mut fut11 = controller.load(1);
    assert_eq!(fut11.poll_unpin(&mut ctx), Poll::Pending);

    let mut fut3 = controller.load(3);

    assert_eq!(fut3.poll_unpin(&mut ctx), Poll::Ready(found("3")));
    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Ready(found("1")));
    assert_eq!(fut11.poll_unpin(&mut ctx), Poll::Ready(found("1")));
    assert_eq!(fut2.poll_unpin(&mut ctx), Poll::Ready(found("2")));
}

#[test]
fn missing_keys_resolve_empty() {
    let controller = BatchController::new(BatchRules {
        batcher: |keys: KeySet<String>| async move {
            Ok::<_, ()>(keys.lookup_values(|key| match key.as_str() {
                "u1" => Some("alice"),
                _ => None,
            }))
        },
        window: next_turn,
        max_keys: None,
        cache: false,
    });

    let (u1, u2) = executor::block_on(future::join(
        controller.load("u1".to_owned()),
        controller.load("u2".to_owned()),
    ));

    assert_eq!(u1, Ok(Some("alice")));
    assert_eq!(u2, Ok(None));
}
