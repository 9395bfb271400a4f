//! Who gets woken, and who takes over driving a batch, as futures join,
//! drop out of, and finish a batch.

use chatloader::{next_turn, BatchController, BatchRules, KeySet, ValueSet};
use cooked_waker::{IntoWaker, ViaRawPointer, Wake, WakeRef};
use futures::{channel::oneshot, future, FutureExt};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll, Waker},
};

/// Remembers whether it has been woken since the last reset
#[derive(Debug, Clone, Default)]
struct Flag {
    raised: Arc<AtomicBool>,
}

unsafe impl ViaRawPointer for Flag {
    type Target = AtomicBool;

    fn into_raw(self) -> *mut AtomicBool {
        Arc::into_raw(self.raised) as *mut AtomicBool
    }

    unsafe fn from_raw(ptr: *mut AtomicBool) -> Self {
        Flag {
            raised: Arc::from_raw(ptr as *const AtomicBool),
        }
    }
}

impl WakeRef for Flag {
    fn wake_by_ref(&self) {
        self.raised.store(true, Ordering::SeqCst)
    }
}

impl Wake for Flag {}

/// A future polled by hand, each with its own waker, so that the test can
/// see exactly which of them the batch wakes.
struct Polled<F> {
    fut: F,
    flag: Flag,
    waker: Waker,
}

impl<F: Future + Unpin> Polled<F> {
    fn new(fut: F) -> Self {
        let flag = Flag::default();
        Polled {
            fut,
            waker: flag.clone().into_waker(),
            flag,
        }
    }

    fn poll(&mut self) -> Poll<F::Output> {
        self.flag.raised.store(false, Ordering::SeqCst);
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    fn woken(&self) -> bool {
        self.flag.raised.load(Ordering::SeqCst)
    }
}

/// Holds the first batch open until `release` is called. Later batches run
/// straight through.
#[derive(Default)]
struct Gate {
    receiver: Mutex<Option<oneshot::Receiver<()>>>,
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl Gate {
    fn closed() -> Self {
        let (sender, receiver) = oneshot::channel();
        Gate {
            receiver: Mutex::new(Some(receiver)),
            sender: Mutex::new(Some(sender)),
        }
    }

    fn wait(&self) -> impl Future<Output = ()> {
        let receiver = self.receiver.lock().unwrap().take();
        async move {
            if let Some(receiver) = receiver {
                let _ = receiver.await;
            }
        }
    }

    fn release(&self) {
        if let Some(sender) = self.sender.lock().unwrap().take() {
            let _ = sender.send(());
        }
    }
}

#[test]
fn passengers_leave_the_window_to_the_driver() {
    let calls = AtomicUsize::new(0);
    let controller = BatchController::new(BatchRules {
        batcher: |keys: KeySet<u32>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ()>(keys.into_values(|key| key + 100)) }
        },
        window: next_turn,
        max_keys: None,
        cache: false,
    });

    let mut driver = Polled::new(controller.load(1));
    let mut passenger = Polled::new(controller.load(2));

    // The window yields to the executor once, waking only the driver
    assert_eq!(driver.poll(), Poll::Pending);
    assert!(driver.woken());
    assert_eq!(passenger.poll(), Poll::Pending);
    assert!(!passenger.woken());

    // However often the passenger is polled, the batch stays open
    assert_eq!(passenger.poll(), Poll::Pending);
    let mut late = Polled::new(controller.load(3));
    assert_eq!(late.poll(), Poll::Pending);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(driver.poll(), Poll::Ready(Ok(Some(101))));
    assert!(passenger.woken());
    assert!(late.woken());
    assert_eq!(passenger.poll(), Poll::Ready(Ok(Some(102))));
    assert_eq!(late.poll(), Poll::Ready(Ok(Some(103))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn hand_off_while_late_joiners_ride_a_running_batch() {
    let gate = Gate::closed();
    let controller = BatchController::new(BatchRules {
        batcher: |keys: KeySet<u32>| {
            let opened = gate.wait();
            async move {
                opened.await;
                Ok::<_, ()>(keys.into_values(|key| key * 10))
            }
        },
        window: || future::ready(()),
        max_keys: None,
        cache: false,
    });

    let mut first = Polled::new(controller.load(1));
    assert_eq!(first.poll(), Poll::Pending);

    // Both of these join the batch that's already running
    let mut joiner = Polled::new(controller.load(1));
    let mut quiet_joiner = Polled::new(controller.load(1));

    // The joiner polls last, so it ends up driving. Dropping it has to hand
    // the batch back to the only other registered future.
    assert_eq!(joiner.poll(), Poll::Pending);
    assert!(!first.woken());
    drop(joiner);
    assert!(first.woken());

    gate.release();
    assert_eq!(first.poll(), Poll::Ready(Ok(Some(10))));

    // Never polled, so never woken, but its value is waiting for it
    assert!(!quiet_joiner.woken());
    assert_eq!(quiet_joiner.poll(), Poll::Ready(Ok(Some(10))));
    assert_eq!(controller.in_flight(), 0);
}

#[test]
fn dropped_driver_with_cache_enabled() {
    let batches: Mutex<Vec<Vec<u32>>> = Mutex::new(Vec::new());
    let controller = BatchController::new(BatchRules {
        batcher: |keys: KeySet<u32>| {
            batches.lock().unwrap().push(keys.keys().copied().collect());
            async move { Ok::<_, ()>(keys.into_values(|key| key * 10)) }
        },
        window: next_turn,
        max_keys: None,
        cache: true,
    });

    let mut driver = Polled::new(controller.load(1));
    let mut passenger = Polled::new(controller.load(2));
    assert_eq!(driver.poll(), Poll::Pending);
    assert_eq!(passenger.poll(), Poll::Pending);

    drop(driver);
    assert!(passenger.woken());

    // The new driver closes the window; the abandoned key isn't requested
    assert_eq!(passenger.poll(), Poll::Ready(Ok(Some(20))));
    assert_eq!(*batches.lock().unwrap(), [vec![2]]);
    assert_eq!(controller.cached(&2), Some(20));
    assert_eq!(controller.cached(&1), None);

    // Served from the cache without a wake-up or a batch
    let mut again = Polled::new(controller.load(2));
    assert_eq!(again.poll(), Poll::Ready(Ok(Some(20))));
    assert_eq!(batches.lock().unwrap().len(), 1);
}

#[test]
fn dropped_driver_after_failed_batch() {
    let gate = Gate::closed();
    let calls = AtomicUsize::new(0);
    let controller = BatchController::new(BatchRules {
        batcher: |keys: KeySet<u32>| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            let opened = gate.wait();
            async move {
                opened.await;
                match attempt {
                    0 => Err("upstream timed out"),
                    _ => Ok::<ValueSet<u32>, _>(keys.into_values(|key| key * 10)),
                }
            }
        },
        window: || future::ready(()),
        max_keys: None,
        cache: true,
    });

    let mut first = Polled::new(controller.load(1));
    let mut second = Polled::new(controller.load(2));

    assert_eq!(first.poll(), Poll::Pending);
    assert_eq!(second.poll(), Poll::Pending);

    drop(second);
    assert!(first.woken());

    gate.release();
    assert_eq!(first.poll(), Poll::Ready(Err("upstream timed out")));
    assert_eq!(controller.cached(&1), None);
    assert_eq!(controller.in_flight(), 0);

    // Neither key is stuck behind the failed batch
    let mut retry = Polled::new(controller.load(2));
    assert_eq!(retry.poll(), Poll::Ready(Ok(Some(20))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
