//! Single-shot completions and completion plumbing
//!
//! A [`Completion`] is a continuation invoked exactly once with the
//! result of a deferred operation. The journal owns each completion
//! until it fires or discards it; a stage that needs a follow-up
//! constructs the next completion inside the previous one instead of
//! chaining ownership.

use metafs_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Single-shot continuation carrying the result of a deferred operation
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Invoke every completion in `list` with success
pub fn complete_all(list: Vec<Completion>) {
    for completion in list {
        completion(Ok(()));
    }
}

/// Composite barrier over outstanding prerequisites.
///
/// Producers register one sub-completion per pending piece of work via
/// [`Barrier::subscribe`]; the consumer arms the barrier with
/// [`Barrier::set_finisher`]. The finisher fires exactly once, after
/// every subscription has completed, with the first error observed (or
/// success). Arming an already-drained barrier fires immediately.
#[derive(Clone, Default)]
pub struct Barrier {
    inner: Arc<Mutex<BarrierState>>,
}

#[derive(Default)]
struct BarrierState {
    outstanding: usize,
    finisher: Option<Completion>,
    first_err: Option<Error>,
    fired: bool,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of pending work. The returned completion must
    /// be invoked when that work finishes.
    pub fn subscribe(&self) -> Completion {
        {
            let mut state = self.inner.lock();
            assert!(!state.fired, "subscribe on a fired barrier");
            state.outstanding += 1;
        }
        let inner = Arc::clone(&self.inner);
        Box::new(move |result| Self::complete_one(&inner, result))
    }

    /// Arm the barrier with its finisher
    pub fn set_finisher(&self, finisher: Completion) {
        let fire = {
            let mut state = self.inner.lock();
            assert!(state.finisher.is_none(), "finisher already set");
            state.finisher = Some(finisher);
            state.outstanding == 0 && !state.fired
        };
        if fire {
            Self::fire(&self.inner);
        }
    }

    /// Number of subscriptions still outstanding
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    fn complete_one(inner: &Arc<Mutex<BarrierState>>, result: Result<()>) {
        let fire = {
            let mut state = inner.lock();
            assert!(state.outstanding > 0, "barrier completion fired twice");
            state.outstanding -= 1;
            if let Err(err) = result {
                state.first_err.get_or_insert(err);
            }
            state.outstanding == 0 && state.finisher.is_some() && !state.fired
        };
        if fire {
            Self::fire(inner);
        }
    }

    fn fire(inner: &Arc<Mutex<BarrierState>>) {
        let fired = {
            let mut state = inner.lock();
            if state.fired {
                None
            } else {
                state.fired = true;
                state.finisher.take().map(|finisher| {
                    let result = match state.first_err.take() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                    (finisher, result)
                })
            }
        };
        if let Some((finisher, result)) = fired {
            finisher(result);
        }
    }
}

/// Deferred completion queue.
///
/// Streamer I/O completions are queued here and drained from a context
/// that holds no journal or cache lock, which is the context completions
/// are allowed to assume. Entries are popped one at a time so a
/// completion may queue further work while the drain is in progress.
#[derive(Clone, Default)]
pub struct Finisher {
    queue: Arc<Mutex<VecDeque<(Completion, Result<()>)>>>,
}

impl Finisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a completion for later delivery
    pub fn queue(&self, completion: Completion, result: Result<()>) {
        self.queue.lock().push_back((completion, result));
    }

    /// Invoke everything queued, including work queued by the
    /// completions themselves. Returns the number delivered.
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some((completion, result)) => {
                    completion(result);
                    delivered += 1;
                }
                None => break,
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
