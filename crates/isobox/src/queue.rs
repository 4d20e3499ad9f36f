//! Concurrency-limited FIFO task gate.
//!
//! A bare semaphore can't reject queued waiters on `clear()`, so the waiter
//! queue is explicit: each waiter parks on a oneshot that either receives the
//! slot itself or a `QueueCleared` error. Slots are RAII guards, so a task
//! that is cancelled mid-flight still hands its slot to the next waiter.

use std::{
    collections::VecDeque,
    future::Future,
    mem,
    sync::Arc,
};

use errors::SandboxError;
use futures::channel::oneshot;
use parking_lot::Mutex;

#[derive(Debug)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    concurrency: usize,
    state: Mutex<QueueState>,
}

#[derive(Debug)]
struct QueueState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<Result<SlotGuard, SandboxError>>>,
}

/// Holds one of the queue's concurrency slots; dropping it starts the next
/// queued task.
pub struct SlotGuard {
    inner: Arc<QueueInner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        QueueInner::release(&self.inner);
    }
}

impl QueueInner {
    /// Hand the freed slot to the next live waiter, or retire it.
    fn release(inner: &Arc<QueueInner>) {
        loop {
            let waiter = {
                let mut state = inner.state.lock();
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.active -= 1;
                        return;
                    },
                }
            };
            let guard = SlotGuard {
                inner: inner.clone(),
            };
            match waiter.send(Ok(guard)) {
                Ok(()) => return,
                // Receiver cancelled its acquire; reclaim the slot without
                // re-entering release through the guard's destructor.
                Err(unsent) => {
                    if let Ok(guard) = unsent {
                        mem::forget(guard);
                    }
                },
            }
        }
    }
}

impl AsyncQueue {
    pub fn new(concurrency: usize) -> Result<Self, SandboxError> {
        if concurrency < 1 {
            return Err(SandboxError::invalid_config(format!(
                "Queue concurrency must be at least 1, got {concurrency}"
            )));
        }
        Ok(Self {
            inner: Arc::new(QueueInner {
                concurrency,
                state: Mutex::new(QueueState {
                    active: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        })
    }

    /// Take a slot, waiting FIFO behind earlier acquirers at capacity.
    pub async fn acquire(&self) -> Result<SlotGuard, SandboxError> {
        let receiver = {
            let mut state = self.inner.state.lock();
            if state.active < self.inner.concurrency {
                state.active += 1;
                return Ok(SlotGuard {
                    inner: self.inner.clone(),
                });
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };
        match receiver.await {
            Ok(result) => result,
            // Sender dropped without a verdict: the queue was torn down.
            Err(_) => Err(SandboxError::queue_cleared()),
        }
    }

    /// Run a task under the gate. Starts immediately below capacity,
    /// otherwise queues FIFO. Completion order is not guaranteed.
    pub async fn add<T, F>(&self, task: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let guard = self.acquire().await?;
        let result = task.await;
        drop(guard);
        result
    }

    /// Reject every queued task with `QueueCleared`. Running tasks are
    /// unaffected and still release their slots normally.
    pub fn clear(&self) {
        let waiters: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.waiters.drain(..).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(SandboxError::queue_cleared()));
        }
    }

    /// Queued (not yet started) task count.
    pub fn size(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    pub fn active(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn pending(&self) -> usize {
        let state = self.inner.state.lock();
        state.active + state.waiters.len()
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }
}
