//! One-shot initialization gate with a FIFO queue of deferred work.
//!
//! Work submitted before the gate opens is queued. The first submission tells
//! its caller to start initialization; once [`InitGate::complete`] is called
//! the queue is handed back in submission order and later submissions run
//! straight away.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;

pub type DeferredFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A unit of work waiting for the gate's value.
pub type Deferred<T> = Box<dyn FnOnce(T) -> DeferredFuture + Send>;

enum GateState<T> {
    Idle,
    Pending(VecDeque<Deferred<T>>),
    Ready(T),
}

/// Outcome of [`InitGate::admit`].
pub enum Admission<T> {
    /// The gate is open. The work is handed back to run now.
    Run(Deferred<T>, T),
    /// The work was queued and the caller must start initialization.
    Start,
    /// The work was queued behind an initialization already in progress.
    Queued,
}

pub struct InitGate<T> {
    state: Mutex<GateState<T>>,
}

impl<T: Clone + Send + 'static> InitGate<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
        }
    }

    #[cfg(test)]
    fn get(&self) -> Option<T> {
        match &*self.state.lock() {
            GateState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock(), GateState::Ready(_))
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        match &*self.state.lock() {
            GateState::Pending(queue) => queue.len(),
            _ => 0,
        }
    }

    pub fn admit(&self, work: Deferred<T>) -> Admission<T> {
        let mut state = self.state.lock();
        match &mut *state {
            GateState::Ready(value) => Admission::Run(work, value.clone()),
            GateState::Pending(queue) => {
                queue.push_back(work);
                Admission::Queued
            }
            GateState::Idle => {
                *state = GateState::Pending(VecDeque::from([work]));
                Admission::Start
            }
        }
    }

    /// Opens the gate and returns the queued work in submission order.
    pub fn complete(&self, value: T) -> VecDeque<Deferred<T>> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, GateState::Ready(value)) {
            GateState::Pending(queue) => queue,
            GateState::Idle | GateState::Ready(_) => VecDeque::new(),
        }
    }

    /// Runs drained work one item at a time.
    pub async fn replay(queue: VecDeque<Deferred<T>>, value: T) {
        for work in queue {
            work(value.clone()).await;
        }
    }
}

impl<T: Clone + Send + 'static> Default for InitGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for InitGate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            GateState::Idle => "idle",
            GateState::Pending(_) => "pending",
            GateState::Ready(_) => "ready",
        };
        f.debug_struct("InitGate").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(log: &Arc<Mutex<Vec<(usize, u32)>>>, tag: usize) -> Deferred<u32> {
        let log = log.clone();
        Box::new(move |value| -> DeferredFuture {
            Box::pin(async move {
                log.lock().push((tag, value));
            })
        })
    }

    #[tokio::test]
    async fn first_admission_starts_and_queue_replays_in_order() {
        let gate = InitGate::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(matches!(gate.admit(record(&log, 0)), Admission::Start));
        assert!(matches!(gate.admit(record(&log, 1)), Admission::Queued));
        assert!(matches!(gate.admit(record(&log, 2)), Admission::Queued));
        assert_eq!(gate.queued(), 3);
        assert!(!gate.is_ready());

        let queue = gate.complete(9);
        InitGate::replay(queue, 9).await;
        assert_eq!(*log.lock(), vec![(0, 9), (1, 9), (2, 9)]);
        assert_eq!(gate.get(), Some(9));
    }

    #[tokio::test]
    async fn open_gate_hands_work_back() {
        let gate = InitGate::new();
        assert!(gate.complete(3).is_empty());

        let log = Arc::new(Mutex::new(Vec::new()));
        match gate.admit(record(&log, 7)) {
            Admission::Run(work, value) => work(value).await,
            _ => panic!("gate should be open"),
        }
        assert_eq!(*log.lock(), vec![(7, 3)]);
        assert_eq!(gate.queued(), 0);
    }
}
