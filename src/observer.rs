//! Ordered conditional observer registry.
//!
//! Unifies spec.md §4.5's `ConditionallyDataObserved`/`ConditionalObserver`
//! and `ConcurrentObserver` into one module, per the REDESIGN FLAG in §9
//! ("a monomorphic implementation is adequate" in place of the source's
//! template-parameterized observer hierarchy,
//! `original_source/include/conditionally_data_observed.hh` and
//! `concurrent_observer.hh`).
//!
//! The observed side never owns an observer by reciprocal pointer (§9,
//! "Observer graph"): it holds `Arc<dyn ConditionalObserver<D>>` handles
//! and compares them by pointer identity on detach, while each concurrent
//! observer owns only its own queue.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::condition::Condition;
use crate::ordered_list::OrderedList;

/// Something that can receive data dispatched by a
/// `ConditionallyDataObserved` registry.
pub trait ConditionalObserver<D>: Send + Sync {
    /// Called with the condition that matched and the dispatched datum.
    fn update(&self, matched: &Condition, data: D);
}

/// Thread-safe registry mapping conditions to observers. `notify`
/// dispatches to every observer whose registered condition matches the
/// message-derived condition under `Condition`'s asymmetric equality.
pub struct ConditionallyDataObserved<D> {
    entries: Mutex<OrderedList<Arc<dyn ConditionalObserver<D>>, Condition>>,
}

impl<D> Default for ConditionallyDataObserved<D> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(OrderedList::new()),
        }
    }
}

impl<D: Clone> ConditionallyDataObserved<D> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` under `condition`.
    pub fn attach(&self, observer: Arc<dyn ConditionalObserver<D>>, condition: Condition) {
        let mut entries = self.entries.lock().expect("observer registry mutex poisoned");
        entries.insert(observer, condition);
    }

    /// Remove the first registration matching `observer` (by pointer
    /// identity) and `condition` exactly.
    pub fn detach(&self, observer: &Arc<dyn ConditionalObserver<D>>, condition: Condition) -> bool {
        let mut entries = self.entries.lock().expect("observer registry mutex poisoned");
        let mut found = None;
        for (i, (o, c)) in entries.iter().enumerate() {
            if Arc::ptr_eq(o, observer) && c.is_pub == condition.is_pub
                && c.unit == condition.unit
                && c.period == condition.period
            {
                found = Some(i);
                break;
            }
        }
        if let Some(i) = found {
            let rebuilt: Vec<_> = entries
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, e)| e.clone())
                .collect();
            *entries = OrderedList::new();
            for (o, c) in rebuilt {
                entries.insert(o, c);
            }
            true
        } else {
            false
        }
    }

    /// Dispatch `data` to every observer whose registered condition
    /// matches `message_condition` (registered condition is the lhs,
    /// `message_condition` is the rhs, per `Condition`'s asymmetric
    /// equality). Returns the number of observers notified.
    pub fn notify(&self, message_condition: &Condition, data: D) -> usize {
        let entries = self.entries.lock().expect("observer registry mutex poisoned");
        let mut count = 0;
        for (observer, registered) in entries.iter() {
            if registered == message_condition {
                observer.update(registered, data.clone());
                count += 1;
            }
        }
        count
    }

    /// Number of registered observers. Test/diagnostic use.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("observer registry mutex poisoned").len()
    }

    /// Whether the registry has no observers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A blocking FIFO observer: `update` enqueues and wakes one waiter,
/// `updated` blocks until a datum is available.
pub struct ConcurrentObserver<D> {
    queue: Mutex<VecDeque<D>>,
    ready: Condvar,
}

impl<D> Default for ConcurrentObserver<D> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }
}

impl<D> ConcurrentObserver<D> {
    /// An observer with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a datum is available, then return it.
    pub fn updated(&self) -> D {
        let mut queue = self.queue.lock().expect("observer queue mutex poisoned");
        loop {
            if let Some(d) = queue.pop_front() {
                return d;
            }
            queue = self.ready.wait(queue).expect("observer queue mutex poisoned");
        }
    }

    /// Non-blocking poll.
    pub fn try_updated(&self) -> Option<D> {
        self.queue.lock().expect("observer queue mutex poisoned").pop_front()
    }

    /// Number of queued data. Test/diagnostic use.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queue.lock().expect("observer queue mutex poisoned").len()
    }
}

impl<D: Send> ConditionalObserver<D> for ConcurrentObserver<D> {
    fn update(&self, _matched: &Condition, data: D) {
        let mut queue = self.queue.lock().expect("observer queue mutex poisoned");
        queue.push_back(data);
        self.ready.notify_one();
    }
}
