use std::cmp;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Identifies a timer registered with [`EventLoop::run_at`].
///
/// A repeating timer's id carries a negated deadline, so [`cancel`] can tell
/// the repeating registration apart from the one-shot entry backing its
/// current firing.
///
/// [`EventLoop::run_at`]: crate::EventLoop::run_at
/// [`cancel`]: crate::EventLoop::cancel
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    at: i64,
    seq: i64,
}

impl TimerId {
    pub(crate) fn new(at: i64, seq: i64) -> TimerId {
        TimerId { at, seq }
    }

    fn key(&self) -> (i64, i64) {
        (self.at, self.seq)
    }
}

pub(crate) type TimerTask = Box<dyn FnMut() + Send>;

enum Entry {
    Once(TimerTask),
    // Key of the repeating registration this firing belongs to.
    Tick((i64, i64)),
}

struct Repeating {
    interval_ms: i64,
    // Key of the currently scheduled one-shot firing.
    at: (i64, i64),
    task: Arc<Mutex<TimerTask>>,
}

/// One due firing, handed back to the loop to invoke outside the store's
/// lock.
pub(crate) enum Firing {
    Once(TimerTask),
    Tick(Arc<Mutex<TimerTask>>),
}

/// Ordered store of pending timers.
///
/// One-shot entries live in a map ordered by `(deadline_ms, seq)`; each
/// repeating timer additionally keeps a descriptor that tracks its current
/// one-shot entry and re-arms it on every firing.
pub(crate) struct TimerStore {
    queue: BTreeMap<(i64, i64), Entry>,
    repeating: HashMap<(i64, i64), Repeating>,
}

/// Delay reported when no timer is pending.
pub(crate) const NO_TIMER_MS: i64 = 1 << 30;

impl TimerStore {
    pub fn new() -> TimerStore {
        TimerStore {
            queue: BTreeMap::new(),
            repeating: HashMap::new(),
        }
    }

    pub fn schedule_once(&mut self, key: (i64, i64), task: TimerTask) {
        self.queue.insert(key, Entry::Once(task));
    }

    pub fn schedule_repeating(
        &mut self,
        key: (i64, i64),
        interval_ms: i64,
        first: (i64, i64),
        task: TimerTask,
    ) {
        self.repeating.insert(
            key,
            Repeating {
                interval_ms,
                at: first,
                task: Arc::new(Mutex::new(task)),
            },
        );
        self.queue.insert(first, Entry::Tick(key));
    }

    /// Remove a timer; `true` only if a live entry was removed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if id.at < 0 {
            match self.repeating.remove(&id.key()) {
                Some(repeating) => {
                    self.queue.remove(&repeating.at);
                    true
                }
                None => false,
            }
        } else {
            self.queue.remove(&id.key()).is_some()
        }
    }

    /// Milliseconds until the earliest deadline, clamped at zero;
    /// [`NO_TIMER_MS`] when nothing is pending.
    pub fn next_delay_ms(&self, now_ms: i64) -> i64 {
        match self.queue.keys().next() {
            Some(&(at, _)) => cmp::max(0, at - now_ms),
            None => NO_TIMER_MS,
        }
    }

    /// Detach every due entry, re-arming repeating ones.
    ///
    /// Entries are erased before their tasks run, so a task never observes
    /// itself still scheduled. A repeating timer's next deadline is computed
    /// from the previous deadline, not from `now_ms`: late ticks are made up
    /// one by one instead of being coalesced.
    pub fn take_due(&mut self, now_ms: i64, mut next_seq: impl FnMut() -> i64) -> Vec<Firing> {
        let mut due = Vec::new();
        while let Some(((at, _), entry)) = self.pop_due(now_ms) {
            match entry {
                Entry::Once(task) => due.push(Firing::Once(task)),
                Entry::Tick(key) => {
                    if let Some(repeating) = self.repeating.get_mut(&key) {
                        let next = (at + repeating.interval_ms, next_seq());
                        repeating.at = next;
                        let task = Arc::clone(&repeating.task);
                        self.queue.insert(next, Entry::Tick(key));
                        due.push(Firing::Tick(task));
                    }
                }
            }
        }
        due
    }

    fn pop_due(&mut self, now_ms: i64) -> Option<((i64, i64), Entry)> {
        let key = *self
            .queue
            .first_key_value()
            .filter(|(key, _)| key.0 <= now_ms)?
            .0;
        self.queue.remove(&key).map(|entry| (key, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerTask {
        Box::new(|| {})
    }

    #[test]
    fn orders_by_deadline_then_seq() {
        let mut store = TimerStore::new();
        store.schedule_once((20, 1), noop());
        store.schedule_once((10, 2), noop());
        store.schedule_once((10, 0), noop());
        assert_eq!(store.next_delay_ms(0), 10);
        assert_eq!(store.take_due(10, || 99).len(), 2);
        assert_eq!(store.next_delay_ms(15), 5);
    }

    #[test]
    fn cancel_one_shot() {
        let mut store = TimerStore::new();
        store.schedule_once((5, 0), noop());
        let id = TimerId::new(5, 0);
        assert!(store.cancel(id));
        assert!(!store.cancel(id));
        assert!(store.take_due(100, || 1).is_empty());
    }

    #[test]
    fn repeating_rearms_from_previous_deadline() {
        let mut store = TimerStore::new();
        let mut seq = 10;
        store.schedule_repeating((-100, 0), 100, (100, 1), noop());
        // Fire late: the next deadline is 200, not 250 + 100.
        assert_eq!(store.take_due(250, || { seq += 1; seq }).len(), 2);
        assert_eq!(store.next_delay_ms(250), 50);
    }

    #[test]
    fn cancel_repeating_by_sign() {
        let mut store = TimerStore::new();
        store.schedule_repeating((-100, 0), 100, (100, 1), noop());
        assert!(store.cancel(TimerId::new(-100, 0)));
        assert!(store.take_due(1_000, || 2).is_empty());
        assert_eq!(store.next_delay_ms(0), NO_TIMER_MS);
    }
}
