//! Callout queue: one-shot and periodic timers over plain event values.
//!
//! Timers do not own closures. Each timer carries an event value which the
//! owner dispatches itself once [`Callout::pop_expired`] hands it back, so no
//! timer ever holds a reference into the state it acts upon.
//!
//! # Examples
//!
//! ```
//! use rgnut::callout::Callout;
//! use rgnut::time::Timestamp;
//! use std::time::Duration;
//!
//! let mut cq = Callout::new();
//! let start = Timestamp::from_secs(0);
//! cq.schedule(start + Duration::from_secs(2), "late");
//! cq.schedule(start + Duration::from_secs(1), "early");
//!
//! let now = start + Duration::from_secs(5);
//! assert_eq!(cq.pop_expired(now).map(|(_, e)| e), Some("early"));
//! assert_eq!(cq.pop_expired(now).map(|(_, e)| e), Some("late"));
//! assert!(cq.pop_expired(now).is_none());
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::time::Timestamp;

/// Handle to a scheduled timer. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

struct Entry<E> {
    event: E,
    due: Timestamp,
    seq: u64,
    period: Option<Duration>,
}

pub struct Callout<E> {
    heap: BinaryHeap<Reverse<(Timestamp, u64, TimerId)>>,
    entries: HashMap<TimerId, Entry<E>>,
    next_id: u64,
    next_seq: u64,
}

impl<E: Clone> Callout<E> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
            next_seq: 0,
        }
    }

    /// Schedules `event` to fire once at `due`.
    pub fn schedule(&mut self, due: Timestamp, event: E) -> TimerId {
        self.insert(due, event, None)
    }

    /// Schedules `event` to fire at `first` and then every `period`.
    pub fn schedule_periodic(&mut self, first: Timestamp, period: Duration, event: E) -> TimerId {
        self.insert(first, event, Some(period))
    }

    fn insert(&mut self, due: Timestamp, event: E, period: Option<Duration>) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let seq = self.push(due, id);
        self.entries.insert(
            id,
            Entry {
                event,
                due,
                seq,
                period,
            },
        );
        id
    }

    fn push(&mut self, due: Timestamp, id: TimerId) -> u64 {
        self.next_seq += 1;
        self.heap.push(Reverse((due, self.next_seq, id)));
        self.next_seq
    }

    /// Cancels a timer, returning its event if it was still scheduled.
    pub fn cancel(&mut self, id: TimerId) -> Option<E> {
        self.entries.remove(&id).map(|e| e.event)
    }

    /// Moves a pending timer to a new deadline.
    pub fn reschedule(&mut self, id: TimerId, due: Timestamp) -> bool {
        if !self.entries.contains_key(&id) {
            return false;
        }
        let seq = self.push(due, id);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.due = due;
            entry.seq = seq;
        }
        true
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn due(&self, id: TimerId) -> Option<Timestamp> {
        self.entries.get(&id).map(|e| e.due)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Pops the next timer due at or before `now`.
    ///
    /// Periodic timers are re-armed one period after their previous deadline
    /// (or after `now` when they fell behind) before being returned.
    pub fn pop_expired(&mut self, now: Timestamp) -> Option<(TimerId, E)> {
        self.discard_stale();

        let Reverse((due, _, id)) = *self.heap.peek()?;
        if due > now {
            return None;
        }
        self.heap.pop();

        let period = self.entries.get(&id)?.period;
        match period {
            Some(period) => {
                let mut next = due + period;
                if next <= now {
                    next = now + period;
                }
                let seq = self.push(next, id);
                let entry = self.entries.get_mut(&id)?;
                entry.due = next;
                entry.seq = seq;
                Some((id, entry.event.clone()))
            }
            None => self.entries.remove(&id).map(|e| (id, e.event)),
        }
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, seq, id))) = self.heap.peek() {
            match self.entries.get(id) {
                Some(entry) if entry.seq == *seq => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

impl<E: Clone> Default for Callout<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut cq = Callout::new();
        cq.schedule(at(3), 3);
        cq.schedule(at(1), 1);
        cq.schedule(at(2), 2);

        let fired: Vec<i32> = std::iter::from_fn(|| cq.pop_expired(at(10)).map(|(_, e)| e)).collect();
        assert_eq!(fired, vec![1, 2, 3]);
        assert!(cq.is_empty());
    }

    #[test]
    fn test_same_deadline_fifo() {
        let mut cq = Callout::new();
        cq.schedule(at(1), "a");
        cq.schedule(at(1), "b");
        assert_eq!(cq.pop_expired(at(1)).map(|(_, e)| e), Some("a"));
        assert_eq!(cq.pop_expired(at(1)).map(|(_, e)| e), Some("b"));
    }

    #[test]
    fn test_not_yet_due() {
        let mut cq = Callout::new();
        cq.schedule(at(5), ());
        assert!(cq.pop_expired(at(4)).is_none());
        assert_eq!(cq.next_deadline(), Some(at(5)));
    }

    #[test]
    fn test_cancel() {
        let mut cq = Callout::new();
        let id = cq.schedule(at(1), 7);
        assert_eq!(cq.cancel(id), Some(7));
        assert_eq!(cq.cancel(id), None);
        assert!(cq.pop_expired(at(10)).is_none());
        assert_eq!(cq.next_deadline(), None);
    }

    #[test]
    fn test_reschedule() {
        let mut cq = Callout::new();
        let id = cq.schedule(at(1), 1);
        assert!(cq.reschedule(id, at(5)));
        assert!(cq.pop_expired(at(2)).is_none());
        assert_eq!(cq.pop_expired(at(5)).map(|(i, _)| i), Some(id));
    }

    #[test]
    fn test_periodic_rearms() {
        let mut cq = Callout::new();
        let id = cq.schedule_periodic(at(1), Duration::from_secs(1), "tick");

        assert!(cq.pop_expired(at(1)).is_some());
        assert_eq!(cq.due(id), Some(at(2)));
        assert!(cq.pop_expired(at(1)).is_none());

        // Falling far behind fires once, then re-arms relative to now.
        assert!(cq.pop_expired(at(10)).is_some());
        assert!(cq.pop_expired(at(10)).is_none());
        assert_eq!(cq.due(id), Some(at(11)));

        cq.cancel(id);
        assert!(cq.pop_expired(at(100)).is_none());
    }
}
