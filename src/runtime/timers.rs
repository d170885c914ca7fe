//! Timer table for one engine instance.
//!
//! Timers live in an id-keyed table owned by the engine thread. Scripts only
//! ever see the integer id. A min-heap orders deadlines; cancelling removes the
//! table entry and leaves the heap slot to be skipped lazily.

use deno_core::v8;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type TimerId = u32;

/// Longest delay a timer accepts, in milliseconds.
pub const MAX_TIMER_DELAY_MS: u64 = i32::MAX as u64;

/// Shortest period of a repeating timer.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Timer table shared between the timer ops and the engine loop.
pub(crate) type SharedTimers = Rc<RefCell<TimerTable<v8::Global<v8::Function>>>>;

/// What runs when a timer fires.
#[derive(Debug)]
pub enum TimerCallback<F> {
    Callable(F),
    SourceText(String),
}

/// A timer handed out for firing.
pub struct DueTimer<F> {
    pub id: TimerId,
    pub callback: Rc<TimerCallback<F>>,
    pub repeating: bool,
    generation: u64,
}

/// Heap position captured when a firing pass starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueSlot {
    id: TimerId,
    generation: u64,
}

struct TimerEntry<F> {
    callback: Rc<TimerCallback<F>>,
    interval: Option<Duration>,
    due: Instant,
    generation: u64,
}

pub struct TimerTable<F> {
    entries: HashMap<TimerId, TimerEntry<F>>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, TimerId)>>,
    next_id: TimerId,
    next_generation: u64,
}

impl<F> Default for TimerTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> TimerTable<F> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_id: 1,
            next_generation: 0,
        }
    }

    /// Register a timer due at `now + delay`. Repeating timers keep `delay` as
    /// their period, clamped to [`MIN_INTERVAL`].
    pub fn schedule(
        &mut self,
        callback: TimerCallback<F>,
        delay: Duration,
        repeating: bool,
        now: Instant,
    ) -> TimerId {
        let id = self.allocate_id();
        let interval = repeating.then(|| delay.max(MIN_INTERVAL));
        let delay = interval.unwrap_or(delay);
        let generation = self.bump_generation();
        let due = now + delay;

        self.entries.insert(
            id,
            TimerEntry {
                callback: Rc::new(callback),
                interval,
                due,
                generation,
            },
        );
        self.deadlines.push(Reverse((due, generation, id)));
        id
    }

    /// Remove a timer. Unknown ids are ignored.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Remove every timer. Returns how many were live.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.deadlines.clear();
        count
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale_head();
        self.deadlines.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Take the slots of every timer due at `now`, in deadline order.
    ///
    /// Timers scheduled or re-armed after this call are not part of the pass,
    /// even if they are already due.
    pub fn collect_due(&mut self, now: Instant) -> Vec<DueSlot> {
        let mut due = Vec::new();
        loop {
            self.discard_stale_head();
            match self.deadlines.peek() {
                Some(Reverse((deadline, _, _))) if *deadline <= now => {}
                _ => break,
            }
            if let Some(Reverse((_, generation, id))) = self.deadlines.pop() {
                due.push(DueSlot { id, generation });
            }
        }
        due
    }

    /// Claim a collected slot for firing. Returns `None` if the timer was
    /// cancelled since the pass started. One-shot timers leave the table here.
    pub fn begin_fire(&mut self, slot: DueSlot) -> Option<DueTimer<F>> {
        let entry = self.entries.get(&slot.id)?;
        if entry.generation != slot.generation {
            return None;
        }

        if entry.interval.is_some() {
            return Some(DueTimer {
                id: slot.id,
                callback: Rc::clone(&entry.callback),
                repeating: true,
                generation: slot.generation,
            });
        }

        let entry = self.entries.remove(&slot.id)?;
        Some(DueTimer {
            id: slot.id,
            callback: entry.callback,
            repeating: false,
            generation: slot.generation,
        })
    }

    /// Re-arm a repeating timer at `now + interval`. No-op if the callback
    /// cancelled it.
    pub fn rearm(&mut self, timer: &DueTimer<F>, now: Instant) -> bool {
        let generation = self.bump_generation();
        let Some(entry) = self.entries.get_mut(&timer.id) else {
            return false;
        };
        let Some(interval) = entry.interval else {
            return false;
        };
        if entry.generation != timer.generation {
            return false;
        }

        entry.due = now + interval;
        entry.generation = generation;
        self.deadlines.push(Reverse((entry.due, generation, timer.id)));
        true
    }

    fn discard_stale_head(&mut self) {
        while let Some(Reverse((_, generation, id))) = self.deadlines.peek() {
            let live = self
                .entries
                .get(id)
                .is_some_and(|entry| entry.generation == *generation);
            if live {
                break;
            }
            self.deadlines.pop();
        }
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn allocate_id(&mut self) -> TimerId {
        loop {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Convert a script-supplied delay in milliseconds to a duration.
///
/// NaN and negative values become zero. Fractions are truncated and large
/// values saturate at [`MAX_TIMER_DELAY_MS`].
pub fn coerce_delay(delay_ms: f64) -> Duration {
    if delay_ms.is_nan() || delay_ms <= 0.0 {
        return Duration::ZERO;
    }
    if delay_ms >= MAX_TIMER_DELAY_MS as f64 {
        return Duration::from_millis(MAX_TIMER_DELAY_MS);
    }
    Duration::from_millis(delay_ms.trunc() as u64)
}
