//! Timed hooks, stored in a back-indexed heap by trip time.

use crate::heap::{Heap, Slotted, NOT_IN_HEAP};
use std::{
    cmp::Ordering,
    fmt,
    sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
    sync::Arc,
    time::{Duration, Instant},
};

use super::hooks::{HookRemove, IntervalAction};
use crate::bridge::channel::BridgeChannel;

/// Callback form for interval hooks.
pub type IntervalCallback = Box<dyn FnMut(&Arc<BridgeChannel>) -> IntervalAction + Send>;

/// A hook fired every `interval`, earliest trip first.
pub struct IntervalHook {
    pub(crate) callback: IntervalCallback,
    /// Current firing interval.
    pub interval: Duration,
    /// Suspend media around the firing pass.
    pub media: bool,
    /// Automatic removal conditions.
    pub remove_flags: HookRemove,
    pub(crate) trip_at: Instant,
    pub(crate) seqno: u64,
    slot: AtomicUsize,
}

impl IntervalHook {
    fn new(
        interval: Duration,
        media: bool,
        remove_flags: HookRemove,
        callback: IntervalCallback,
        now: Instant,
        seqno: u64,
    ) -> Self {
        Self {
            callback,
            interval,
            media,
            remove_flags,
            trip_at: now + interval,
            seqno,
            slot: AtomicUsize::new(NOT_IN_HEAP),
        }
    }
}

impl Slotted for Box<IntervalHook> {
    fn slot(&self) -> usize {
        self.slot.load(AtomicOrdering::Relaxed)
    }

    fn set_slot(&self, slot: usize) {
        self.slot.store(slot, AtomicOrdering::Relaxed);
    }
}

impl fmt::Debug for IntervalHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IntervalHook({:?}, seq: {}, media: {})",
            self.interval, self.seqno, self.media
        )
    }
}

fn earliest_first(a: &Box<IntervalHook>, b: &Box<IntervalHook>) -> Ordering {
    // Reversed: the max-heap root must be the earliest trip, with the
    // lower sequence number winning a tie.
    match b.trip_at.cmp(&a.trip_at) {
        Ordering::Equal => b.seqno.cmp(&a.seqno),
        other => other,
    }
}

/// The per-channel store of interval hooks.
pub struct IntervalHooks {
    heap: Heap<Box<IntervalHook>>,
    next_seqno: u64,
}

impl Default for IntervalHooks {
    fn default() -> Self {
        Self {
            heap: Heap::new(earliest_first),
            next_seqno: 0,
        }
    }
}

impl IntervalHooks {
    /// Installs a hook that first fires one `interval` from now.
    pub fn install(
        &mut self,
        interval: Duration,
        media: bool,
        remove_flags: HookRemove,
        callback: IntervalCallback,
    ) {
        let seqno = self.take_seqno();
        let hook = IntervalHook::new(interval, media, remove_flags, callback, Instant::now(), seqno);
        self.heap.push(Box::new(hook));
    }

    /// When the earliest hook trips, if any are installed.
    #[must_use]
    pub fn next_trip(&self) -> Option<Instant> {
        self.heap.peek().map(|h| h.trip_at)
    }

    /// Number of installed hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no hooks are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Whether any currently-due hook wants media suspended.
    pub(crate) fn due_wants_media(&self, now: Instant) -> bool {
        // Only the root is cheaply visible; a due root with media set
        // is the common case, and the firing loop re-suspends for
        // later media hooks in the same pass if needed.
        self.heap
            .peek()
            .map(|h| h.trip_at <= now && h.media)
            .unwrap_or(false)
    }

    /// Removes and returns the earliest hook if it is due.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Box<IntervalHook>> {
        if self.heap.peek().map(|h| h.trip_at <= now) == Some(true) {
            self.heap.pop()
        } else {
            None
        }
    }

    /// Re-arms a fired hook.
    ///
    /// The next trip lands on the hook's original cadence: slack
    /// accumulated while firing never exceeds one period.
    pub(crate) fn reschedule(&mut self, mut hook: Box<IntervalHook>, now: Instant) {
        let interval = hook.interval;
        let since_trip = now.saturating_duration_since(hook.trip_at);
        let phase = Duration::from_nanos(
            (since_trip.as_nanos() % interval.as_nanos().max(1)) as u64,
        );

        hook.trip_at = now + (interval - phase);
        hook.seqno = self.take_seqno();
        self.heap.push(hook);
    }

    /// Unlinks every hook matching the predicate.
    pub(crate) fn remove_where<F>(&mut self, mut pred: F)
    where
        F: FnMut(&IntervalHook) -> bool,
    {
        let kept: Vec<_> = self
            .heap
            .drain()
            .into_iter()
            .filter(|h| !pred(h))
            .collect();
        for hook in kept {
            self.heap.push(hook);
        }
    }

    /// Moves every hook out of this store, for re-wrapping during a
    /// feature-set merge.
    pub(crate) fn drain(&mut self) -> Vec<Box<IntervalHook>> {
        self.heap.drain()
    }

    /// Re-inserts a hook taken from another store.
    pub(crate) fn adopt(&mut self, mut hook: Box<IntervalHook>) {
        hook.seqno = self.take_seqno();
        self.heap.push(hook);
    }

    fn take_seqno(&mut self) -> u64 {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        seqno
    }
}

impl fmt::Debug for IntervalHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalHooks")
            .field("len", &self.heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> IntervalCallback {
        Box::new(|_| IntervalAction::Keep)
    }

    #[test]
    fn earliest_trip_at_root() {
        let mut hooks = IntervalHooks::default();
        hooks.install(Duration::from_millis(500), false, HookRemove::empty(), noop());
        hooks.install(Duration::from_millis(100), false, HookRemove::empty(), noop());
        hooks.install(Duration::from_millis(300), false, HookRemove::empty(), noop());

        let first = hooks.next_trip().unwrap();
        let popped = hooks.pop_due(first + Duration::from_millis(1)).unwrap();
        assert_eq!(popped.interval, Duration::from_millis(100));
    }

    #[test]
    fn equal_trips_fire_in_install_order() {
        let mut hooks = IntervalHooks::default();
        // Same interval installed back-to-back; the seqno tiebreak
        // must preserve install order even if the instants collide.
        hooks.install(Duration::from_millis(100), false, HookRemove::empty(), noop());
        hooks.install(Duration::from_millis(100), false, HookRemove::empty(), noop());

        let now = Instant::now() + Duration::from_millis(200);
        let a = hooks.pop_due(now).unwrap();
        let b = hooks.pop_due(now).unwrap();
        assert!(a.seqno < b.seqno);
    }

    #[test]
    fn reschedule_keeps_cadence() {
        let mut hooks = IntervalHooks::default();
        hooks.install(Duration::from_millis(100), false, HookRemove::empty(), noop());

        let tripped = hooks.pop_due(Instant::now() + Duration::from_secs(1)).unwrap();
        let old_trip = tripped.trip_at;

        // Fired 30ms late: the next trip is 70ms out, not 100ms.
        let now = old_trip + Duration::from_millis(30);
        hooks.reschedule(tripped, now);

        let next = hooks.next_trip().unwrap();
        assert_eq!(next, now + Duration::from_millis(70));
    }

    #[test]
    fn remove_where_unlinks() {
        let mut hooks = IntervalHooks::default();
        hooks.install(
            Duration::from_millis(100),
            false,
            HookRemove::ON_PULL,
            noop(),
        );
        hooks.install(Duration::from_millis(200), false, HookRemove::empty(), noop());

        hooks.remove_where(|h| h.remove_flags.contains(HookRemove::ON_PULL));
        assert_eq!(hooks.len(), 1);
    }
}
