//! Bounded, id-indexed circular buffer shared between pipeline stages
//!
//! One lock per buffer instance serializes every operation. Callers never
//! hold references into buffer storage: reads return clones, writes go
//! through `mutate`, which runs a closure under the lock. The condition
//! variable shares that lock, so a writer's change and its wake-up are
//! observed atomically by `wait_front`.

use crate::error::{AnalyticsError, Result};
use crate::types::FrameId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outcome of waiting on the oldest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontWait {
    /// The entry is still the oldest and satisfies the predicate
    Satisfied,
    /// The entry is still the oldest but the timeout elapsed first
    TimedOut,
    /// The entry is no longer the oldest (evicted, popped or cleared)
    Gone,
}

struct Ring<V> {
    slots: Vec<Option<(FrameId, V)>>,
    index: HashMap<FrameId, usize>,
    /// Next write position
    head: usize,
    /// Oldest resident entry
    tail: usize,
    len: usize,
}

impl<V> Ring<V> {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            index: HashMap::with_capacity(capacity),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn front(&self) -> Option<&(FrameId, V)> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.tail].as_ref()
    }

    fn pop_front(&mut self) -> Option<(FrameId, V)> {
        if self.len == 0 {
            return None;
        }
        let entry = self.slots[self.tail].take();
        if let Some((id, _)) = &entry {
            self.index.remove(id);
        }
        self.tail = (self.tail + 1) % self.capacity();
        self.len -= 1;
        entry
    }

    fn get_mut(&mut self, id: FrameId) -> Option<&mut V> {
        let slot = *self.index.get(&id)?;
        self.slots[slot].as_mut().map(|(_, value)| value)
    }

    fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.index.clear();
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }
}

/// Fixed-capacity circular buffer keyed by frame id
pub struct BoundedIndexedBuffer<V> {
    name: String,
    inner: Mutex<Ring<V>>,
    changed: Condvar,
    evictions: AtomicU64,
}

impl<V> BoundedIndexedBuffer<V> {
    /// Create a buffer holding at most `capacity` entries (minimum 1)
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Ring::with_capacity(capacity.max(1))),
            changed: Condvar::new(),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Insert at the write position, evicting the oldest entry when full
    ///
    /// Returns the id of the evicted entry, if any. An id that is still
    /// resident is rejected so a wrapped id can never alias a live frame.
    pub fn push(&self, id: FrameId, value: V) -> Result<Option<FrameId>> {
        let mut ring = self.lock();
        if ring.index.contains_key(&id) {
            return Err(AnalyticsError::FrameIdAliased { id });
        }

        let evicted = if ring.len == ring.capacity() {
            ring.pop_front().map(|(old_id, _)| old_id)
        } else {
            None
        };

        let head = ring.head;
        let capacity = ring.capacity();
        ring.slots[head] = Some((id, value));
        ring.index.insert(id, head);
        ring.head = (head + 1) % capacity;
        ring.len += 1;
        drop(ring);

        if let Some(old_id) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            log::debug!("{} buffer full, evicted frame {}", self.name, old_id);
        }
        self.changed.notify_all();
        Ok(evicted)
    }

    /// Remove and return the oldest entry
    pub fn pop(&self) -> Option<(FrameId, V)> {
        let entry = self.lock().pop_front();
        if entry.is_some() {
            self.changed.notify_all();
        }
        entry
    }

    /// Remove the oldest entry only if it is `id`
    pub fn take_front_if(&self, id: FrameId) -> Option<V> {
        let mut ring = self.lock();
        match ring.front() {
            Some((front_id, _)) if *front_id == id => {}
            _ => return None,
        }
        let entry = ring.pop_front();
        drop(ring);
        self.changed.notify_all();
        entry.map(|(_, value)| value)
    }

    pub fn front_id(&self) -> Option<FrameId> {
        self.lock().front().map(|(id, _)| *id)
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.lock().index.contains_key(&id)
    }

    /// Apply `f` to the entry for `id` under the buffer lock
    ///
    /// Returns `None` when `id` is not resident. Waiters are woken after
    /// every successful mutation.
    pub fn mutate<R, F>(&self, id: FrameId, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        let mut ring = self.lock();
        let result = ring.get_mut(id).map(f);
        drop(ring);
        if result.is_some() {
            self.changed.notify_all();
        }
        result
    }

    /// Block until the oldest entry is `id` and satisfies `ready`, the entry
    /// leaves the front, or `timeout` elapses
    pub fn wait_front<P>(&self, id: FrameId, timeout: Duration, mut ready: P) -> FrontWait
    where
        P: FnMut(&V) -> bool,
    {
        let guard = self.lock();
        let (ring, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |ring| match ring.front() {
                Some((front_id, value)) if *front_id == id => !ready(value),
                _ => false,
            })
            .unwrap_or_else(PoisonError::into_inner);

        match ring.front() {
            Some((front_id, value)) if *front_id == id => {
                if ready(value) {
                    FrontWait::Satisfied
                } else {
                    FrontWait::TimedOut
                }
            }
            _ => FrontWait::Gone,
        }
    }

    /// Drop every entry (pipeline shutdown)
    pub fn clear(&self) {
        self.lock().reset();
        self.changed.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().len == 0
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    /// Entries evicted by overflow since creation
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Resident ids from oldest to newest
    pub fn ids(&self) -> Vec<FrameId> {
        let ring = self.lock();
        (0..ring.len)
            .filter_map(|offset| {
                let slot = (ring.tail + offset) % ring.capacity();
                ring.slots[slot].as_ref().map(|(id, _)| *id)
            })
            .collect()
    }
}

impl<V: Clone> BoundedIndexedBuffer<V> {
    /// Snapshot of the oldest entry
    pub fn front(&self) -> Option<(FrameId, V)> {
        self.lock().front().cloned()
    }

    /// Snapshot of the entry for `id`, if resident
    pub fn lookup(&self, id: FrameId) -> Option<V> {
        let ring = self.lock();
        let slot = *ring.index.get(&id)?;
        ring.slots[slot].as_ref().map(|(_, value)| value.clone())
    }
}
