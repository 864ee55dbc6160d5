//! The counter table: dependency counters, their names, and the wait-lists of
//! jobs parked on them.
//!
//! A counter tracks the number of submitted-but-not-completed jobs that name
//! it as a signal counter. When a decrement brings it to zero, every job
//! parked on the counter's wait-list is drained and handed back to the
//! scheduler for dispatch, exactly once per zero crossing.
//!
//! Locks are always taken in the same order:
//!
//! 1. the table lock (shared for value changes, exclusive only to grow),
//! 2. the counter's own mutex,
//! 3. the wait-list lock.
//!
//! The wait-list table sits behind a plain mutex rather than a read/write
//! lock: parked jobs are `Send` but not `Sync`, and every access but the
//! diagnostic [`CounterTable::parked`] mutates the table anyway.
//!
//! Holding the counter mutex across "check the count" and "park on the
//! wait-list" is what prevents a decrement from slipping between the two and
//! stranding the parked job. The name map and the free-list have independent
//! locks and are never held while taking a counter mutex for writing.

use alloc::string::String;
use alloc::string::ToString;
use alloc::vec::Vec;
use std::collections::HashMap;

use tracing::trace;
use tracing::warn;

use crate::job::JobDecl;
use crate::platform::*;

// -----------------------------------------------------------------------------
// Handles

/// An opaque reference to a counter owned by a [`Scheduler`](crate::Scheduler).
///
/// Handles are generation tagged: once a counter is freed, any handle to it
/// goes stale, and using a stale handle panics instead of silently aliasing
/// whatever counter later reuses the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CounterHandle {
    index: u32,
    generation: u32,
}

impl CounterHandle {
    #[inline(always)]
    pub(crate) const fn from_parts(index: u32, generation: u32) -> CounterHandle {
        CounterHandle { index, generation }
    }

    /// The slot index of this counter within the table.
    #[inline(always)]
    pub fn index(self) -> usize {
        self.index as usize
    }
}

// -----------------------------------------------------------------------------
// Counter slots

struct CounterSlot {
    state: Mutex<CounterState>,
}

struct CounterState {
    count: u32,
    generation: u32,
    name: Option<String>,
}

impl CounterSlot {
    fn new() -> CounterSlot {
        CounterSlot {
            state: Mutex::new(CounterState {
                count: 0,
                generation: 0,
                name: None,
            }),
        }
    }
}

// -----------------------------------------------------------------------------
// Counter table

pub(crate) struct CounterTable {
    /// Every counter ever allocated. Grows, never shrinks.
    slots: RwLock<Vec<CounterSlot>>,
    /// Indices of freed slots, ready for reuse.
    free: Mutex<Vec<u32>>,
    /// Named counters, for idempotent lookup.
    names: Mutex<HashMap<String, CounterHandle>>,
    /// Jobs deferred until their wait counter reaches zero.
    wait_lists: Mutex<HashMap<CounterHandle, Vec<JobDecl>>>,
}

impl CounterTable {
    pub fn new() -> CounterTable {
        CounterTable {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            names: Mutex::new(HashMap::new()),
            wait_lists: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the counter behind `handle` and passes its state to `f`.
    ///
    /// # Panics
    ///
    /// Panics if the handle is out of range or stale.
    fn with_counter<F, R>(&self, handle: CounterHandle, f: F) -> R
    where
        F: FnOnce(&mut CounterState) -> R,
    {
        let slots = self.slots.read().unwrap();
        let Some(slot) = slots.get(handle.index()) else {
            panic!("attempt to use out-of-range counter handle {handle:?}");
        };
        let mut state = slot.state.lock().unwrap();
        assert_eq!(
            state.generation, handle.generation,
            "attempt to use stale counter handle {handle:?}"
        );
        f(&mut state)
    }

    /// Returns a recycled handle if one is available, otherwise grows the
    /// table by one slot.
    pub fn get_free_counter(&self) -> CounterHandle {
        let recycled = self.free.lock().unwrap().pop();
        if let Some(index) = recycled {
            let slots = self.slots.read().unwrap();
            let generation = slots[index as usize].state.lock().unwrap().generation;
            trace!("recycled counter {index}");
            return CounterHandle::from_parts(index, generation);
        }

        let mut slots = self.slots.write().unwrap();
        let index = u32::try_from(slots.len()).expect("counter table exhausted");
        slots.push(CounterSlot::new());
        trace!("allocated counter {index}");
        CounterHandle::from_parts(index, 0)
    }

    /// Looks up the counter registered under `name`, allocating and
    /// registering a fresh one if there is none. The name lock is held for the
    /// whole call, so concurrent callers agree on a single handle.
    pub fn get_counter_by_id(&self, name: &str) -> CounterHandle {
        let mut names = self.names.lock().unwrap();
        if let Some(&handle) = names.get(name) {
            return handle;
        }

        let handle = self.get_free_counter();
        self.with_counter(handle, |state| state.name = Some(name.to_string()));
        names.insert(name.to_string(), handle);
        trace!("registered counter {} as {name:?}", handle.index);
        handle
    }

    /// Resets the counter, invalidates every outstanding handle to it, and
    /// returns its slot to the free-list. Jobs still parked on the counter can
    /// never be released, so they are dropped.
    ///
    /// # Panics
    ///
    /// Panics if the handle is out of range or has already been freed.
    pub fn free_counter(&self, handle: CounterHandle) {
        let (count, name, dropped) = self.with_counter(handle, |state| {
            let count = core::mem::replace(&mut state.count, 0);
            state.generation = state.generation.wrapping_add(1);
            let dropped = self.wait_lists.lock().unwrap().remove(&handle);
            (count, state.name.take(), dropped)
        });

        let dropped = dropped.map_or(0, |jobs| jobs.len());
        if count != 0 || dropped != 0 {
            warn!(
                "freed counter {handle:?} while {count} job(s) still signal it, dropping {dropped} parked job(s)"
            );
        }

        if let Some(name) = name {
            let mut names = self.names.lock().unwrap();
            if names.get(&name) == Some(&handle) {
                names.remove(&name);
            }
        }

        self.free.lock().unwrap().push(handle.index);
        trace!("freed counter {}", handle.index);
    }

    /// Adds `by` to the counter.
    pub fn increment(&self, handle: CounterHandle, by: u32) {
        self.with_counter(handle, |state| {
            state.count = state
                .count
                .checked_add(by)
                .expect("counter overflowed while incrementing");
        });
    }

    /// Subtracts one from the counter. If that brings it to zero, the
    /// counter's wait-list is drained and the parked jobs are returned; the
    /// caller is responsible for dispatching them.
    ///
    /// # Panics
    ///
    /// Panics if the counter is already zero.
    pub fn decrement(&self, handle: CounterHandle) -> Vec<JobDecl> {
        self.with_counter(handle, |state| {
            state.count = state
                .count
                .checked_sub(1)
                .unwrap_or_else(|| panic!("attempt to decrement counter {handle:?} below zero"));
            if state.count == 0 {
                self.wait_lists
                    .lock()
                    .unwrap()
                    .remove(&handle)
                    .unwrap_or_default()
            } else {
                Vec::new()
            }
        })
    }

    /// Sorts `jobs` into ready and parked. Each job comes with the part of the
    /// count contributed by the job itself or by declarations submitted after
    /// it in the same batch; a job is ready when nothing else is outstanding on
    /// the counter. The rest are parked on the counter's wait-list, and the
    /// ready jobs are handed back in submission order.
    pub fn park_unless_zero(
        &self,
        handle: CounterHandle,
        jobs: Vec<(JobDecl, u32)>,
    ) -> Vec<JobDecl> {
        self.with_counter(handle, |state| {
            let mut ready = Vec::with_capacity(jobs.len());
            let mut parked = Vec::new();
            for (job, own) in jobs {
                if state.count <= own {
                    ready.push(job);
                } else {
                    parked.push(job);
                }
            }
            if !parked.is_empty() {
                trace!("parking {} job(s) on counter {}", parked.len(), handle.index);
                self.wait_lists
                    .lock()
                    .unwrap()
                    .entry(handle)
                    .or_default()
                    .extend(parked);
            }
            ready
        })
    }

    /// Single-job form of [`CounterTable::park_unless_zero`]. Returns the job
    /// if it is ready to run.
    pub fn park_one_unless_zero(
        &self,
        handle: CounterHandle,
        job: JobDecl,
        own: u32,
    ) -> Option<JobDecl> {
        self.with_counter(handle, |state| {
            if state.count <= own {
                return Some(job);
            }
            trace!("parking job on counter {}", handle.index);
            self.wait_lists
                .lock()
                .unwrap()
                .entry(handle)
                .or_default()
                .push(job);
            None
        })
    }

    /// The current count of the counter.
    pub fn count(&self, handle: CounterHandle) -> u32 {
        self.with_counter(handle, |state| state.count)
    }

    /// The number of jobs parked on the counter.
    pub fn parked(&self, handle: CounterHandle) -> usize {
        self.with_counter(handle, |_| {
            self.wait_lists
                .lock()
                .unwrap()
                .get(&handle)
                .map_or(0, Vec::len)
        })
    }
}
