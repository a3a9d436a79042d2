//! Barrier-guarded single-producer / multi-consumer handoff.
//!
//! A [`GroupComm`] is shared by the members of one inner thread group. The
//! chief produces a value (the address of a freshly acquired panel), publishes
//! it, and every member picks it up after the publication barrier. Retiring the
//! value takes a second barrier so the chief only releases it once no member
//! can still be reading through it.
//!
//! Every member of the group must call [`GroupComm::handoff`],
//! [`GroupComm::barrier`] and [`GroupComm::retire`] the same number of times
//! in the same order, including members whose work range is empty.
//!
//! A member that unwinds out of its work never reaches the next barrier. The
//! group is then aborted: every pending and future [`GroupComm::barrier`]
//! returns `false` at once, and only the retire barrier still waits for the
//! whole group.

use std::sync::Barrier;

use parking_lot::{Condvar, Mutex};

use crate::partition::ThreadInfo;

struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// A reusable barrier that can be torn down while members wait on it.
pub struct AbortableBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl AbortableBarrier {
    pub fn new(parties: usize) -> Self {
        AbortableBarrier {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Blocks until all parties arrive. Returns `false` if the barrier was
    /// aborted before this generation completed.
    #[must_use]
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.aborted {
            return false;
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return true;
        }

        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            self.cvar.wait(&mut state);
        }
        state.generation != generation
    }

    /// Releases every waiter and makes later waits return immediately.
    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.cvar.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}

pub struct GroupComm<V> {
    sync: AbortableBarrier,
    retire: Barrier,
    slot: Mutex<Option<V>>,
}

impl<V: Clone> GroupComm<V> {
    /// A communicator for a group of `n_way` members.
    pub fn new(n_way: usize) -> Self {
        GroupComm {
            sync: AbortableBarrier::new(n_way),
            retire: Barrier::new(n_way.max(1)),
            slot: Mutex::new(None),
        }
    }

    /// Returns `false` once the group has been aborted.
    #[must_use]
    pub fn barrier(&self) -> bool {
        self.sync.wait()
    }

    pub fn abort(&self) {
        self.sync.abort();
    }

    pub fn publish(&self, value: Option<V>) {
        *self.slot.lock() = value;
    }

    pub fn read_published(&self) -> Option<V> {
        self.slot.lock().clone()
    }

    /// Chief runs `produce` and publishes its result; all members return the
    /// published value once the publication barrier has been passed.
    pub fn handoff(&self, info: &ThreadInfo, produce: impl FnOnce() -> Option<V>) -> Option<V> {
        if info.am_chief() {
            self.publish(produce());
        }
        if !self.barrier() {
            return None;
        }
        self.read_published()
    }

    /// Waits for every member to finish with the published value, then lets
    /// the chief take it out of the slot and hand it to `release`.
    ///
    /// Waits for the full group even after an abort.
    pub fn retire(&self, info: &ThreadInfo, release: impl FnOnce(V)) {
        self.retire.wait();
        if info.am_chief() {
            if let Some(value) = self.slot.lock().take() {
                release(value);
            }
        }
    }
}
