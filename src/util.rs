//! Queue placement.

use core::cell::Cell;
use core::hash::BuildHasher;
use core::hash::Hasher;
use std::hash::RandomState;

/// Picks worker queues for a single producer thread.
///
/// Backed by an [xorshift*] generator, which tolerates weak seeding as long as
/// the state is never zero. Every producer thread owns one, so placement never
/// contends on shared state.
///
/// [xorshift*]: https://en.wikipedia.org/wiki/Xorshift#xorshift*
pub struct QueuePicker {
    state: Cell<u64>,
}

impl QueuePicker {
    /// Seeds a picker from the process's random hasher keys, mixed with the
    /// address of the picker's own state.
    pub fn new() -> QueuePicker {
        let picker = QueuePicker {
            state: Cell::new(0),
        };
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_usize(picker.state.as_ptr() as usize);
        picker.state.set(hasher.finish() | 1);
        picker
    }

    #[cfg(test)]
    pub fn with_state(state: u64) -> QueuePicker {
        assert_ne!(state, 0, "a zero state never advances");
        QueuePicker {
            state: Cell::new(state),
        }
    }

    fn advance(&self) -> u64 {
        let mut state = self.state.get();
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        self.state.set(state);
        state.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Picks an index in `0..queues`, by multiply-shift rather than modulo.
    pub fn pick(&self, queues: usize) -> usize {
        debug_assert_ne!(queues, 0);
        ((u128::from(self.advance()) * queues as u128) >> 64) as usize
    }
}
