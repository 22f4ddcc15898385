//! Per-CPU slabs.
//!
//! Every CPU owns one bounded LIFO stack per size class. All CPUs' slots
//! share a single array: CPU `c`'s region starts at `c * stride`, and
//! class `cl` occupies `[begin(cl), begin(cl) + max_capacity(cl))` inside
//! it. A class's state is a [`Header`] packed into one `u64`:
//!
//! ```text
//!  63        48 47       32 31       16 15        0
//! +------------+-----------+-----------+-----------+
//! |   unused   |   begin   |    end    |  current  |
//! +------------+-----------+-----------+-----------+
//! ```
//!
//! `[begin, current)` holds free objects and `[current, end)` is spare
//! capacity. Indices are relative to the CPU's region, so they fit in 16
//! bits.
//!
//! Mutations run inside a restartable section bound to the executing CPU
//! (see [`slab`]). A section ends with exactly one header store.

mod slab;

pub use slab::PerCpuSlab;

/// Unpacked slab header. Indices are slot offsets within a CPU region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub current: u16,
    pub end: u16,
    pub begin: u16,
}

impl Header {
    /// An empty, zero-capacity class starting at `begin`.
    #[must_use]
    pub const fn empty_at(begin: u16) -> Self {
        Self {
            current: begin,
            end: begin,
            begin,
        }
    }

    #[must_use]
    pub const fn pack(self) -> u64 {
        self.current as u64 | (self.end as u64) << 16 | (self.begin as u64) << 32
    }

    #[must_use]
    pub const fn unpack(word: u64) -> Self {
        Self {
            current: word as u16,
            end: (word >> 16) as u16,
            begin: (word >> 32) as u16,
        }
    }

    /// Objects currently cached.
    #[must_use]
    pub const fn len(self) -> usize {
        (self.current - self.begin) as usize
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.current == self.begin
    }

    /// Current capacity.
    #[must_use]
    pub const fn capacity(self) -> usize {
        (self.end - self.begin) as usize
    }

    /// Unused capacity above `current`.
    #[must_use]
    pub const fn spare(self) -> usize {
        (self.end - self.current) as usize
    }

    /// `begin <= current <= end`.
    #[must_use]
    pub const fn is_consistent(self) -> bool {
        self.begin <= self.current && self.current <= self.end
    }
}
