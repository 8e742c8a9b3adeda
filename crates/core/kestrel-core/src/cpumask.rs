//! Processor sets.
//!
//! [`ProcessorMask`] is a fixed-width bit set over processor indices. It is
//! used for scheduler ownership, the online set, and thread affinities.

use core::fmt;

use crate::id::CpuId;

/// Maximum number of processors a mask can describe.
pub const MAX_PROCESSORS: usize = 64;

/// Bit of `cpu`, zero for indices a mask cannot describe.
const fn bit(cpu: CpuId) -> u64 {
    if cpu.as_usize() < MAX_PROCESSORS {
        1u64 << cpu.as_u32()
    } else {
        0
    }
}

/// A set of processors, one bit per processor index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ProcessorMask(u64);

impl ProcessorMask {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// All processors with an index below `count`.
    pub const fn all(count: usize) -> Self {
        if count >= MAX_PROCESSORS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// A set containing only `cpu`. Empty if `cpu` is beyond
    /// [`MAX_PROCESSORS`].
    pub const fn single(cpu: CpuId) -> Self {
        Self(bit(cpu))
    }

    /// Builds a mask from raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Adds `cpu` to the set. Indices beyond [`MAX_PROCESSORS`] are
    /// ignored.
    pub fn set(&mut self, cpu: CpuId) {
        self.0 |= bit(cpu);
    }

    /// Removes `cpu` from the set.
    pub fn clear(&mut self, cpu: CpuId) {
        self.0 &= !bit(cpu);
    }

    /// Returns `true` if `cpu` is a member.
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & bit(cpu) != 0
    }

    /// Returns `true` if every member of `self` is also in `other`.
    pub const fn is_subset(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Returns `true` if no processor is a member.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the sets share at least one processor.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Number of members.
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest-numbered member, if any.
    pub const fn first(self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(CpuId::new(self.0.trailing_zeros()))
        }
    }

    /// Intersection.
    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Union.
    #[must_use]
    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterates the members in ascending index order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let index = bits.trailing_zeros();
            bits &= bits - 1;
            Some(CpuId::new(index))
        })
    }
}

impl fmt::Debug for ProcessorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(CpuId::as_u32)).finish()
    }
}
