//! Bit-field helpers for packed routing fields.
//!
//! Header payloads and destination masks are plain `u64` values with
//! documented bit ranges. Fields are read and written through explicit
//! accessors rather than slice assignment.

use std::fmt;

/// Number of bits needed to index `n` entries (at least 1).
///
/// `index_width(1) == 1`, `index_width(2) == 1`, `index_width(5) == 3`.
pub fn index_width(n: usize) -> u32 {
    if n <= 2 {
        1
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Mask with the low `width` bits set.
pub fn low_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Extract `width` bits starting at `offset`.
pub fn get_field(value: u64, offset: u32, width: u32) -> u64 {
    if offset >= 64 {
        return 0;
    }
    (value >> offset) & low_mask(width)
}

/// Replace `width` bits starting at `offset` with the low bits of `field`.
pub fn set_field(value: u64, offset: u32, width: u32, field: u64) -> u64 {
    if offset >= 64 {
        return value;
    }
    let mask = low_mask(width) << offset;
    (value & !mask) | ((field << offset) & mask)
}

/// Test a single bit.
pub fn bit(value: u64, index: u32) -> bool {
    index < 64 && (value >> index) & 1 == 1
}

/// Bit-mask over router ports (bit k = port k).
///
/// Used for destination masks, arbitration request columns and grant sets.
/// Port counts are limited to 64 by configuration validation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PortMask(u64);

impl PortMask {
    pub const EMPTY: PortMask = PortMask(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Mask with only `port` set.
    pub fn one_hot(port: usize) -> Self {
        debug_assert!(port < 64);
        Self(1u64 << port)
    }

    /// Mask with ports `0..n` set.
    pub fn first_n(n: usize) -> Self {
        Self(low_mask(n as u32))
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, port: usize) -> bool {
        port < 64 && bit(self.0, port as u32)
    }

    pub fn insert(&mut self, port: usize) {
        debug_assert!(port < 64);
        self.0 |= 1u64 << port;
    }

    pub fn remove(&mut self, port: usize) {
        if port < 64 {
            self.0 &= !(1u64 << port);
        }
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest set port, if any.
    pub fn lowest(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Index of the single set bit of a one-hot mask.
    ///
    /// Returns `None` for an empty mask or when more than one bit is set.
    pub fn one_hot_index(self) -> Option<usize> {
        if self.count() == 1 {
            self.lowest()
        } else {
            None
        }
    }

    pub fn intersects(self, other: PortMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Ports set in `self`, ascending.
    pub fn iter(self) -> PortIter {
        PortIter(self.0)
    }
}

impl std::ops::BitOr for PortMask {
    type Output = PortMask;
    fn bitor(self, rhs: PortMask) -> PortMask {
        PortMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PortMask {
    fn bitor_assign(&mut self, rhs: PortMask) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for PortMask {
    type Output = PortMask;
    fn bitand(self, rhs: PortMask) -> PortMask {
        PortMask(self.0 & rhs.0)
    }
}

impl fmt::Debug for PortMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortMask({:#b})", self.0)
    }
}

impl fmt::Display for PortMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (n, port) in self.iter().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", port)?;
        }
        write!(f, "}}")
    }
}

/// Iterator over the set ports of a [`PortMask`].
pub struct PortIter(u64);

impl Iterator for PortIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let idx = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(idx)
    }
}

impl FromIterator<usize> for PortMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = PortMask::EMPTY;
        for port in iter {
            mask.insert(port);
        }
        mask
    }
}
