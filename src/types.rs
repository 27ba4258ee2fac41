//! Log positions (`Lsn`) and logical timestamps (`Scn`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Byte offset in the logical log stream. `Lsn::ZERO` is the stream origin.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Block holding this position for a stream with `block_size` byte blocks.
    pub fn block_id(self, block_size: u64) -> u64 {
        self.0 / block_size
    }

    /// Offset of this position inside its block.
    pub fn block_offset(self, block_size: u64) -> u64 {
        self.0 % block_size
    }

    /// First position of `block_id`.
    pub fn block_start(block_id: u64, block_size: u64) -> Self {
        Lsn(block_id.saturating_mul(block_size))
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, rhs: u64) -> Lsn {
        Lsn(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl Sub<u64> for Lsn {
    type Output = Lsn;

    fn sub(self, rhs: u64) -> Lsn {
        Lsn(self.0.saturating_sub(rhs))
    }
}

/// Byte distance between two positions.
impl Sub<Lsn> for Lsn {
    type Output = u64;

    fn sub(self, rhs: Lsn) -> u64 {
        self.0.saturating_sub(rhs.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical timestamp attached to each entry, independent of its position.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Scn(pub u64);

impl Scn {
    pub const fn new(value: u64) -> Self {
        Scn(value)
    }

    pub const fn min_scn() -> Self {
        Scn(0)
    }

    pub const fn max_scn() -> Self {
        Scn(u64::MAX)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// `min_scn()` is reserved; entries always carry a valid SCN.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn plus(self, delta: u64) -> Self {
        Scn(self.0.saturating_add(delta))
    }

    pub fn minus(self, delta: u64) -> Self {
        Scn(self.0.saturating_sub(delta))
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            s if s == Scn::min_scn() => write!(f, "min_scn"),
            s if s == Scn::max_scn() => write!(f, "max_scn"),
            s => write!(f, "{}", s.0),
        }
    }
}
