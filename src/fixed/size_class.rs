//! Size classes served by the fixed-size pools.

/// Size classes for pool allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum SizeClass {
    Bytes16 = 16,
    Bytes32 = 32,
    Bytes64 = 64,
    Bytes128 = 128,
    Bytes256 = 256,
    Bytes512 = 512,
}

impl SizeClass {
    pub const COUNT: usize = 6;
    /// Largest request served by a pool.
    pub const MAX_OBJ_SIZE: usize = 512;

    /// All classes in increasing order; routing and ownership probes follow it.
    pub const ALL: [SizeClass; Self::COUNT] = [
        SizeClass::Bytes16,
        SizeClass::Bytes32,
        SizeClass::Bytes64,
        SizeClass::Bytes128,
        SizeClass::Bytes256,
        SizeClass::Bytes512,
    ];

    /// Select the smallest size class whose bound is at least `size`.
    pub fn from_size(size: usize) -> Option<Self> {
        if size > Self::MAX_OBJ_SIZE {
            return None;
        }
        Some(match size {
            0..=16 => SizeClass::Bytes16,
            17..=32 => SizeClass::Bytes32,
            33..=64 => SizeClass::Bytes64,
            65..=128 => SizeClass::Bytes128,
            129..=256 => SizeClass::Bytes256,
            _ => SizeClass::Bytes512,
        })
    }

    pub fn size(&self) -> usize {
        *self as usize
    }

    pub fn to_index(&self) -> usize {
        match self {
            SizeClass::Bytes16 => 0,
            SizeClass::Bytes32 => 1,
            SizeClass::Bytes64 => 2,
            SizeClass::Bytes128 => 3,
            SizeClass::Bytes256 => 4,
            SizeClass::Bytes512 => 5,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}
