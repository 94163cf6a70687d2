use vmm_addresses::{PageSize, Size1G, Size2M, Size4K, VirtualAddress};

/// Paging level, top (L4, PML4) to bottom (L1, PT).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Page table; entries map 4 KiB.
    L1 = 1,
    /// Page directory; entries map 2 MiB or point to a PT.
    L2 = 2,
    /// Page-directory-pointer table; entries map 1 GiB or point to a PD.
    L3 = 3,
    /// PML4; entries always point to a PDPT.
    L4 = 4,
}

impl Level {
    /// Root level of a 4-level walk.
    pub const TOP: Self = Self::L4;

    /// Lowest address bit that indexes this level.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * (self as u32 - 1)
    }

    /// Bytes covered by one entry of this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// Slot selected by `addr` in a table of this level.
    #[inline]
    #[must_use]
    pub const fn index_of(self, addr: VirtualAddress) -> usize {
        addr.table_index(self.shift())
    }

    /// Next level down, `None` below L1.
    #[inline]
    #[must_use]
    pub const fn lower(self) -> Option<Self> {
        match self {
            Self::L4 => Some(Self::L3),
            Self::L3 => Some(Self::L2),
            Self::L2 => Some(Self::L1),
            Self::L1 => None,
        }
    }

    /// Whether a `PS=1` leaf may live at this level.
    #[inline]
    #[must_use]
    pub const fn allows_large_leaf(self) -> bool {
        matches!(self, Self::L2 | Self::L3)
    }
}

/// Leaf granularities, tied to the level that holds their entries.
pub trait LeafSize: PageSize {
    const LEVEL: Level;
}

impl LeafSize for Size4K {
    const LEVEL: Level = Level::L1;
}

impl LeafSize for Size2M {
    const LEVEL: Level = Level::L2;
}

impl LeafSize for Size1G {
    const LEVEL: Level = Level::L3;
}
