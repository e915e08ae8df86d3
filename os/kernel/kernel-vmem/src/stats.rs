use kernel_memory_addresses::TableLevel;

/// Page-table usage counters of one address space.
///
/// `pdpt`, `pd` and `pt` count tables currently linked into the tree;
/// `frames` counts live 4 KiB leaf mappings.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageTableStats {
    pub pdpt: usize,
    pub pd: usize,
    pub pt: usize,
    pub frames: usize,
}

impl PageTableStats {
    pub(crate) const fn table_linked(&mut self, level: TableLevel) {
        match level {
            TableLevel::Pdpt => self.pdpt += 1,
            TableLevel::Pd => self.pd += 1,
            TableLevel::Pt => self.pt += 1,
            TableLevel::Pml4 => {}
        }
    }

    pub(crate) const fn table_unlinked(&mut self, level: TableLevel) {
        match level {
            TableLevel::Pdpt => self.pdpt = self.pdpt.saturating_sub(1),
            TableLevel::Pd => self.pd = self.pd.saturating_sub(1),
            TableLevel::Pt => self.pt = self.pt.saturating_sub(1),
            TableLevel::Pml4 => {}
        }
    }

    pub(crate) const fn leaf_mapped(&mut self) {
        self.frames += 1;
    }

    /// Tables adopted from a loader are not counted, hence saturating.
    pub(crate) const fn leaf_unmapped(&mut self) {
        self.frames = self.frames.saturating_sub(1);
    }

    /// Total table frames below the root.
    #[must_use]
    pub const fn tables(&self) -> usize {
        self.pdpt + self.pd + self.pt
    }
}
