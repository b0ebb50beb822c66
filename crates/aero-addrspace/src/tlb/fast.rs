use bitflags::bitflags;

use super::{page_of, PageSize, PageTags, TranslationCache};
use crate::phys::BlockId;

const SLOTS: usize = 1024;

bitflags! {
    /// No execute bit: legacy paging has no execute-disable, so fetches check read rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Rights: u8 {
        const SUPERVISOR_READ = 1 << 0;
        const SUPERVISOR_WRITE = 1 << 1;
        const USER_READ = 1 << 2;
        const USER_WRITE = 1 << 3;
    }
}

impl Rights {
    #[inline]
    fn for_access(supervisor: bool, write: bool) -> Self {
        match (supervisor, write) {
            (true, false) => Rights::SUPERVISOR_READ,
            (true, true) => Rights::SUPERVISOR_WRITE,
            (false, false) => Rights::USER_READ,
            (false, true) => Rights::USER_WRITE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    page: u32,
    block: BlockId,
    rights: Rights,
}

impl Entry {
    /// Page numbers are below 2^20, so this never matches a lookup.
    const EMPTY: Entry = Entry {
        page: u32::MAX,
        block: BlockId::UNCONNECTED,
        rights: Rights::empty(),
    };
}

/// Direct-mapped TLB: 1024 slots indexed by the low ten bits of the page number, one combined
/// rights mask per slot. A colliding page evicts the previous occupant.
#[derive(Debug)]
pub struct FastTlb {
    entries: Box<[Entry; SLOTS]>,
    tags: PageTags,
}

impl Default for FastTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl FastTlb {
    pub fn new() -> Self {
        Self {
            entries: Box::new([Entry::EMPTY; SLOTS]),
            tags: PageTags::default(),
        }
    }

    #[inline]
    fn slot(page: u32) -> usize {
        page as usize & (SLOTS - 1)
    }

    #[inline]
    fn clear_page(&mut self, page: u32) {
        let entry = &mut self.entries[Self::slot(page)];
        if entry.page == page {
            *entry = Entry::EMPTY;
        }
    }
}

impl TranslationCache for FastTlb {
    #[inline]
    fn get_block(&self, supervisor: bool, addr: u32, write: bool) -> Option<BlockId> {
        let page = page_of(addr);
        let entry = &self.entries[Self::slot(page)];
        (entry.page == page && entry.rights.contains(Rights::for_access(supervisor, write)))
            .then_some(entry.block)
    }

    fn set_block(
        &mut self,
        supervisor: bool,
        addr: u32,
        write: bool,
        block: BlockId,
        size: PageSize,
        global: bool,
    ) {
        let page = page_of(addr);
        let rights = Rights::for_access(supervisor, write);
        let entry = &mut self.entries[Self::slot(page)];
        if entry.page == page && entry.block == block {
            entry.rights |= rights;
        } else {
            *entry = Entry { page, block, rights };
        }
        self.tags.record(page, size, global);
    }

    fn page_size(&self, addr: u32) -> PageSize {
        self.tags.size_of(page_of(addr))
    }

    fn invalidate(&mut self, addr: u32) {
        for page in self.tags.invalidation_span(page_of(addr)) {
            self.clear_page(page);
        }
    }

    fn flush(&mut self) {
        self.entries.fill(Entry::EMPTY);
        self.tags.clear();
    }

    fn flush_non_global(&mut self) {
        if !self.tags.global_enabled() {
            self.flush();
            return;
        }
        for page in self.tags.take_non_global() {
            self.clear_page(page);
        }
    }

    fn set_global_pages_enabled(&mut self, enabled: bool) {
        self.tags.set_global_enabled(enabled);
    }

    fn global_pages_enabled(&self) -> bool {
        self.tags.global_enabled()
    }

    fn non_global_pages(&self) -> Vec<u32> {
        self.tags.non_global_sorted()
    }

    fn restore_non_global_pages(&mut self, pages: &[u32]) {
        self.tags.restore_non_global(pages);
    }
}
