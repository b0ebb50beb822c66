use super::{page_of, PageSize, PageTags, TranslationCache};
use crate::phys::BlockId;
use crate::BLOCK_COUNT;

const INNER_SHIFT: u32 = 10;
const INNER: usize = 1 << INNER_SHIFT;
const OUTER: usize = BLOCK_COUNT / INNER;

/// Exact per-page map for one (privilege, direction) pair.
#[derive(Debug)]
struct PageMap {
    tables: Vec<Option<Box<[Option<BlockId>]>>>,
}

impl PageMap {
    fn new() -> Self {
        Self {
            tables: (0..OUTER).map(|_| None).collect(),
        }
    }

    #[inline]
    fn get(&self, page: u32) -> Option<BlockId> {
        self.tables[(page >> INNER_SHIFT) as usize].as_ref()?[page as usize & (INNER - 1)]
    }

    fn set(&mut self, page: u32, block: BlockId) {
        let table = self.tables[(page >> INNER_SHIFT) as usize]
            .get_or_insert_with(|| vec![None; INNER].into_boxed_slice());
        table[page as usize & (INNER - 1)] = Some(block);
    }

    fn clear(&mut self, page: u32) {
        if let Some(table) = self.tables[(page >> INNER_SHIFT) as usize].as_mut() {
            table[page as usize & (INNER - 1)] = None;
        }
    }
}

/// Collision-free TLB: one sparse two-level map per privilege and direction, each allocated on
/// first use.
#[derive(Debug, Default)]
pub struct SlowTlb {
    maps: [Option<Box<PageMap>>; 4],
    tags: PageTags,
}

impl SlowTlb {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn key(supervisor: bool, write: bool) -> usize {
        (usize::from(supervisor) << 1) | usize::from(write)
    }

    fn clear_page(&mut self, page: u32) {
        for map in self.maps.iter_mut().flatten() {
            map.clear(page);
        }
    }
}

impl TranslationCache for SlowTlb {
    #[inline]
    fn get_block(&self, supervisor: bool, addr: u32, write: bool) -> Option<BlockId> {
        self.maps[Self::key(supervisor, write)]
            .as_ref()?
            .get(page_of(addr))
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
        self.maps[Self::key(supervisor, write)]
            .get_or_insert_with(|| Box::new(PageMap::new()))
            .set(page, block);
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
        self.maps = Default::default();
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
