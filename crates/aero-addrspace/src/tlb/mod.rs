//! Software TLB: linear page to backing block, keyed by privilege and access direction.

mod fast;
mod slow;

use std::collections::HashSet;
use std::fmt;

use crate::phys::BlockId;
use crate::BLOCK_SHIFT;

pub use fast::FastTlb;
pub use slow::SlowTlb;

const LARGE_PAGE_SHIFT: u32 = 22;
pub(crate) const PAGES_PER_LARGE_PAGE: u32 = 1 << (LARGE_PAGE_SHIFT - BLOCK_SHIFT);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size4M,
}

/// Translation cache contract shared by every strategy.
///
/// Entries map a linear page to the [`BlockId`] backing it. Supervisor and user translations are
/// distinct, as are read and write ones: a write entry exists only after a walk validated the
/// write. Instruction fetches use read entries.
pub trait TranslationCache: fmt::Debug {
    fn get_block(&self, supervisor: bool, addr: u32, write: bool) -> Option<BlockId>;

    fn set_block(
        &mut self,
        supervisor: bool,
        addr: u32,
        write: bool,
        block: BlockId,
        size: PageSize,
        global: bool,
    );

    /// `Size4M` while any translation in the 4MiB region containing `addr` may have come from a
    /// large page, until the region is invalidated or the cache flushed.
    fn page_size(&self, addr: u32) -> PageSize;

    /// Drop every translation for the page containing `addr`, or for the whole 4MiB page if it
    /// was installed as one.
    fn invalidate(&mut self, addr: u32);

    fn flush(&mut self);

    /// Drop every translation not installed as global. Without global-page support this is
    /// [`TranslationCache::flush`].
    fn flush_non_global(&mut self);

    fn set_global_pages_enabled(&mut self, enabled: bool);

    fn global_pages_enabled(&self) -> bool;

    /// Page numbers (`addr >> 12`) holding non-global translations, ascending.
    fn non_global_pages(&self) -> Vec<u32>;

    fn restore_non_global_pages(&mut self, pages: &[u32]);
}

/// Page-size tags and global tracking shared by both strategies.
#[derive(Debug, Default)]
pub(crate) struct PageTags {
    /// 4MiB regions (`addr >> 22`) whose translations were installed from a large page.
    large: HashSet<u32>,
    non_global: HashSet<u32>,
    global_enabled: bool,
}

impl PageTags {
    #[inline]
    pub(crate) fn record(&mut self, page: u32, size: PageSize, global: bool) {
        // A 4K entry leaves the tag alone: large entries may still sit in the region's other
        // slots, and only a region-wide invalidation drops them all.
        if size == PageSize::Size4M {
            self.large.insert(page / PAGES_PER_LARGE_PAGE);
        }
        if !(global && self.global_enabled) {
            self.non_global.insert(page);
        }
    }

    #[inline]
    pub(crate) fn size_of(&self, page: u32) -> PageSize {
        if self.large.contains(&(page / PAGES_PER_LARGE_PAGE)) {
            PageSize::Size4M
        } else {
            PageSize::Size4K
        }
    }

    /// Pages an invalidation of `page` must clear.
    pub(crate) fn invalidation_span(&mut self, page: u32) -> std::ops::Range<u32> {
        let region = page / PAGES_PER_LARGE_PAGE;
        let span = if self.large.remove(&region) {
            let first = region * PAGES_PER_LARGE_PAGE;
            first..first + PAGES_PER_LARGE_PAGE
        } else {
            page..page + 1
        };
        for p in span.clone() {
            self.non_global.remove(&p);
        }
        span
    }

    pub(crate) fn clear(&mut self) {
        self.large.clear();
        self.non_global.clear();
    }

    /// Large tags are kept; global large entries of the region survive the partial flush.
    pub(crate) fn take_non_global(&mut self) -> Vec<u32> {
        self.non_global.drain().collect()
    }

    pub(crate) fn global_enabled(&self) -> bool {
        self.global_enabled
    }

    pub(crate) fn set_global_enabled(&mut self, enabled: bool) {
        self.global_enabled = enabled;
    }

    pub(crate) fn non_global_sorted(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.non_global.iter().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub(crate) fn restore_non_global(&mut self, pages: &[u32]) {
        self.non_global = pages.iter().copied().collect();
    }
}

#[inline]
pub(crate) fn page_of(addr: u32) -> u32 {
    addr >> BLOCK_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::UnconnectedBlock;
    use crate::phys::PhysicalAddressSpace;

    /// Two distinct live block ids.
    fn ids() -> (BlockId, BlockId) {
        let mut phys = PhysicalAddressSpace::new(0x2000);
        let a = phys.map(0, Box::new(UnconnectedBlock)).unwrap();
        let b = phys.map(0x1000, Box::new(UnconnectedBlock)).unwrap();
        (a, b)
    }

    fn keys_are_separate<T: TranslationCache>(mut tlb: T) {
        let (a, _) = ids();
        tlb.set_block(true, 0x1234, false, a, PageSize::Size4K, false);
        assert_eq!(tlb.get_block(true, 0x1000, false), Some(a));
        assert_eq!(tlb.get_block(true, 0x1fff, false), Some(a));
        assert_eq!(tlb.get_block(true, 0x1000, true), None);
        assert_eq!(tlb.get_block(false, 0x1000, false), None);
        assert_eq!(tlb.get_block(true, 0x2000, false), None);

        tlb.set_block(false, 0x1000, true, a, PageSize::Size4K, false);
        assert_eq!(tlb.get_block(false, 0x1000, true), Some(a));
        assert_eq!(tlb.get_block(true, 0x1000, false), Some(a));
    }

    fn invalidate_drops_every_key<T: TranslationCache>(mut tlb: T) {
        let (a, b) = ids();
        for (sup, write) in [(true, false), (true, true), (false, false), (false, true)] {
            tlb.set_block(sup, 0x5000, write, a, PageSize::Size4K, false);
        }
        tlb.set_block(true, 0x6000, false, b, PageSize::Size4K, false);

        tlb.invalidate(0x5abc);
        for (sup, write) in [(true, false), (true, true), (false, false), (false, true)] {
            assert_eq!(tlb.get_block(sup, 0x5000, write), None);
        }
        assert_eq!(tlb.get_block(true, 0x6000, false), Some(b));
    }

    fn large_page_invalidation_clears_region<T: TranslationCache>(mut tlb: T) {
        let (a, _) = ids();
        for i in 0..PAGES_PER_LARGE_PAGE {
            tlb.set_block(true, 0x0040_0000 + (i << 12), false, a, PageSize::Size4M, false);
        }
        assert_eq!(tlb.page_size(0x0040_0000), PageSize::Size4M);
        assert_eq!(tlb.page_size(0x0080_0000), PageSize::Size4K);

        tlb.invalidate(0x0055_5555);
        assert_eq!(tlb.get_block(true, 0x0040_0000, false), None);
        assert_eq!(tlb.get_block(true, 0x007f_f000, false), None);
        assert_eq!(tlb.page_size(0x0040_0000), PageSize::Size4K);
    }

    fn mixed_region_invalidation_still_clears_large_entries<T: TranslationCache>(mut tlb: T) {
        let (a, b) = ids();
        for i in 0..PAGES_PER_LARGE_PAGE {
            tlb.set_block(true, 0x0040_0000 + (i << 12), false, a, PageSize::Size4M, false);
        }
        tlb.set_block(false, 0x0040_3000, false, b, PageSize::Size4K, false);
        assert_eq!(tlb.page_size(0x0040_0000), PageSize::Size4M);

        tlb.invalidate(0x0070_0000);
        assert_eq!(tlb.get_block(true, 0x0040_0000, false), None);
        assert_eq!(tlb.get_block(true, 0x0050_0000, false), None);
        assert_eq!(tlb.get_block(false, 0x0040_3000, false), None);
        assert_eq!(tlb.page_size(0x0040_0000), PageSize::Size4K);
    }

    fn global_large_page_survives_partial_flush<T: TranslationCache>(mut tlb: T) {
        let (a, b) = ids();
        tlb.set_global_pages_enabled(true);
        for i in 0..PAGES_PER_LARGE_PAGE {
            tlb.set_block(true, 0x0040_0000 + (i << 12), false, a, PageSize::Size4M, true);
        }
        tlb.set_block(false, 0x0040_3000, false, b, PageSize::Size4K, false);

        tlb.flush_non_global();
        assert_eq!(tlb.get_block(true, 0x0060_0000, false), Some(a));
        assert_eq!(tlb.page_size(0x0060_0000), PageSize::Size4M);

        tlb.invalidate(0x0040_1000);
        assert_eq!(tlb.get_block(true, 0x0060_0000, false), None);
    }

    fn global_pages_survive_partial_flush<T: TranslationCache>(mut tlb: T) {
        let (a, b) = ids();
        tlb.set_global_pages_enabled(true);
        tlb.set_block(true, 0xc000_0000, false, a, PageSize::Size4K, true);
        tlb.set_block(true, 0x0000_3000, false, b, PageSize::Size4K, false);
        assert_eq!(tlb.non_global_pages(), vec![3]);

        tlb.flush_non_global();
        assert_eq!(tlb.get_block(true, 0xc000_0000, false), Some(a));
        assert_eq!(tlb.get_block(true, 0x0000_3000, false), None);
        assert!(tlb.non_global_pages().is_empty());

        tlb.flush();
        assert_eq!(tlb.get_block(true, 0xc000_0000, false), None);
    }

    fn partial_flush_without_global_support_drops_everything<T: TranslationCache>(mut tlb: T) {
        let (a, _) = ids();
        tlb.set_block(true, 0xc000_0000, false, a, PageSize::Size4K, true);
        tlb.flush_non_global();
        assert_eq!(tlb.get_block(true, 0xc000_0000, false), None);
    }

    fn non_global_set_restores<T: TranslationCache>(mut tlb: T) {
        tlb.restore_non_global_pages(&[9, 2, 5]);
        assert_eq!(tlb.non_global_pages(), vec![2, 5, 9]);
    }

    macro_rules! strategy_tests {
        ($name:ident, $ctor:expr) => {
            mod $name {
                use super::*;

                #[test]
                fn keys_are_separate() {
                    super::keys_are_separate($ctor);
                }

                #[test]
                fn invalidate_drops_every_key() {
                    super::invalidate_drops_every_key($ctor);
                }

                #[test]
                fn large_page_invalidation_clears_region() {
                    super::large_page_invalidation_clears_region($ctor);
                }

                #[test]
                fn mixed_region_invalidation_still_clears_large_entries() {
                    super::mixed_region_invalidation_still_clears_large_entries($ctor);
                }

                #[test]
                fn global_large_page_survives_partial_flush() {
                    super::global_large_page_survives_partial_flush($ctor);
                }

                #[test]
                fn global_pages_survive_partial_flush() {
                    super::global_pages_survive_partial_flush($ctor);
                }

                #[test]
                fn partial_flush_without_global_support_drops_everything() {
                    super::partial_flush_without_global_support_drops_everything($ctor);
                }

                #[test]
                fn non_global_set_restores() {
                    super::non_global_set_restores($ctor);
                }
            }
        };
    }

    strategy_tests!(fast, FastTlb::new());
    strategy_tests!(slow, SlowTlb::new());

    #[test]
    fn fast_strategy_evicts_on_slot_collision() {
        let (a, b) = ids();
        let mut tlb = FastTlb::new();
        tlb.set_block(true, 0x0000_1000, false, a, PageSize::Size4K, false);
        tlb.set_block(true, 0x0040_1000, false, b, PageSize::Size4K, false);
        assert_eq!(tlb.get_block(true, 0x0000_1000, false), None);
        assert_eq!(tlb.get_block(true, 0x0040_1000, false), Some(b));
    }

    #[test]
    fn slow_strategy_keeps_colliding_pages() {
        let (a, b) = ids();
        let mut tlb = SlowTlb::new();
        tlb.set_block(true, 0x0000_1000, false, a, PageSize::Size4K, false);
        tlb.set_block(true, 0x0040_1000, false, b, PageSize::Size4K, false);
        assert_eq!(tlb.get_block(true, 0x0000_1000, false), Some(a));
        assert_eq!(tlb.get_block(true, 0x0040_1000, false), Some(b));
    }
}
