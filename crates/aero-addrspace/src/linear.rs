use std::io::{Read, Write};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::block::Fetched;
use crate::code::{CodeBlock, GuestMode, Processor};
use crate::error::{ExecError, PageFault};
use crate::phys::{BlockId, PhysicalAddressSpace};
use crate::snapshot::{self, ReadLeExt, SnapshotError, WriteLeExt};
use crate::space::{run_unit, AddressSpace};
use crate::spanning::SpanningUnit;
use crate::tlb::{FastTlb, PageSize, TranslationCache, PAGES_PER_LARGE_PAGE};
use crate::{BLOCK_MASK, BLOCK_SHIFT, BLOCK_SIZE};

bitflags! {
    /// Bits shared by legacy 32-bit page-directory and page-table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageEntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Directory entry maps a 4MiB page (only honoured with PSE enabled).
        const LARGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

const ENTRY_ADDR_MASK: u32 = 0xffff_f000;
const LARGE_PAGE_MASK: u32 = 0xffc0_0000;

const STATE_MAGIC: [u8; 4] = *b"ALIN";
const STATE_VERSION: u16 = 1;

const STATE_PAGING: u8 = 1 << 0;
const STATE_PSE: u8 = 1 << 1;
const STATE_GLOBAL: u8 = 1 << 2;
const STATE_WRITE_PROTECT: u8 = 1 << 3;
const STATE_SUPERVISOR: u8 = 1 << 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationStats {
    pub hits: u64,
    pub misses: u64,
    pub walks: u64,
    pub faults: u64,
}

/// Linear (paged) view of a [`PhysicalAddressSpace`] using legacy 32-bit paging.
///
/// Every access consults the translation cache first; on a miss the guest's page directory and
/// table are read as ordinary physical doublewords, permissions are checked, accessed/dirty bits
/// are written back and the result is cached.
#[derive(Debug)]
pub struct LinearAddressSpace<T: TranslationCache = FastTlb> {
    phys: PhysicalAddressSpace,
    tlb: T,
    paging: bool,
    pse: bool,
    global_pages: bool,
    write_protect: bool,
    supervisor: bool,
    pdbr: u32,
    seen_epoch: u64,
    stats: TranslationStats,
}

impl LinearAddressSpace<FastTlb> {
    pub fn new(phys: PhysicalAddressSpace) -> Self {
        Self::with_tlb(phys, FastTlb::new())
    }
}

impl<T: TranslationCache> LinearAddressSpace<T> {
    pub fn with_tlb(phys: PhysicalAddressSpace, mut tlb: T) -> Self {
        tlb.flush();
        tlb.set_global_pages_enabled(false);
        let seen_epoch = phys.mapping_epoch();
        Self {
            phys,
            tlb,
            paging: false,
            pse: false,
            global_pages: false,
            write_protect: false,
            supervisor: true,
            pdbr: 0,
            seen_epoch,
            stats: TranslationStats::default(),
        }
    }

    pub fn physical(&self) -> &PhysicalAddressSpace {
        &self.phys
    }

    pub fn physical_mut(&mut self) -> &mut PhysicalAddressSpace {
        &mut self.phys
    }

    pub fn into_physical(self) -> PhysicalAddressSpace {
        self.phys
    }

    pub fn tlb(&self) -> &T {
        &self.tlb
    }

    pub fn stats(&self) -> TranslationStats {
        self.stats
    }

    pub fn is_supervisor(&self) -> bool {
        self.supervisor
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging
    }

    pub fn page_size_extensions_enabled(&self) -> bool {
        self.pse
    }

    pub fn global_pages_enabled(&self) -> bool {
        self.global_pages
    }

    pub fn write_protect_user_pages(&self) -> bool {
        self.write_protect
    }

    pub fn page_directory_base_address(&self) -> u32 {
        self.pdbr
    }

    /// Translations are cached per privilege level, so switching does not flush.
    pub fn set_supervisor(&mut self, supervisor: bool) {
        self.supervisor = supervisor;
    }

    pub fn set_paging_enabled(&mut self, enabled: bool) {
        debug!(enabled, "paging");
        self.paging = enabled;
        self.tlb.flush();
    }

    pub fn set_page_size_extensions_enabled(&mut self, enabled: bool) {
        debug!(enabled, "page size extensions");
        self.pse = enabled;
        self.tlb.flush();
    }

    pub fn set_global_pages_enabled(&mut self, enabled: bool) {
        debug!(enabled, "global pages");
        self.global_pages = enabled;
        self.tlb.set_global_pages_enabled(enabled);
        self.tlb.flush();
    }

    /// When enabled, supervisor writes fault on read-only pages and on pages reachable from
    /// user mode.
    pub fn set_write_protect_user_pages(&mut self, enabled: bool) {
        debug!(enabled, "write-protect user pages");
        self.write_protect = enabled;
        self.tlb.flush();
    }

    /// Load a new page directory (task switch). Global translations survive.
    pub fn set_page_directory_base_address(&mut self, addr: u32) {
        self.pdbr = addr & ENTRY_ADDR_MASK;
        trace!(pdbr = format_args!("{:#010x}", self.pdbr), "page directory base");
        self.tlb.flush_non_global();
    }

    /// Drop cached translations for the page containing `addr` (`INVLPG`).
    pub fn invalidate_page(&mut self, addr: u32) {
        self.tlb.invalidate(addr);
    }

    pub fn flush(&mut self) {
        self.tlb.flush();
    }

    #[inline]
    fn sync_epoch(&mut self) {
        let epoch = self.phys.mapping_epoch();
        if epoch != self.seen_epoch {
            trace!("physical mappings changed; flushing translations");
            self.seen_epoch = epoch;
            self.tlb.flush();
        }
    }

    /// Block backing `addr` for an access in the current privilege level.
    #[inline]
    pub fn resolve(&mut self, addr: u32, write: bool) -> Result<BlockId, PageFault> {
        if !self.paging {
            return Ok(self.phys.block_id(addr));
        }
        self.sync_epoch();
        if let Some(id) = self.tlb.get_block(self.supervisor, addr, write) {
            self.stats.hits += 1;
            return Ok(id);
        }
        self.stats.misses += 1;
        match self.walk(addr, write) {
            Ok(id) => Ok(id),
            Err(fault) => {
                self.stats.faults += 1;
                trace!(%fault, "translation fault");
                Err(fault)
            }
        }
    }

    /// Cached translation for `addr`, without walking.
    fn lookup(&mut self, addr: u32) -> Option<BlockId> {
        if !self.paging {
            return Some(self.phys.block_id(addr));
        }
        self.sync_epoch();
        self.tlb.get_block(self.supervisor, addr, false)
    }

    fn check_access(
        &self,
        addr: u32,
        write: bool,
        user_page: bool,
        writable: bool,
    ) -> Result<(), PageFault> {
        if !self.supervisor {
            if !user_page || (write && !writable) {
                return Err(PageFault::protection(addr, write, true));
            }
        } else if write && self.write_protect && (!writable || user_page) {
            return Err(PageFault::protection(addr, true, false));
        }
        Ok(())
    }

    /// Set accessed (and, for writes, dirty) in the entry at `entry_addr` if missing.
    fn mark_entry(&mut self, entry_addr: u32, raw: u32, dirty: bool) -> Result<(), PageFault> {
        let mut updated = raw | PageEntryFlags::ACCESSED.bits();
        if dirty {
            updated |= PageEntryFlags::DIRTY.bits();
        }
        if updated != raw {
            self.phys.write_u32(entry_addr, updated)?;
        }
        Ok(())
    }

    fn walk(&mut self, addr: u32, write: bool) -> Result<BlockId, PageFault> {
        self.stats.walks += 1;
        let user = !self.supervisor;

        let pde_addr = self.pdbr | ((addr >> 22) << 2);
        let pde_raw = self.phys.read_u32(pde_addr)?;
        let pde = PageEntryFlags::from_bits_truncate(pde_raw);
        if !pde.contains(PageEntryFlags::PRESENT) {
            return Err(PageFault::not_present(addr, write, user));
        }

        if self.pse && pde.contains(PageEntryFlags::LARGE) {
            self.check_access(
                addr,
                write,
                pde.contains(PageEntryFlags::USER),
                pde.contains(PageEntryFlags::WRITABLE),
            )?;
            self.mark_entry(pde_addr, pde_raw, write)?;
            return Ok(self.install_large(addr, write, pde_raw & LARGE_PAGE_MASK, pde));
        }

        let pte_addr = (pde_raw & ENTRY_ADDR_MASK) | (((addr >> BLOCK_SHIFT) & 0x3ff) << 2);
        let pte_raw = self.phys.read_u32(pte_addr)?;
        let pte = PageEntryFlags::from_bits_truncate(pte_raw);
        if !pte.contains(PageEntryFlags::PRESENT) {
            return Err(PageFault::not_present(addr, write, user));
        }

        let effective = pde & pte;
        self.check_access(
            addr,
            write,
            effective.contains(PageEntryFlags::USER),
            effective.contains(PageEntryFlags::WRITABLE),
        )?;
        self.mark_entry(pde_addr, pde_raw, false)?;
        self.mark_entry(pte_addr, pte_raw, write)?;

        if self.tlb.page_size(addr) == PageSize::Size4M {
            self.tlb.invalidate(addr);
        }
        let id = self.phys.block_id(pte_raw & ENTRY_ADDR_MASK);
        self.tlb.set_block(
            self.supervisor,
            addr,
            write,
            id,
            PageSize::Size4K,
            pte.contains(PageEntryFlags::GLOBAL),
        );
        trace!(
            addr = format_args!("{addr:#010x}"),
            phys = format_args!("{:#010x}", pte_raw & ENTRY_ADDR_MASK),
            write,
            "4KiB translation"
        );
        Ok(id)
    }

    /// Install every 4KiB slot of the large page containing `addr`.
    fn install_large(&mut self, addr: u32, write: bool, base: u32, pde: PageEntryFlags) -> BlockId {
        let region = addr & LARGE_PAGE_MASK;
        if self.tlb.page_size(addr) != PageSize::Size4M {
            for i in 0..PAGES_PER_LARGE_PAGE {
                self.tlb.invalidate(region | (i << BLOCK_SHIFT));
            }
        }
        let global = pde.contains(PageEntryFlags::GLOBAL);
        for i in 0..PAGES_PER_LARGE_PAGE {
            let id = self.phys.block_id(base | (i << BLOCK_SHIFT));
            self.tlb.set_block(
                self.supervisor,
                region | (i << BLOCK_SHIFT),
                write,
                id,
                PageSize::Size4M,
                global,
            );
        }
        trace!(
            addr = format_args!("{region:#010x}"),
            phys = format_args!("{base:#010x}"),
            write,
            "4MiB translation"
        );
        self.phys.block_id(base | (addr & !LARGE_PAGE_MASK))
    }

    #[inline]
    fn read_split<const N: usize>(&mut self, addr: u32) -> Result<[u8; N], PageFault> {
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.read_u8(addr.wrapping_add(i as u32))?;
        }
        Ok(out)
    }

    /// Page-straddling write: both pages are validated before any byte lands.
    fn write_split(&mut self, addr: u32, bytes: &[u8]) -> Result<(), PageFault> {
        let last = addr.wrapping_add(bytes.len() as u32 - 1);
        let first_id = self.resolve(addr, true)?;
        let last_id = self.resolve(last, true)?;
        for (i, byte) in bytes.iter().copied().enumerate() {
            let a = addr.wrapping_add(i as u32);
            let id = if (a ^ addr) >> BLOCK_SHIFT == 0 {
                first_id
            } else {
                last_id
            };
            self.phys
                .block_mut(id)
                .write_u8((a & BLOCK_MASK) as usize, byte);
        }
        Ok(())
    }

    /// Serialize paging flags, the directory base and the non-global page set.
    pub fn save_state<W: Write>(&self, w: &mut W) -> snapshot::Result<()> {
        let mut flags = 0;
        for (set, bit) in [
            (self.paging, STATE_PAGING),
            (self.pse, STATE_PSE),
            (self.global_pages, STATE_GLOBAL),
            (self.write_protect, STATE_WRITE_PROTECT),
            (self.supervisor, STATE_SUPERVISOR),
        ] {
            if set {
                flags |= bit;
            }
        }

        w.write_bytes(&STATE_MAGIC)?;
        w.write_u16_le(STATE_VERSION)?;
        w.write_u8(flags)?;
        w.write_u32_le(self.pdbr)?;
        let pages = self.tlb.non_global_pages();
        w.write_u32_le(pages.len() as u32)?;
        for page in pages {
            w.write_u32_le(page)?;
        }
        Ok(())
    }

    /// Restore state written by [`LinearAddressSpace::save_state`]. Translations are rebuilt
    /// lazily.
    pub fn load_state<R: Read>(&mut self, r: &mut R) -> snapshot::Result<()> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != STATE_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if version != STATE_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let flags = r.read_u8()?;
        if flags & !0x1f != 0 {
            return Err(SnapshotError::Corrupt("unknown paging flags"));
        }
        let pdbr = r.read_u32_le()?;
        if pdbr & !ENTRY_ADDR_MASK != 0 {
            return Err(SnapshotError::Corrupt("misaligned page directory base"));
        }
        let count = r.read_u32_le()?;
        let mut pages = Vec::new();
        for _ in 0..count {
            pages.push(r.read_u32_le()?);
        }

        self.paging = flags & STATE_PAGING != 0;
        self.pse = flags & STATE_PSE != 0;
        self.global_pages = flags & STATE_GLOBAL != 0;
        self.write_protect = flags & STATE_WRITE_PROTECT != 0;
        self.supervisor = flags & STATE_SUPERVISOR != 0;
        self.pdbr = pdbr;

        self.tlb.flush();
        self.tlb.set_global_pages_enabled(self.global_pages);
        self.tlb.restore_non_global_pages(&pages);
        self.seen_epoch = self.phys.mapping_epoch();
        Ok(())
    }
}

impl<T: TranslationCache> AddressSpace for LinearAddressSpace<T> {
    #[inline]
    fn read_u8(&mut self, addr: u32) -> Result<u8, PageFault> {
        let id = self.resolve(addr, false)?;
        Ok(self.phys.block_mut(id).read_u8((addr & BLOCK_MASK) as usize))
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, PageFault> {
        let offset = (addr & BLOCK_MASK) as usize;
        if offset > BLOCK_SIZE - 2 {
            return Ok(u16::from_le_bytes(self.read_split(addr)?));
        }
        let id = self.resolve(addr, false)?;
        Ok(self.phys.block_mut(id).read_u16(offset))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, PageFault> {
        let offset = (addr & BLOCK_MASK) as usize;
        if offset > BLOCK_SIZE - 4 {
            return Ok(u32::from_le_bytes(self.read_split(addr)?));
        }
        let id = self.resolve(addr, false)?;
        Ok(self.phys.block_mut(id).read_u32(offset))
    }

    fn read_u64(&mut self, addr: u32) -> Result<u64, PageFault> {
        let offset = (addr & BLOCK_MASK) as usize;
        if offset > BLOCK_SIZE - 8 {
            return Ok(u64::from_le_bytes(self.read_split(addr)?));
        }
        let id = self.resolve(addr, false)?;
        Ok(self.phys.block_mut(id).read_u64(offset))
    }

    #[inline]
    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), PageFault> {
        let id = self.resolve(addr, true)?;
        self.phys
            .block_mut(id)
            .write_u8((addr & BLOCK_MASK) as usize, value);
        Ok(())
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), PageFault> {
        let offset = (addr & BLOCK_MASK) as usize;
        if offset > BLOCK_SIZE - 2 {
            return self.write_split(addr, &value.to_le_bytes());
        }
        let id = self.resolve(addr, true)?;
        self.phys.block_mut(id).write_u16(offset, value);
        Ok(())
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), PageFault> {
        let offset = (addr & BLOCK_MASK) as usize;
        if offset > BLOCK_SIZE - 4 {
            return self.write_split(addr, &value.to_le_bytes());
        }
        let id = self.resolve(addr, true)?;
        self.phys.block_mut(id).write_u32(offset, value);
        Ok(())
    }

    fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), PageFault> {
        let offset = (addr & BLOCK_MASK) as usize;
        if offset > BLOCK_SIZE - 8 {
            return self.write_split(addr, &value.to_le_bytes());
        }
        let id = self.resolve(addr, true)?;
        self.phys.block_mut(id).write_u64(offset, value);
        Ok(())
    }

    fn read_bytes(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < dst.len() {
            let a = addr.wrapping_add(done as u32);
            let offset = (a & BLOCK_MASK) as usize;
            let chunk = (BLOCK_SIZE - offset).min(dst.len() - done);
            let id = self.resolve(a, false)?;
            self.phys
                .block_mut(id)
                .read_bytes(offset, &mut dst[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn write_bytes(&mut self, addr: u32, src: &[u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < src.len() {
            let a = addr.wrapping_add(done as u32);
            let offset = (a & BLOCK_MASK) as usize;
            let chunk = (BLOCK_SIZE - offset).min(src.len() - done);
            let id = self.resolve(a, true)?;
            self.phys
                .block_mut(id)
                .write_bytes(offset, &src[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn execute(
        &mut self,
        mode: GuestMode,
        cpu: &mut dyn Processor,
        addr: u32,
    ) -> Result<u32, ExecError> {
        let source = self
            .phys
            .code_source()
            .cloned()
            .ok_or(ExecError::NoCodeSource)?;
        // Fetch is a read: any readable page is executable without NX.
        let id = self.resolve(addr, false)?;
        match self.phys.fetch_in(id, mode, addr, &*source)? {
            Fetched::Unit(unit) => run_unit(self, cpu, mode, addr, unit, true),
            Fetched::Spanning => SpanningUnit::new(mode, addr).execute(cpu, self, &*source),
        }
    }

    fn replace_unit(
        &mut self,
        mode: GuestMode,
        addr: u32,
        old: &Arc<CodeBlock>,
        new: Arc<CodeBlock>,
    ) {
        if let Some(id) = self.lookup(addr) {
            self.phys
                .block_mut(id)
                .replace_unit(mode, (addr & BLOCK_MASK) as usize, old, new);
        }
    }

    fn mark_span_tail(&mut self, mode: GuestMode, addr: u32, len: usize) {
        if let Some(id) = self.lookup(addr) {
            self.phys.block_mut(id).mark_span_tail(mode, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlb::SlowTlb;

    const PD: u32 = 0x1000;
    const PT: u32 = 0x2000;

    const P: u32 = PageEntryFlags::PRESENT.bits();
    const W: u32 = PageEntryFlags::WRITABLE.bits();
    const U: u32 = PageEntryFlags::USER.bits();
    const G: u32 = PageEntryFlags::GLOBAL.bits();
    const PS: u32 = PageEntryFlags::LARGE.bits();

    fn phys() -> PhysicalAddressSpace {
        let mut phys = PhysicalAddressSpace::new(0x10_0000);
        phys.allocate(0, 0x10_0000).unwrap();
        phys
    }

    fn set_pde<T: TranslationCache>(space: &mut LinearAddressSpace<T>, index: u32, value: u32) {
        space
            .physical_mut()
            .write_u32(PD + index * 4, value)
            .unwrap();
    }

    fn set_pte<T: TranslationCache>(space: &mut LinearAddressSpace<T>, index: u32, value: u32) {
        space
            .physical_mut()
            .write_u32(PT + index * 4, value)
            .unwrap();
    }

    fn pte<T: TranslationCache>(space: &mut LinearAddressSpace<T>, index: u32) -> u32 {
        space.physical_mut().read_u32(PT + index * 4).unwrap()
    }

    /// Linear page 0x3000 -> physical 0x8000 with `flags`; PDE 0 -> PT with `pde_flags`.
    fn paged<T: TranslationCache>(tlb: T, pde_flags: u32, flags: u32) -> LinearAddressSpace<T> {
        let mut space = LinearAddressSpace::with_tlb(phys(), tlb);
        set_pde(&mut space, 0, PT | pde_flags);
        set_pte(&mut space, 3, 0x8000 | flags);
        space.set_page_directory_base_address(PD);
        space.set_paging_enabled(true);
        space
    }

    #[test]
    fn identity_when_paging_disabled() {
        let mut space = LinearAddressSpace::new(phys());
        space.write_u32(0x3000, 0x1234_5678).unwrap();
        assert_eq!(space.physical_mut().read_u32(0x3000).unwrap(), 0x1234_5678);
        assert_eq!(space.stats().walks, 0);
    }

    #[test]
    fn translation_sets_accessed_and_dirty() {
        let mut space = paged(FastTlb::new(), P | W | U, P | W | U);
        space.physical_mut().write_u32(0x8010, 0xfeed).unwrap();

        assert_eq!(space.read_u32(0x3010).unwrap(), 0xfeed);
        let pde = space.physical_mut().read_u32(PD).unwrap();
        assert_ne!(pde & PageEntryFlags::ACCESSED.bits(), 0);
        assert_eq!(pte(&mut space, 3) & PageEntryFlags::DIRTY.bits(), 0);
        assert_ne!(pte(&mut space, 3) & PageEntryFlags::ACCESSED.bits(), 0);

        space.write_u8(0x3000, 1).unwrap();
        assert_ne!(pte(&mut space, 3) & PageEntryFlags::DIRTY.bits(), 0);
        assert_eq!(space.physical_mut().read_u8(0x8000).unwrap(), 1);
    }

    #[test]
    fn repeated_resolution_hits_the_cache() {
        let mut space = paged(SlowTlb::new(), P | W, P | W);
        let first = space.resolve(0x3004, false).unwrap();
        let second = space.resolve(0x3ffc, false).unwrap();
        assert_eq!(first, second);
        let stats = space.stats();
        assert_eq!(stats.walks, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn not_present_codes_follow_privilege_and_direction() {
        let mut space = paged(FastTlb::new(), P | W | U, 0);
        assert_eq!(space.read_u8(0x3000).unwrap_err().error_code, 0x0);
        assert_eq!(space.write_u8(0x3000, 0).unwrap_err().error_code, 0x2);
        space.set_supervisor(false);
        assert_eq!(space.read_u8(0x3000).unwrap_err().error_code, 0x4);
        assert_eq!(space.write_u8(0x3000, 0).unwrap_err().error_code, 0x6);

        let fault = space.read_u8(0x0040_0000).unwrap_err();
        assert_eq!(fault.addr, 0x0040_0000);
        assert!(!fault.is_present());
        assert_eq!(space.stats().faults, 5);
    }

    #[test]
    fn user_access_to_supervisor_page_faults() {
        let mut space = paged(FastTlb::new(), P | W | U, P | W);
        space.set_supervisor(false);
        assert_eq!(space.read_u8(0x3000).unwrap_err().error_code, 0x5);
        assert_eq!(space.write_u8(0x3000, 0).unwrap_err().error_code, 0x7);
    }

    #[test]
    fn user_write_to_read_only_page_faults() {
        let mut space = paged(FastTlb::new(), P | U, P | W | U);
        space.set_supervisor(false);
        assert!(space.read_u8(0x3000).is_ok());
        assert_eq!(space.write_u8(0x3000, 0).unwrap_err().error_code, 0x7);
    }

    #[test]
    fn supervisor_write_protection_is_opt_in() {
        let mut space = paged(FastTlb::new(), P, P);
        space.write_u8(0x3000, 0xaa).unwrap();

        space.set_write_protect_user_pages(true);
        let fault = space.write_u8(0x3000, 0xbb).unwrap_err();
        assert_eq!(fault.error_code, 0x3);
        assert_eq!(space.physical_mut().read_u8(0x8000).unwrap(), 0xaa);
        assert!(space.read_u8(0x3000).is_ok());
    }

    #[test]
    fn stale_translation_survives_until_invalidated() {
        let mut space = paged(FastTlb::new(), P | W, P | W);
        space.physical_mut().write_u8(0x8000, 0x11).unwrap();
        space.physical_mut().write_u8(0x9000, 0x22).unwrap();
        assert_eq!(space.read_u8(0x3000).unwrap(), 0x11);

        set_pte(&mut space, 3, 0x9000 | P | W);
        assert_eq!(space.read_u8(0x3000).unwrap(), 0x11);

        space.invalidate_page(0x3000);
        assert_eq!(space.read_u8(0x3000).unwrap(), 0x22);
    }

    #[test]
    fn large_page_installs_whole_region() {
        let mut space = LinearAddressSpace::new(phys());
        set_pde(&mut space, 2, P | W | PS);
        space.set_page_directory_base_address(PD);
        space.set_page_size_extensions_enabled(true);
        space.set_paging_enabled(true);

        space.physical_mut().write_u32(0x5678, 0xabcd).unwrap();
        assert_eq!(space.read_u32(0x0080_5678).unwrap(), 0xabcd);
        assert_eq!(space.read_u8(0x0080_9000).unwrap(), 0);
        assert_eq!(space.stats().walks, 1);
        assert_eq!(space.tlb().page_size(0x0080_0000), PageSize::Size4M);

        let pde = space.physical_mut().read_u32(PD + 8).unwrap();
        assert_ne!(pde & PageEntryFlags::ACCESSED.bits(), 0);
    }

    #[test]
    fn large_bit_is_ignored_without_pse() {
        let mut space = LinearAddressSpace::new(phys());
        set_pde(&mut space, 0, PT | P | W | PS);
        set_pte(&mut space, 3, 0x8000 | P | W);
        space.set_page_directory_base_address(PD);
        space.set_paging_enabled(true);

        space.physical_mut().write_u8(0x8001, 0x42).unwrap();
        assert_eq!(space.read_u8(0x3001).unwrap(), 0x42);
        assert_eq!(space.tlb().page_size(0x3000), PageSize::Size4K);
    }

    #[test]
    fn directory_switch_keeps_only_global_translations() {
        let mut space = paged(FastTlb::new(), P | W, P | W | G);
        set_pte(&mut space, 4, 0x9000 | P | W);
        space.set_global_pages_enabled(true);

        space.read_u8(0x3000).unwrap();
        space.read_u8(0x4000).unwrap();
        assert_eq!(space.stats().walks, 2);

        space.set_page_directory_base_address(PD);
        space.read_u8(0x3000).unwrap();
        assert_eq!(space.stats().walks, 2);
        space.read_u8(0x4000).unwrap();
        assert_eq!(space.stats().walks, 3);

        space.flush();
        space.read_u8(0x3000).unwrap();
        assert_eq!(space.stats().walks, 4);
    }

    #[test]
    fn physical_remap_flushes_translations() {
        let mut space = paged(FastTlb::new(), P | W, P | W);
        space.physical_mut().write_u8(0x8000, 1).unwrap();
        assert_eq!(space.read_u8(0x3000).unwrap(), 1);

        space.physical_mut().allocate(0x8000, 0x1000).unwrap();
        assert_eq!(space.read_u8(0x3000).unwrap(), 0);
    }

    #[test]
    fn page_straddling_write_checks_both_pages_first() {
        let mut space = paged(FastTlb::new(), P | W, P | W);
        set_pte(&mut space, 4, 0x9000 | P);
        space.set_write_protect_user_pages(true);

        let fault = space.write_u32(0x3ffe, 0xffff_ffff).unwrap_err();
        assert_eq!(fault.addr, 0x4001);
        assert_eq!(space.physical_mut().read_u16(0x8ffe).unwrap(), 0);
    }

    #[test]
    fn state_round_trips_flags_and_non_global_pages() {
        let mut space = paged(FastTlb::new(), P | W, P | W);
        space.set_page_size_extensions_enabled(true);
        space.set_write_protect_user_pages(true);
        space.read_u8(0x3000).unwrap();

        let mut bytes = Vec::new();
        space.save_state(&mut bytes).unwrap();

        let mut restored = LinearAddressSpace::new(phys());
        restored.load_state(&mut bytes.as_slice()).unwrap();
        assert!(restored.paging_enabled());
        assert!(restored.page_size_extensions_enabled());
        assert!(restored.write_protect_user_pages());
        assert!(!restored.global_pages_enabled());
        assert!(restored.is_supervisor());
        assert_eq!(restored.page_directory_base_address(), PD);
        assert_eq!(restored.tlb().non_global_pages(), vec![3]);
    }
}
