use aero_addrspace::{
    AddressSpace, FastTlb, LinearAddressSpace, PageEntryFlags, PageFault, PhysicalAddressSpace,
    SlowTlb, TranslationCache,
};

const PD: u32 = 0x1000;
const PT: u32 = 0x3000;
const FRAME: u32 = 0x9000;

fn flags(f: PageEntryFlags) -> u32 {
    f.bits()
}

/// Linear page 0x2000 backed by `FRAME`, everything present, user and writable.
fn user_page_space<T: TranslationCache>(tlb: T) -> LinearAddressSpace<T> {
    let rwu = flags(PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE | PageEntryFlags::USER);
    let mut phys = PhysicalAddressSpace::new(0x10_0000);
    phys.allocate(0, 0x10_0000).unwrap();
    phys.write_u32(PD, PT | rwu).unwrap();
    phys.write_u32(PT + 2 * 4, FRAME | rwu).unwrap();

    let mut space = LinearAddressSpace::with_tlb(phys, tlb);
    space.set_page_directory_base_address(PD);
    space.set_paging_enabled(true);
    space
}

fn supervisor_write_protection<T: TranslationCache>(tlb: T) {
    let mut space = user_page_space(tlb);

    space.write_u32(0x2010, 0x1122_3344).unwrap();
    assert_eq!(
        space.physical_mut().read_u32(FRAME + 0x10).unwrap(),
        0x1122_3344
    );
    assert!(space.tlb().get_block(true, 0x2000, true).is_some());
    let walks = space.stats().walks;

    space.set_write_protect_user_pages(true);
    space.invalidate_page(0x2000);
    let fault = space.write_u32(0x2010, 0).unwrap_err();
    assert_eq!(fault, PageFault::protection(0x2010, true, false));
    assert_eq!(fault.error_code, 0x3);
    assert_eq!(space.stats().walks, walks + 1);
    assert_eq!(
        space.physical_mut().read_u32(FRAME + 0x10).unwrap(),
        0x1122_3344
    );

    // User-mode writes are unaffected by the supervisor protection bit.
    space.set_supervisor(false);
    space.write_u32(0x2010, 0x5566_7788).unwrap();
}

#[test]
fn supervisor_write_protection_fast() {
    supervisor_write_protection(FastTlb::new());
}

#[test]
fn supervisor_write_protection_slow() {
    supervisor_write_protection(SlowTlb::new());
}

#[test]
fn privilege_switch_keeps_translations_per_level() {
    let mut space = user_page_space(FastTlb::new());
    space.read_u8(0x2000).unwrap();
    space.set_supervisor(false);
    space.read_u8(0x2000).unwrap();
    space.set_supervisor(true);
    space.read_u8(0x2000).unwrap();
    assert_eq!(space.stats().walks, 2);
}

#[test]
fn colliding_pages_thrash_only_the_direct_mapped_strategy() {
    let rw = flags(PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE);
    let build = |space: &mut PhysicalAddressSpace| {
        space.write_u32(PD + 4, (PT + 0x1000) | rw).unwrap();
        space.write_u32(PT + 0x1000 + 2 * 4, 0xa000 | rw).unwrap();
    };

    let mut fast = user_page_space(FastTlb::new());
    build(fast.physical_mut());
    let mut slow = user_page_space(SlowTlb::new());
    build(slow.physical_mut());

    for _ in 0..3 {
        for addr in [0x2000u32, 0x0040_2000] {
            fast.read_u8(addr).unwrap();
            slow.read_u8(addr).unwrap();
        }
    }
    assert_eq!(fast.stats().walks, 6);
    assert_eq!(slow.stats().walks, 2);
}

#[test]
fn a20_toggle_is_seen_through_paging() {
    let rw = flags(PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE);
    let mut phys = PhysicalAddressSpace::new(0x20_0000);
    phys.allocate(0, 0x20_0000).unwrap();
    phys.write_u32(PD, PT | rw).unwrap();
    phys.write_u32(PT, 0x0010_5000 | rw).unwrap();
    phys.write_u8(0x5000, 0x11).unwrap();
    phys.write_u8(0x0010_5000, 0x22).unwrap();

    let mut space = LinearAddressSpace::new(phys);
    space.set_page_directory_base_address(PD);
    space.set_paging_enabled(true);
    assert_eq!(space.read_u8(0).unwrap(), 0x22);

    space.physical_mut().set_gate_a20(false);
    assert_eq!(space.read_u8(0).unwrap(), 0x11);
}

#[cfg(not(target_arch = "wasm32"))]
mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn repeated_resolution_never_rewalks(
            pages in proptest::collection::vec(0u32..256, 1..64),
            offset in 0u32..0x1000,
        ) {
            let rw = flags(PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE);
            let mut phys = PhysicalAddressSpace::new(0x20_0000);
            phys.allocate(0, 0x20_0000).unwrap();
            phys.write_u32(PD, PT | rw).unwrap();
            for page in 0..256u32 {
                phys.write_u32(PT + page * 4, (0x10_0000 + (page << 12)) | rw).unwrap();
            }
            let mut space = LinearAddressSpace::with_tlb(phys, SlowTlb::new());
            space.set_page_directory_base_address(PD);
            space.set_paging_enabled(true);

            for page in pages {
                let addr = (page << 12) | offset;
                let first = space.resolve(addr, false).unwrap();
                let walks = space.stats().walks;
                let second = space.resolve(addr, false).unwrap();
                prop_assert_eq!(first, second);
                prop_assert_eq!(space.stats().walks, walks);
                prop_assert_eq!(first, space.physical().block_id(0x10_0000 + (page << 12)));
            }
        }
    }
}
