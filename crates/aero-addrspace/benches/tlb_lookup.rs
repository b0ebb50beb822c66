#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use aero_addrspace::{
    AddressSpace, FastTlb, LinearAddressSpace, PageEntryFlags, PhysicalAddressSpace, SlowTlb,
    TranslationCache,
};
#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("AERO_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

/// Identity-maps the first 4MiB through one page table at 0x2000.
#[cfg(not(target_arch = "wasm32"))]
fn paged_space<T: TranslationCache>(tlb: T) -> LinearAddressSpace<T> {
    const PD: u32 = 0x1000;
    const PT: u32 = 0x2000;
    let flags = (PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE | PageEntryFlags::USER).bits();

    let mut phys = PhysicalAddressSpace::new(0x40_0000);
    phys.allocate(0, 0x40_0000).unwrap();
    phys.write_u32(PD, PT | flags).unwrap();
    for i in 0..1024u32 {
        phys.write_u32(PT + i * 4, (i << 12) | flags).unwrap();
    }

    let mut space = LinearAddressSpace::with_tlb(phys, tlb);
    space.set_page_directory_base_address(PD);
    space.set_paging_enabled(true);
    space
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_strategy<T: TranslationCache>(c: &mut Criterion, name: &str, tlb: T) {
    let mut space = paged_space(tlb);

    // Populate the TLB once via page walks.
    for page in 0..64u32 {
        black_box(space.read_u32(page << 12).unwrap());
    }

    let mut group = c.benchmark_group("tlb_lookup");
    group.throughput(Throughput::Elements(1));
    group.bench_function(format!("{name}_hit_4k_read"), |b| {
        b.iter(|| black_box(space.read_u32(black_box(0x5234)).unwrap()))
    });
    group.bench_function(format!("{name}_hit_4k_sweep"), |b| {
        let mut page = 0u32;
        b.iter(|| {
            page = (page + 1) & 63;
            black_box(space.read_u8(black_box(page << 12)).unwrap())
        })
    });
    group.bench_function(format!("{name}_miss_4k_walk"), |b| {
        b.iter(|| {
            space.invalidate_page(0x7000);
            black_box(space.read_u8(black_box(0x7000)).unwrap())
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_tlb_lookup(c: &mut Criterion) {
    bench_strategy(c, "fast", FastTlb::new());
    bench_strategy(c, "slow", SlowTlb::new());
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_tlb_lookup
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
