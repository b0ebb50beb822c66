use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Instruction streams decoded into units.
    pub decoded: u64,
    /// Bounded decodes that ran past their block and were handed back as spanning.
    pub spanning: u64,
    /// Decodes served by an already compiled unit.
    pub cache_hits: u64,
    pub queued: u64,
    pub compiled: u64,
    /// Promotions the background compiler could not handle.
    pub failed: u64,
}

/// Counters shared by the decode path and the promotion worker.
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub decoded: AtomicU64,
    pub spanning: AtomicU64,
    pub cache_hits: AtomicU64,
    pub queued: AtomicU64,
    pub compiled: AtomicU64,
    pub failed: AtomicU64,
}

impl PipelineCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            decoded: self.decoded.load(Ordering::Relaxed),
            spanning: self.spanning.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            compiled: self.compiled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
