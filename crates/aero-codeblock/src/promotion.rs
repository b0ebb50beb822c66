//! Background promotion of hot interpreted units.
//!
//! Every unit leaving the pipeline is wrapped in a [`PromotionBody`] that counts executions.
//! Each time the count reaches a multiple of the threshold the wrapper offers itself to the
//! bounded [`PromotionQueue`]. The [`Promoter`] (normally on a [`PromotionWorker`] thread) pops
//! the hottest entry, compiles it and publishes the result through the wrapper's write-once
//! target. The next execution of the wrapper sees the target and asks its caller to swap it in.
//!
//! State per wrapper: interpreted -> queued -> compiled | failed. Entries dropped from the queue
//! go back to interpreted.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aero_addrspace::{
    AddressSpace, CodeBlock, Completion, ExecError, Executable, Processor, Tier,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::compiler::{CompiledBlockCache, Compiler, MicrocodeCompiler};
use crate::decoder::InstructionStream;
use crate::stats::PipelineCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PromotionState {
    Interpreted = 0,
    Queued = 1,
    Compiled = 2,
    Failed = 3,
}

impl PromotionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Queued,
            2 => Self::Compiled,
            3 => Self::Failed,
            _ => Self::Interpreted,
        }
    }
}

/// Shared record for one wrapped unit.
#[derive(Debug)]
pub struct Promotion {
    interpreted: Arc<CodeBlock>,
    stream: InstructionStream,
    executions: AtomicU32,
    state: AtomicU8,
    /// Written once by the promoter; readers never lock.
    target: OnceLock<Arc<CodeBlock>>,
}

impl Promotion {
    pub fn new(stream: InstructionStream, interpreted: Arc<CodeBlock>) -> Self {
        Self {
            interpreted,
            stream,
            executions: AtomicU32::new(0),
            state: AtomicU8::new(PromotionState::Interpreted as u8),
            target: OnceLock::new(),
        }
    }

    pub fn state(&self) -> PromotionState {
        PromotionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> Option<&Arc<CodeBlock>> {
        self.target.get()
    }

    fn set_state(&self, state: PromotionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(
                PromotionState::Interpreted as u8,
                PromotionState::Queued as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

/// Executable body of a promotable unit.
#[derive(Debug)]
pub struct PromotionBody {
    promotion: Arc<Promotion>,
    queue: Arc<PromotionQueue>,
    threshold: u32,
}

impl PromotionBody {
    pub fn new(promotion: Arc<Promotion>, queue: Arc<PromotionQueue>, threshold: u32) -> Self {
        debug_assert!(threshold > 0);
        Self {
            promotion,
            queue,
            threshold: threshold.max(1),
        }
    }

    /// Wrap `interpreted` into a promotable unit with the same shape.
    pub fn wrap(
        stream: InstructionStream,
        interpreted: Arc<CodeBlock>,
        queue: Arc<PromotionQueue>,
        threshold: u32,
    ) -> Arc<CodeBlock> {
        let (mode, start, length, count, exit) = (
            interpreted.mode(),
            interpreted.start(),
            interpreted.x86_length(),
            interpreted.x86_count(),
            interpreted.exit(),
        );
        let promotion = Arc::new(Promotion::new(stream, interpreted));
        Arc::new(CodeBlock::new(
            mode,
            start,
            length,
            count,
            exit,
            Box::new(Self::new(promotion, queue, threshold)),
        ))
    }
}

impl Executable for PromotionBody {
    fn execute(
        &self,
        cpu: &mut dyn Processor,
        mem: &mut dyn AddressSpace,
    ) -> Result<Completion, ExecError> {
        if let Some(target) = self.promotion.target() {
            return Ok(Completion::NeedsReplacement(Arc::clone(target)));
        }

        let count = self
            .promotion
            .executions
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        if count % self.threshold == 0 && self.promotion.state() == PromotionState::Interpreted {
            self.queue.offer(&self.promotion);
        }
        self.promotion.interpreted.execute(cpu, mem)
    }

    fn tier(&self) -> Tier {
        Tier::Promotable
    }

    fn promoted(&self) -> Option<Arc<CodeBlock>> {
        self.promotion.target().cloned()
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    promotion: Arc<Promotion>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
    next_seq: u64,
}

/// Bounded set of wrappers waiting for the background compiler, hottest first.
#[derive(Debug)]
pub struct PromotionQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    counters: Arc<PipelineCounters>,
}

impl PromotionQueue {
    pub(crate) fn new(capacity: usize, counters: Arc<PipelineCounters>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            counters,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Try to enqueue `promotion`. Never waits: a contended queue simply declines, and the
    /// wrapper offers itself again at the next threshold multiple.
    pub fn offer(&self, promotion: &Arc<Promotion>) -> bool {
        let Some(mut inner) = self.inner.try_lock() else {
            return false;
        };
        if !promotion.claim() {
            return false;
        }

        if inner.entries.len() >= self.capacity {
            let coldest = inner
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.promotion.executions(), std::cmp::Reverse(e.seq)))
                .map(|(i, e)| (i, e.promotion.executions()));
            match coldest {
                Some((idx, count)) if count < promotion.executions() => {
                    let evicted = inner.entries.swap_remove(idx);
                    evicted.promotion.set_state(PromotionState::Interpreted);
                    trace!(count, "promotion evicted for hotter unit");
                }
                _ => {
                    promotion.set_state(PromotionState::Interpreted);
                    return false;
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push(Entry {
            seq,
            promotion: Arc::clone(promotion),
        });
        PipelineCounters::bump(&self.counters.queued);
        true
    }

    /// Remove the hottest entry (earliest on ties), then drop entries that have fallen under
    /// half its count.
    pub fn pop(&self) -> Option<Arc<Promotion>> {
        let mut inner = self.inner.lock();
        let idx = inner
            .entries
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| (e.promotion.executions(), std::cmp::Reverse(e.seq)))
            .map(|(i, _)| i)?;
        let popped = inner.entries.remove(idx).promotion;

        let floor = popped.executions() / 2;
        inner.entries.retain(|e| {
            let keep = e.promotion.executions() >= floor;
            if !keep {
                e.promotion.set_state(PromotionState::Interpreted);
                trace!(
                    count = e.promotion.executions(),
                    floor,
                    "stale promotion dropped"
                );
            }
            keep
        });
        Some(popped)
    }
}

/// Compiles queued units and publishes the results.
#[derive(Debug)]
pub struct Promoter {
    queue: Arc<PromotionQueue>,
    compiler: MicrocodeCompiler,
    cache: Arc<CompiledBlockCache>,
    counters: Arc<PipelineCounters>,
}

impl Promoter {
    pub(crate) fn new(
        queue: Arc<PromotionQueue>,
        cache: Arc<CompiledBlockCache>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            queue,
            compiler: MicrocodeCompiler::new(),
            cache,
            counters,
        }
    }

    pub fn queue(&self) -> &Arc<PromotionQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &CompiledBlockCache {
        &self.cache
    }

    /// Promote the hottest queued unit. Returns `false` when the queue was empty.
    pub fn run_once(&self) -> bool {
        let Some(promotion) = self.queue.pop() else {
            return false;
        };
        let start = promotion.stream.start();
        match self.compiler.compile(&promotion.stream) {
            Some(unit) => {
                self.cache.insert(&promotion.stream, Arc::clone(&unit));
                // Only the promoter writes the target, and each wrapper is queued at most once
                // at a time.
                let _ = promotion.target.set(unit);
                promotion.set_state(PromotionState::Compiled);
                PipelineCounters::bump(&self.counters.compiled);
                debug!(
                    start = format_args!("{start:#010x}"),
                    executions = promotion.executions(),
                    "unit promoted"
                );
            }
            None => {
                promotion.set_state(PromotionState::Failed);
                PipelineCounters::bump(&self.counters.failed);
                debug!(
                    start = format_args!("{start:#010x}"),
                    "unit left interpreted"
                );
            }
        }
        true
    }
}

/// Dedicated thread draining a [`Promoter`]. Stopped and joined on drop.
#[derive(Debug)]
pub struct PromotionWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PromotionWorker {
    pub fn spawn(promoter: Arc<Promoter>, idle: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("aero-promotion".into())
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    debug!("promotion worker started");
                    while !stop.load(Ordering::Acquire) {
                        if !promoter.run_once() {
                            thread::sleep(idle);
                        }
                    }
                    debug!("promotion worker stopped");
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for PromotionWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::InterpretingCompiler;
    use crate::decoder::tests::SliceBytes;
    use crate::decoder::{DecodeOutcome, Decoder, IcedDecoder};
    use crate::tests::Recorder;
    use aero_addrspace::{GuestMode, PhysicalAddressSpace};

    fn stream(start: u32, code: &[u8]) -> InstructionStream {
        let mut bytes = SliceBytes::bounded(start, code);
        match IcedDecoder.decode(&mut bytes, GuestMode::Real, 100).unwrap() {
            DecodeOutcome::Complete(stream) => stream,
            DecodeOutcome::CrossesBoundary => unreachable!(),
        }
    }

    fn promotion(start: u32, code: &[u8], executions: u32) -> Arc<Promotion> {
        let stream = stream(start, code);
        let interpreted = InterpretingCompiler.build(&stream);
        let p = Arc::new(Promotion::new(stream, interpreted));
        p.executions.store(executions, Ordering::Relaxed);
        p
    }

    fn queue(capacity: usize) -> PromotionQueue {
        PromotionQueue::new(capacity, Arc::default())
    }

    #[test]
    fn pops_hottest_then_earliest() {
        let q = queue(8);
        let a = promotion(0x100, &[0xc3], 5);
        let b = promotion(0x200, &[0xc3], 9);
        let c = promotion(0x300, &[0xc3], 9);
        for p in [&a, &b, &c] {
            assert!(q.offer(p));
            assert_eq!(p.state(), PromotionState::Queued);
        }

        assert!(Arc::ptr_eq(&q.pop().unwrap(), &b));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &c));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &a));
        assert!(q.pop().is_none());
    }

    #[test]
    fn entries_under_half_the_popped_count_are_dropped() {
        let q = queue(8);
        let hot = promotion(0x100, &[0xc3], 100);
        let warm = promotion(0x200, &[0xc3], 50);
        let cold = promotion(0x300, &[0xc3], 49);
        for p in [&hot, &warm, &cold] {
            q.offer(p);
        }

        assert!(Arc::ptr_eq(&q.pop().unwrap(), &hot));
        assert_eq!(q.len(), 1);
        assert_eq!(warm.state(), PromotionState::Queued);
        assert_eq!(cold.state(), PromotionState::Interpreted);
    }

    #[test]
    fn full_queue_admits_only_hotter_units() {
        let q = queue(2);
        let a = promotion(0x100, &[0xc3], 3);
        let b = promotion(0x200, &[0xc3], 5);
        let c = promotion(0x300, &[0xc3], 4);
        let d = promotion(0x400, &[0xc3], 1);
        assert!(q.offer(&a));
        assert!(q.offer(&b));

        assert!(q.offer(&c));
        assert_eq!(a.state(), PromotionState::Interpreted);
        assert_eq!(q.len(), 2);

        assert!(!q.offer(&d));
        assert_eq!(d.state(), PromotionState::Interpreted);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn queued_units_are_not_offered_twice() {
        let q = queue(4);
        let a = promotion(0x100, &[0xc3], 3);
        assert!(q.offer(&a));
        assert!(!q.offer(&a));
        assert_eq!(q.len(), 1);
    }

    fn promoter(capacity: usize) -> Promoter {
        let counters: Arc<PipelineCounters> = Arc::default();
        Promoter::new(
            Arc::new(PromotionQueue::new(capacity, Arc::clone(&counters))),
            Arc::new(CompiledBlockCache::new(16)),
            counters,
        )
    }

    #[test]
    fn promoter_publishes_compiled_units() {
        let promoter = promoter(4);
        let ok = promotion(0x100, &[0x90, 0x40, 0xc3], 10);
        let refused = promotion(0x200, &[0x90, 0xf4], 5);
        promoter.queue().offer(&ok);
        promoter.queue().offer(&refused);

        assert!(promoter.run_once());
        assert_eq!(ok.state(), PromotionState::Compiled);
        let target = ok.target().unwrap();
        assert_eq!(target.tier(), Tier::Compiled);
        assert_eq!(target.x86_length(), 3);
        assert!(promoter.cache().compile(&ok.stream).is_some());

        assert!(promoter.run_once());
        assert_eq!(refused.state(), PromotionState::Failed);
        assert!(refused.target().is_none());

        assert!(!promoter.run_once());
        let stats = promoter.counters.snapshot();
        assert_eq!((stats.queued, stats.compiled, stats.failed), (2, 1, 1));
    }

    #[test]
    fn wrapper_offers_at_threshold_and_then_requests_replacement() {
        let promoter = promoter(4);
        let s = stream(0x100, &[0x90, 0x40, 0xc3]);
        let interpreted = InterpretingCompiler.build(&s);
        let unit = PromotionBody::wrap(s, interpreted, Arc::clone(promoter.queue()), 2);
        assert_eq!(unit.tier(), Tier::Promotable);

        let mut cpu = Recorder::default();
        let mut mem = PhysicalAddressSpace::new(0);
        for expect_queued in [0, 1] {
            match unit.execute(&mut cpu, &mut mem).unwrap() {
                Completion::Retired(n) => assert_eq!(n, 3),
                other => panic!("unexpected completion {other:?}"),
            }
            assert_eq!(promoter.queue().len(), expect_queued);
        }

        assert!(unit.promoted().is_none());
        assert!(promoter.run_once());
        let promoted = unit.promoted().unwrap();
        match unit.execute(&mut cpu, &mut mem).unwrap() {
            Completion::NeedsReplacement(next) => assert!(Arc::ptr_eq(&next, &promoted)),
            other => panic!("unexpected completion {other:?}"),
        }
        assert_eq!(promoted.x86_count(), unit.x86_count());
        assert_eq!(cpu.executed.len(), 6);
    }
}
