use std::io;
use std::sync::Arc;

use aero_addrspace::{ByteSource, CodeSource, DecodeError, Decoded, GuestMode};
use thiserror::Error;
use tracing::{debug, trace};

use crate::compiler::{CompiledBlockCache, Compiler, InterpretingCompiler};
use crate::config::CodeBlockConfig;
use crate::decoder::{DecodeOutcome, Decoder, IcedDecoder};
use crate::promotion::{Promoter, PromotionBody, PromotionQueue, PromotionWorker};
use crate::stats::{PipelineCounters, PipelineStats};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to start promotion worker: {0}")]
    Spawn(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// The decode/compile pipeline: decodes guest bytes, reuses compiled units where it can and
/// otherwise builds interpreted units wrapped for background promotion.
///
/// Install it on a [`aero_addrspace::PhysicalAddressSpace`] as its code source.
pub struct CodeBlockManager {
    config: CodeBlockConfig,
    decoder: Box<dyn Decoder>,
    immediate: InterpretingCompiler,
    promoter: Arc<Promoter>,
    counters: Arc<PipelineCounters>,
    worker: Option<PromotionWorker>,
}

impl CodeBlockManager {
    pub fn new(config: CodeBlockConfig) -> Result<Self> {
        Self::with_decoder(config, Box::new(IcedDecoder::new()))
    }

    pub fn with_decoder(config: CodeBlockConfig, decoder: Box<dyn Decoder>) -> Result<Self> {
        let counters: Arc<PipelineCounters> = Arc::default();
        let queue = Arc::new(PromotionQueue::new(
            config.promotion_queue_capacity,
            Arc::clone(&counters),
        ));
        let cache = Arc::new(CompiledBlockCache::new(config.compiled_cache_capacity));
        let promoter = Arc::new(Promoter::new(queue, cache, Arc::clone(&counters)));

        let worker = if config.background_promotion && config.promotion_threshold > 0 {
            Some(PromotionWorker::spawn(
                Arc::clone(&promoter),
                config.idle_sleep,
            )?)
        } else {
            None
        };
        debug!(
            max_instructions = config.max_instructions_per_block,
            threshold = config.promotion_threshold,
            background = worker.is_some(),
            "code block manager ready"
        );

        Ok(Self {
            config,
            decoder,
            immediate: InterpretingCompiler::new(),
            promoter,
            counters,
            worker,
        })
    }

    pub fn config(&self) -> &CodeBlockConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    pub fn pending_promotions(&self) -> usize {
        self.promoter.queue().len()
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Drain the promotion queue on the calling thread. Returns how many units were processed,
    /// whether or not they compiled.
    pub fn run_promotions(&self) -> usize {
        let mut done = 0;
        while self.promoter.run_once() {
            done += 1;
        }
        done
    }
}

impl CodeSource for CodeBlockManager {
    fn get_unit(
        &self,
        mode: GuestMode,
        bytes: &mut dyn ByteSource,
    ) -> std::result::Result<Decoded, DecodeError> {
        let start = bytes.start();
        let stream = match self
            .decoder
            .decode(bytes, mode, self.config.max_instructions_per_block)?
        {
            DecodeOutcome::Complete(stream) => stream,
            DecodeOutcome::CrossesBoundary => {
                PipelineCounters::bump(&self.counters.spanning);
                return Ok(Decoded::CrossesBoundary);
            }
        };
        PipelineCounters::bump(&self.counters.decoded);

        if let Some(unit) = self.promoter.cache().compile(&stream) {
            PipelineCounters::bump(&self.counters.cache_hits);
            trace!(
                start = format_args!("{start:#010x}"),
                ?mode,
                "compiled unit reused"
            );
            return Ok(Decoded::Unit(unit));
        }

        let interpreted = self.immediate.build(&stream);
        if self.config.promotion_threshold == 0 {
            return Ok(Decoded::Unit(interpreted));
        }
        Ok(Decoded::Unit(PromotionBody::wrap(
            stream,
            interpreted,
            Arc::clone(self.promoter.queue()),
            self.config.promotion_threshold,
        )))
    }
}

impl std::fmt::Debug for CodeBlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBlockManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("background", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::SliceBytes;
    use aero_addrspace::Tier;

    fn manager(threshold: u32) -> CodeBlockManager {
        CodeBlockManager::new(CodeBlockConfig {
            promotion_threshold: threshold,
            background_promotion: false,
            ..CodeBlockConfig::default()
        })
        .unwrap()
    }

    fn unit(manager: &CodeBlockManager, bytes: &mut SliceBytes) -> Arc<aero_addrspace::CodeBlock> {
        match manager.get_unit(GuestMode::Protected, bytes).unwrap() {
            Decoded::Unit(unit) => unit,
            Decoded::CrossesBoundary => panic!("unexpected boundary crossing"),
        }
    }

    #[test]
    fn units_are_wrapped_for_promotion() {
        let m = manager(4);
        let u = unit(&m, &mut SliceBytes::bounded(0x100, &[0x90, 0xc3]));
        assert_eq!(u.tier(), Tier::Promotable);
        assert_eq!(m.stats().decoded, 1);
        assert!(!m.has_worker());
    }

    #[test]
    fn zero_threshold_hands_out_plain_interpreted_units() {
        let m = manager(0);
        let u = unit(&m, &mut SliceBytes::bounded(0x100, &[0x90, 0xc3]));
        assert_eq!(u.tier(), Tier::Interpreted);
    }

    #[test]
    fn instruction_limit_comes_from_config() {
        let m = CodeBlockManager::new(CodeBlockConfig {
            max_instructions_per_block: 3,
            background_promotion: false,
            ..CodeBlockConfig::default()
        })
        .unwrap();
        let u = unit(&m, &mut SliceBytes::bounded(0x100, &[0x90; 16]));
        assert_eq!(u.x86_count(), 3);
    }

    #[test]
    fn boundary_crossings_are_counted_and_reported() {
        let m = manager(4);
        // mov eax, imm32 with only two immediate bytes left in the block
        let mut bytes = SliceBytes::bounded(0xffa, &[0x90, 0x90, 0x90, 0xb8, 0x01, 0x02]);
        assert!(matches!(
            m.get_unit(GuestMode::Protected, &mut bytes).unwrap(),
            Decoded::CrossesBoundary
        ));
        let stats = m.stats();
        assert_eq!((stats.spanning, stats.decoded), (1, 0));
    }

    #[test]
    fn decode_errors_propagate() {
        let m = manager(4);
        let err = m
            .get_unit(
                GuestMode::Protected,
                &mut SliceBytes::bounded(0x100, &[0xfe, 0x38, 0x90]),
            )
            .unwrap_err();
        assert_eq!(err, DecodeError::InvalidInstruction { addr: 0x100 });
    }
}
