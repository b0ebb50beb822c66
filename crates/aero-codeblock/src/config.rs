use std::time::Duration;

/// Tuning knobs for [`crate::CodeBlockManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlockConfig {
    /// Upper bound on guest instructions decoded into one unit.
    pub max_instructions_per_block: usize,

    /// A unit is offered for background compilation each time its execution count reaches a
    /// multiple of this value. Zero disables promotion.
    pub promotion_threshold: u32,

    /// Units waiting for the background compiler. When full, only hotter units get in.
    pub promotion_queue_capacity: usize,

    /// How long the promotion worker sleeps when its queue is empty.
    pub idle_sleep: Duration,

    /// Spawn the promotion worker thread. When disabled, pending promotions only run through
    /// [`crate::CodeBlockManager::run_promotions`].
    pub background_promotion: bool,

    /// Compiled units kept for reuse when the same code is decoded again.
    pub compiled_cache_capacity: usize,
}

impl Default for CodeBlockConfig {
    fn default() -> Self {
        Self {
            max_instructions_per_block: 1000,
            promotion_threshold: 1024,
            promotion_queue_capacity: 256,
            idle_sleep: Duration::from_millis(1),
            background_promotion: true,
            compiled_cache_capacity: 4096,
        }
    }
}
