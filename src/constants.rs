/// The fraction of the corpus used for training; the rest is used for validation.
pub const TRAIN_VALIDATION_SPLIT: f64 = 0.9;
/// Seed for parameter initialization and every sampling draw.
pub const DEFAULT_SEED: u64 = 1337;

/// Total optimization steps.
pub const MAX_ITERS: usize = 5000;
/// Steps between loss estimates.
pub const EVAL_INTERVAL: usize = 300;
/// Steps between progress lines in the log.
pub const LOG_INTERVAL: usize = 100;
/// Batches averaged per split in each loss estimate.
pub const EVAL_ITERS: usize = 200;
pub const LEARNING_RATE: f64 = 3e-4;

/// Hidden layer width of the feed-forward network relative to the embedding width.
pub const FFN_EXPANSION: i64 = 4;

/// Characters appended to the seed context after training.
pub const MAX_NEW_TOKENS: usize = 100;
/// Zero tokens used as the generation context when no prompt is given.
pub const DEFAULT_CONTEXT_LENGTH: usize = 128;

// Accelerator preset.
pub const CUDA_BATCH_SIZE: usize = 64;
pub const CUDA_BLOCK_SIZE: usize = 256;
pub const CUDA_EMBEDDING_DIM: i64 = 384;
pub const CUDA_HEADS: i64 = 6;
pub const CUDA_LAYERS: usize = 6;

// CPU preset, scaled down so a run finishes on a laptop.
pub const CPU_BATCH_SIZE: usize = 32;
pub const CPU_BLOCK_SIZE: usize = 128;
pub const CPU_EMBEDDING_DIM: i64 = 128;
pub const CPU_HEADS: i64 = 4;
pub const CPU_LAYERS: usize = 4;
