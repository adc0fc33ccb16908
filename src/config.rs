use std::path::PathBuf;

use clap::Parser;
use tch::Device;

use crate::constants::*;
use crate::error::{GptError, Result};

/// Hyperparameters for one run. Built once in `main` and handed by reference to
/// the sampler, the model and the trainer.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Sequences per batch.
    pub batch_size: usize,
    /// Context window length; sizes the position table and the causal mask.
    pub block_size: usize,
    pub max_iters: usize,
    pub eval_interval: usize,
    /// Steps between progress lines in the log.
    pub log_interval: usize,
    pub learning_rate: f64,
    pub embedding_dim: i64,
    /// Must divide `embedding_dim` evenly.
    pub num_heads: i64,
    pub num_layers: usize,
    pub eval_iters: usize,
    /// Attention-weight dropout, only active in [`crate::model::Mode::Train`]. Zero disables it.
    pub dropout: f64,
    pub seed: u64,
}

impl Config {
    pub fn cuda() -> Self {
        Config {
            batch_size: CUDA_BATCH_SIZE,
            block_size: CUDA_BLOCK_SIZE,
            embedding_dim: CUDA_EMBEDDING_DIM,
            num_heads: CUDA_HEADS,
            num_layers: CUDA_LAYERS,
            ..Self::cpu()
        }
    }

    pub fn cpu() -> Self {
        Config {
            batch_size: CPU_BATCH_SIZE,
            block_size: CPU_BLOCK_SIZE,
            max_iters: MAX_ITERS,
            eval_interval: EVAL_INTERVAL,
            log_interval: LOG_INTERVAL,
            learning_rate: LEARNING_RATE,
            embedding_dim: CPU_EMBEDDING_DIM,
            num_heads: CPU_HEADS,
            num_layers: CPU_LAYERS,
            eval_iters: EVAL_ITERS,
            dropout: 0.0,
            seed: DEFAULT_SEED,
        }
    }

    /// Picks the preset matching the compute device.
    pub fn for_device(device: Device) -> Self {
        match device {
            Device::Cpu => Self::cpu(),
            _ => Self::cuda(),
        }
    }

    /// Width of each attention head.
    pub fn head_size(&self) -> i64 {
        self.embedding_dim / self.num_heads
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size as i64),
            ("block_size", self.block_size as i64),
            ("eval_interval", self.eval_interval as i64),
            ("log_interval", self.log_interval as i64),
            ("eval_iters", self.eval_iters as i64),
            ("embedding_dim", self.embedding_dim),
            ("num_heads", self.num_heads),
            ("num_layers", self.num_layers as i64),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(GptError::ConfigurationInvariantViolation(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.embedding_dim % self.num_heads != 0 {
            return Err(GptError::ConfigurationInvariantViolation(format!(
                "embedding_dim={} is not divisible by num_heads={}",
                self.embedding_dim, self.num_heads
            )));
        }
        if !(self.learning_rate > 0.0) {
            return Err(GptError::ConfigurationInvariantViolation(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(GptError::ConfigurationInvariantViolation(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Small enough for unit tests on the CPU.
    #[cfg(test)]
    pub fn tiny() -> Self {
        Config {
            batch_size: 4,
            block_size: 8,
            max_iters: 20,
            eval_interval: 10,
            log_interval: 5,
            learning_rate: 1e-3,
            embedding_dim: 16,
            num_heads: 4,
            num_layers: 2,
            eval_iters: 2,
            dropout: 0.0,
            seed: DEFAULT_SEED,
        }
    }

    /// One-line summary printed at startup.
    pub fn summary(&self) -> String {
        format!(
            "batch_size={}, block_size={}, n_embd={}, n_heads={}, n_layer={}",
            self.batch_size, self.block_size, self.embedding_dim, self.num_heads, self.num_layers
        )
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "char-minigpt",
    about = "Train a character-level GPT on a text file and sample from it"
)]
pub struct Args {
    /// Plain-text (UTF-8) training corpus
    #[arg(long, default_value = "input.txt")]
    pub corpus: PathBuf,

    /// Sequences per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Context window length
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Total optimization steps
    #[arg(long)]
    pub max_iters: Option<usize>,

    /// Steps between loss estimates
    #[arg(long)]
    pub eval_interval: Option<usize>,

    /// Steps between progress lines in the log
    #[arg(long)]
    pub log_interval: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub embedding_dim: Option<i64>,

    /// Attention heads per block (must divide the embedding dimension)
    #[arg(long)]
    pub num_heads: Option<i64>,

    /// Transformer blocks
    #[arg(long)]
    pub num_layers: Option<usize>,

    /// Batches averaged per split in each loss estimate
    #[arg(long)]
    pub eval_iters: Option<usize>,

    #[arg(long)]
    pub dropout: Option<f64>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Characters to generate after training
    #[arg(long, default_value_t = MAX_NEW_TOKENS)]
    pub max_new_tokens: usize,

    /// Seed text for generation (defaults to a block of 128 zero tokens)
    #[arg(long)]
    pub prompt: Option<String>,

    /// Run on the CPU even if CUDA is available
    #[arg(long)]
    pub cpu: bool,

    /// Shared library to load before probing CUDA, e.g. libtorch_cuda.so
    #[arg(long)]
    pub cuda_library: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

impl Args {
    /// Starts from the device preset and applies every override given on the command line.
    pub fn config(&self, device: Device) -> Config {
        let preset = Config::for_device(device);
        Config {
            batch_size: self.batch_size.unwrap_or(preset.batch_size),
            block_size: self.block_size.unwrap_or(preset.block_size),
            max_iters: self.max_iters.unwrap_or(preset.max_iters),
            eval_interval: self.eval_interval.unwrap_or(preset.eval_interval),
            log_interval: self.log_interval.unwrap_or(preset.log_interval),
            learning_rate: self.learning_rate.unwrap_or(preset.learning_rate),
            embedding_dim: self.embedding_dim.unwrap_or(preset.embedding_dim),
            num_heads: self.num_heads.unwrap_or(preset.num_heads),
            num_layers: self.num_layers.unwrap_or(preset.num_layers),
            eval_iters: self.eval_iters.unwrap_or(preset.eval_iters),
            dropout: self.dropout.unwrap_or(preset.dropout),
            seed: self.seed.unwrap_or(preset.seed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert_eq!(Config::cpu().validate(), Ok(()));
        assert_eq!(Config::cuda().validate(), Ok(()));
        assert_eq!(Config::cuda().head_size(), 64);
        assert_eq!(Config::cpu().head_size(), 32);
    }

    #[test]
    fn test_heads_must_divide_embedding() {
        let config = Config {
            embedding_dim: 10,
            num_heads: 4,
            ..Config::cpu()
        };
        assert!(matches!(
            config.validate(),
            Err(GptError::ConfigurationInvariantViolation(_))
        ));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = Config {
            block_size: 0,
            ..Config::cpu()
        };
        assert!(config.validate().is_err());
        let config = Config {
            eval_interval: 0,
            ..Config::cpu()
        };
        assert!(config.validate().is_err());
        let config = Config {
            log_interval: 0,
            ..Config::cpu()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_args_override_preset() {
        let args = Args::try_parse_from([
            "char-minigpt",
            "--corpus",
            "shakespeare.txt",
            "--block-size",
            "16",
            "--num-heads",
            "2",
            "--seed",
            "7",
            "--log-interval",
            "25",
        ])
        .unwrap();
        let config = args.config(Device::Cpu);
        assert_eq!(config.block_size, 16);
        assert_eq!(config.num_heads, 2);
        assert_eq!(config.seed, 7);
        assert_eq!(config.log_interval, 25);
        assert_eq!(config.batch_size, CPU_BATCH_SIZE);
        assert_eq!(args.corpus, PathBuf::from("shakespeare.txt"));
        assert_eq!(args.max_new_tokens, MAX_NEW_TOKENS);
    }

    #[test]
    fn test_summary_line() {
        assert_eq!(
            Config::cpu().summary(),
            "batch_size=32, block_size=128, n_embd=128, n_heads=4, n_layer=4"
        );
    }
}
