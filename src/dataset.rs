use std::path::Path;

use anyhow::{Context, bail};
use rand::Rng;
use tch::{Device, Tensor};

use crate::constants::TRAIN_VALIDATION_SPLIT;
use crate::error::{GptError, Result, Split};
use crate::tokenizer::Tokenizer;

/// A batch of `[batch_size, block_size]` windows and the same windows shifted one
/// position forward in the corpus.
#[derive(Debug)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

/// The encoded corpus, split once into a training prefix and a validation suffix.
/// Both splits stay on the CPU; sampled batches are moved to `device`.
#[derive(Debug)]
pub struct DataSet {
    training: Tensor,
    validation: Tensor,
    device: Device,
}

impl DataSet {
    pub fn new(tokens: &[i64], device: Device) -> Self {
        let data = Tensor::from_slice(tokens);
        let len = tokens.len() as i64;
        let n = (TRAIN_VALIDATION_SPLIT * len as f64) as i64;
        DataSet {
            training: data.narrow(0, 0, n),
            validation: data.narrow(0, n, len - n),
            device,
        }
    }

    /// Reads the corpus file, builds its vocabulary and encodes it.
    pub fn load(path: &Path, device: Device) -> anyhow::Result<(Tokenizer, DataSet)> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read corpus {}", path.display()))?;
        if text.is_empty() {
            bail!("corpus {} is empty", path.display());
        }
        let tokenizer = Tokenizer::new(&text);
        let tokens = tokenizer.encode(&text)?;
        Ok((tokenizer, DataSet::new(&tokens, device)))
    }

    fn data(&self, split: Split) -> &Tensor {
        match split {
            Split::Train => &self.training,
            Split::Validation => &self.validation,
        }
    }

    pub fn len(&self, split: Split) -> usize {
        self.data(split).size()[0] as usize
    }

    /// Fails unless both splits can hold at least one window of `block_size + 1` tokens.
    pub fn check(&self, block_size: usize) -> Result<()> {
        for split in [Split::Train, Split::Validation] {
            let len = self.len(split);
            if len <= block_size {
                return Err(GptError::InsufficientData {
                    split,
                    len,
                    block_size,
                });
            }
        }
        Ok(())
    }

    /// Draws `batch_size` start offsets uniformly, with replacement, from
    /// `[0, len - block_size)` and cuts the input and target windows at each.
    pub fn sample<R: Rng>(
        &self,
        split: Split,
        batch_size: usize,
        block_size: usize,
        rng: &mut R,
    ) -> Result<Batch> {
        let data = self.data(split);
        let len = self.len(split);
        if len <= block_size {
            return Err(GptError::InsufficientData {
                split,
                len,
                block_size,
            });
        }
        let window = block_size as i64;
        let mut inputs = Vec::with_capacity(batch_size);
        let mut targets = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let offset = rng.random_range(0..len - block_size) as i64;
            // [block_size] each, targets shifted one token ahead
            inputs.push(data.narrow(0, offset, window));
            targets.push(data.narrow(0, offset + 1, window));
        }
        // [batch_size, block_size]
        Ok(Batch {
            inputs: Tensor::stack(&inputs, 0).to_device(self.device),
            targets: Tensor::stack(&targets, 0).to_device(self.device),
        })
    }
}
