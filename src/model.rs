use std::f64;

use crate::config::Config;
use crate::constants::FFN_EXPANSION;
use crate::error::{GptError, Result};
use tch::{
    Device, IndexOp,
    Kind::{Float, Int64},
    Tensor,
    nn::{Embedding, LayerNorm, Linear, LinearConfig, Path, embedding, layer_norm, linear},
};

/// Whether stochastic regularization is active. With the default `dropout = 0.0`
/// both modes compute the same thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    fn is_train(self) -> bool {
        self == Mode::Train
    }
}

/// Lower-triangular `[block_size, block_size]` matrix of ones. Built once by the
/// model and lent to every head.
pub fn causal_mask(block_size: usize, device: Device) -> Tensor {
    let n = block_size as i64;
    Tensor::ones([n, n], (Float, device)).tril(0)
}

/// Masked scaled dot-product weights for `q` and `k` of shape `[batch, seq_len, head_size]`.
/// Row `i` is a distribution over positions `0..=i`; entries above the diagonal are exactly zero.
pub fn attention_weights(q: &Tensor, k: &Tensor, mask: &Tensor) -> Tensor {
    let t = q.size()[1];
    let head_size = q.size()[2];
    // Q @ K^T scaled by sqrt(head_size): [batch, seq_len, seq_len]
    let scores = q.matmul(&k.transpose(-2, -1)) / f64::sqrt(head_size as f64);
    // Future positions get -inf so softmax gives them exactly zero weight.
    scores
        .masked_fill(&mask.i((..t, ..t)).eq(0.), f64::NEG_INFINITY)
        .softmax(-1, Float)
}

/// Token plus learned position embeddings.
struct Embeddings {
    token: Embedding,
    position: Embedding,
}

impl Embeddings {
    fn new(vs: &Path, vocab_size: i64, block_size: i64, embedding_dim: i64) -> Self {
        let token = embedding(vs / "token", vocab_size, embedding_dim, Default::default());
        let position = embedding(vs / "position", block_size, embedding_dim, Default::default());
        Embeddings { token, position }
    }

    /// `[batch, seq_len]` token ids to `[batch, seq_len, embedding_dim]`. The position
    /// rows `0..seq_len` are shared across the batch by broadcasting.
    fn forward(&self, input: &Tensor) -> Tensor {
        let seq_length = input.size()[1];
        let position_ids = Tensor::arange(seq_length, (Int64, input.device()));
        // [batch, seq_len, embedding_dim] + [seq_len, embedding_dim]
        input.apply(&self.token) + position_ids.apply(&self.position)
    }
}

/// One causal self-attention head.
struct Head {
    query: Linear,
    key: Linear,
    value: Linear,
    dropout: f64,
}

impl Head {
    fn new(vs: &Path, embedding_dim: i64, head_size: i64, dropout: f64) -> Self {
        let no_bias = || LinearConfig {
            bias: false,
            ..Default::default()
        };
        let query = linear(vs / "query", embedding_dim, head_size, no_bias());
        let key = linear(vs / "key", embedding_dim, head_size, no_bias());
        let value = linear(vs / "value", embedding_dim, head_size, no_bias());
        Head {
            query,
            key,
            value,
            dropout,
        }
    }

    /// `[batch, seq_len, embedding_dim]` to `[batch, seq_len, head_size]`.
    fn forward(&self, input: &Tensor, mask: &Tensor, mode: Mode) -> Tensor {
        // [batch, seq_len, head_size]
        let q = input.apply(&self.query);
        // [batch, seq_len, head_size]
        let k = input.apply(&self.key);
        // [batch, seq_len, head_size]
        let v = input.apply(&self.value);
        // [batch, seq_len, seq_len], each row sums to 1 over the visible prefix
        let weights = attention_weights(&q, &k, mask).dropout(self.dropout, mode.is_train());
        // Weighted sum of values: [batch, seq_len, head_size]
        weights.matmul(&v)
    }
}

/// Heads run side by side and their outputs are concatenated. There is no
/// output projection after the concatenation.
struct MultiHeadAttention {
    heads: Vec<Head>,
}

impl MultiHeadAttention {
    fn new(vs: &Path, config: &Config) -> Self {
        let heads = (0..config.num_heads)
            .map(|i| {
                Head::new(
                    &(vs / i),
                    config.embedding_dim,
                    config.head_size(),
                    config.dropout,
                )
            })
            .collect();
        MultiHeadAttention { heads }
    }

    fn forward(&self, input: &Tensor, mask: &Tensor, mode: Mode) -> Tensor {
        // num_heads x [batch, seq_len, head_size]
        let outputs: Vec<Tensor> = self
            .heads
            .iter()
            .map(|head| head.forward(input, mask, mode))
            .collect();
        // [batch, seq_len, num_heads * head_size] = [batch, seq_len, embedding_dim]
        Tensor::cat(&outputs, -1)
    }
}

/// Position-wise MLP, `embedding_dim -> 4 * embedding_dim -> embedding_dim`.
struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    fn new(vs: &Path, embedding_dim: i64) -> Self {
        let hidden = embedding_dim * FFN_EXPANSION;
        let fc1 = linear(vs / "fc1", embedding_dim, hidden, Default::default());
        let fc2 = linear(vs / "fc2", hidden, embedding_dim, Default::default());
        FeedForward { fc1, fc2 }
    }

    fn forward(&self, input: &Tensor) -> Tensor {
        // [batch, seq_len, 4 * embedding_dim] -> [batch, seq_len, embedding_dim]
        input.apply(&self.fc1).relu().apply(&self.fc2)
    }
}

/// Pre-norm transformer block: each sublayer sees a normalized copy and adds
/// its output to the un-normalized residual stream.
struct Block {
    attention: MultiHeadAttention,
    feed_forward: FeedForward,
    ln1: LayerNorm,
    ln2: LayerNorm,
}

impl Block {
    fn new(vs: &Path, config: &Config) -> Self {
        let dim = config.embedding_dim;
        Block {
            attention: MultiHeadAttention::new(&(vs / "attention"), config),
            feed_forward: FeedForward::new(&(vs / "feed_forward"), dim),
            ln1: layer_norm(vs / "ln1", vec![dim], Default::default()),
            ln2: layer_norm(vs / "ln2", vec![dim], Default::default()),
        }
    }

    fn forward(&self, input: &Tensor, mask: &Tensor, mode: Mode) -> Tensor {
        // Residual stream keeps the un-normalized input: [batch, seq_len, embedding_dim]
        let x = input + self.attention.forward(&input.apply(&self.ln1), mask, mode);
        let ffn = self.feed_forward.forward(&x.apply(&self.ln2));
        x + ffn
    }
}

/// Decoder-only character model. Owns all parameters (through the `VarStore`
/// behind `vs`) and the causal mask shared by its heads.
pub struct MiniGPT {
    embeddings: Embeddings,
    blocks: Vec<Block>,
    ln: LayerNorm,
    lm_head: Linear,
    mask: Tensor,
    block_size: usize,
    vocab_size: i64,
}

impl MiniGPT {
    /// Fails with `ConfigurationInvariantViolation` if the configuration is unusable,
    /// most notably when `num_heads` does not divide `embedding_dim`.
    pub fn new(vs: &Path, config: &Config, vocab_size: usize) -> Result<Self> {
        config.validate()?;
        if vocab_size == 0 {
            return Err(GptError::ConfigurationInvariantViolation(
                "vocabulary is empty".to_string(),
            ));
        }
        let vocab_size = vocab_size as i64;
        let dim = config.embedding_dim;
        let embeddings = Embeddings::new(
            &(vs / "embeddings"),
            vocab_size,
            config.block_size as i64,
            dim,
        );
        let blocks = (0..config.num_layers)
            .map(|i| Block::new(&(vs / "blocks" / i), config))
            .collect();
        Ok(MiniGPT {
            embeddings,
            blocks,
            ln: layer_norm(vs / "ln", vec![dim], Default::default()),
            lm_head: linear(vs / "lm_head", dim, vocab_size, Default::default()),
            mask: causal_mask(config.block_size, vs.device()),
            block_size: config.block_size,
            vocab_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn vocab_size(&self) -> i64 {
        self.vocab_size
    }

    /// Maps `[batch, seq_len]` token ids to `[batch, seq_len, vocab_size]` logits.
    /// When `targets` (same shape as `input`) is given, also returns the mean
    /// cross-entropy over every position.
    pub fn forward(
        &self,
        input: &Tensor,
        targets: Option<&Tensor>,
        mode: Mode,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let size = input.size();
        let &[b, t] = size.as_slice() else {
            return Err(GptError::ConfigurationInvariantViolation(format!(
                "expected [batch, seq_len] token ids, got shape {size:?}"
            )));
        };
        if t == 0 || t > self.block_size as i64 {
            return Err(GptError::ConfigurationInvariantViolation(format!(
                "sequence length {t} outside 1..={}",
                self.block_size
            )));
        }

        // [batch, seq_len, embedding_dim]
        let mut x = self.embeddings.forward(input);
        for block in &self.blocks {
            x = block.forward(&x, &self.mask, mode);
        }
        // [batch, seq_len, vocab_size]
        let logits = x.apply(&self.ln).apply(&self.lm_head);

        let loss = match targets {
            None => None,
            Some(targets) => {
                if targets.size() != size {
                    return Err(GptError::ConfigurationInvariantViolation(format!(
                        "targets shape {:?} does not match input shape {size:?}",
                        targets.size()
                    )));
                }
                // Flatten to [batch * seq_len, vocab_size] against [batch * seq_len]
                Some(
                    logits
                        .view([b * t, self.vocab_size])
                        .cross_entropy_for_logits(&targets.view([b * t])),
                )
            }
        };
        Ok((logits, loss))
    }
}
