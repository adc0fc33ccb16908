use std::fmt;

use thiserror::Error;

/// Which partition of the encoded corpus a batch is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Validation => write!(f, "val"),
        }
    }
}

/// Every failure is fatal: the run is an offline batch computation with no retry path.
#[derive(Debug, Error, PartialEq)]
pub enum GptError {
    /// Encode-time: the character never appeared in the training corpus.
    #[error("unknown character {0:?}: not in the training vocabulary")]
    UnknownCharacter(char),

    /// Decode-time: only reachable through a programming error.
    #[error("token index {index} out of range for vocabulary of size {vocab_size}")]
    IndexOutOfRange { index: i64, vocab_size: usize },

    /// A split is too short to hold a single context window.
    #[error("{split} split has {len} tokens, needs more than block_size={block_size}")]
    InsufficientData {
        split: Split,
        len: usize,
        block_size: usize,
    },

    #[error("configuration invariant violated: {0}")]
    ConfigurationInvariantViolation(String),

    /// Next-token probabilities were all zero or not finite, e.g. after training diverged.
    #[error("cannot sample from next-token distribution: {0}")]
    DegenerateDistribution(String),
}

pub type Result<T> = std::result::Result<T, GptError>;
