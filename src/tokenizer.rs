use std::collections::{BTreeSet, HashMap};

use crate::error::{GptError, Result};

/// Character vocabulary built from the training corpus.
///
/// Indices are assigned in sorted character order, so the table for a given
/// corpus is always the same.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    itos: Vec<char>,
    stoi: HashMap<char, i64>,
}

impl Tokenizer {
    /// Scans the corpus once and assigns indices `0..V` to its distinct characters.
    pub fn new(corpus: &str) -> Self {
        let itos: Vec<char> = corpus.chars().collect::<BTreeSet<_>>().into_iter().collect();
        let stoi = itos
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as i64))
            .collect();
        Tokenizer { itos, stoi }
    }

    pub fn vocab_size(&self) -> usize {
        self.itos.len()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<i64>> {
        text.chars()
            .map(|c| {
                self.stoi
                    .get(&c)
                    .copied()
                    .ok_or(GptError::UnknownCharacter(c))
            })
            .collect()
    }

    pub fn decode(&self, tokens: &[i64]) -> Result<String> {
        let mut text = String::with_capacity(tokens.len());
        for &token in tokens {
            let c = usize::try_from(token)
                .ok()
                .and_then(|i| self.itos.get(i))
                .ok_or(GptError::IndexOutOfRange {
                    index: token,
                    vocab_size: self.vocab_size(),
                })?;
            text.push(*c);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_vocabulary() -> Result<()> {
        let tokenizer = Tokenizer::new("abcabc");
        assert_eq!(tokenizer.vocab_size(), 3);
        assert_eq!(tokenizer.encode("abc")?, vec![0, 1, 2]);
        assert_eq!(tokenizer.encode("cab")?, vec![2, 0, 1]);
        assert_eq!(tokenizer.decode(&[2, 0, 1])?, "cab");
        Ok(())
    }

    #[test]
    fn test_tokenizer_roundtrip() -> Result<()> {
        let corpus = "First Citizen:\nBefore we proceed any further, hear me speak.\nÀ bientôt!";
        let tokenizer = Tokenizer::new(corpus);
        let text = "hear me, Citizen! bientôt";
        let tokens = tokenizer.encode(text)?;
        assert_eq!(tokens.len(), text.chars().count());
        assert!(tokens.iter().all(|&t| (t as usize) < tokenizer.vocab_size()));
        assert_eq!(tokenizer.decode(&tokens)?, text);
        Ok(())
    }

    #[test]
    fn test_unknown_character() {
        let tokenizer = Tokenizer::new("abc");
        assert_eq!(
            tokenizer.encode("abz"),
            Err(GptError::UnknownCharacter('z'))
        );
    }

    #[test]
    fn test_index_out_of_range() {
        let tokenizer = Tokenizer::new("abc");
        assert_eq!(
            tokenizer.decode(&[0, 3]),
            Err(GptError::IndexOutOfRange {
                index: 3,
                vocab_size: 3
            })
        );
        assert!(tokenizer.decode(&[-1]).is_err());
    }

    #[test]
    fn test_empty_text() -> Result<()> {
        let tokenizer = Tokenizer::new("abc");
        assert!(tokenizer.encode("")?.is_empty());
        assert_eq!(tokenizer.decode(&[])?, "");
        Ok(())
    }
}
