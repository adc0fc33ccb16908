use rand::{
    Rng,
    distr::{Distribution, weighted::WeightedIndex},
};
use tch::{Device, IndexOp, Kind::Float, Tensor};

use crate::constants::DEFAULT_CONTEXT_LENGTH;
use crate::error::{GptError, Result};
use crate::model::{MiniGPT, Mode};
use crate::tokenizer::Tokenizer;

/// Draws one token per row from `[batch, vocab_size]` logits, returned as `[batch, 1]`.
pub fn sample_next<R: Rng>(logits: &Tensor, rng: &mut R) -> Result<Tensor> {
    let (batch, vocab_size) = (logits.size()[0], logits.size()[1]);
    // [batch, vocab_size], copied to the host for sampling
    let probs = logits.softmax(-1, Float).to_device(Device::Cpu).contiguous();
    let numel = (batch * vocab_size) as usize;
    let mut weights = vec![0f32; numel];
    probs.copy_data(&mut weights, numel);

    let mut next = Vec::with_capacity(batch as usize);
    for row in weights.chunks(vocab_size as usize) {
        let dist = WeightedIndex::new(row)
            .map_err(|e| GptError::DegenerateDistribution(e.to_string()))?;
        next.push(dist.sample(rng) as i64);
    }
    Ok(Tensor::from_slice(&next)
        .view([batch, 1])
        .to_device(logits.device()))
}

impl MiniGPT {
    /// Extends each row of `context` (`[batch, seq_len]`) by exactly `max_new_tokens`
    /// sampled tokens. The model only ever sees the last `block_size` tokens.
    pub fn generate<R: Rng>(
        &self,
        context: &Tensor,
        max_new_tokens: usize,
        rng: &mut R,
    ) -> Result<Tensor> {
        if context.dim() != 2 {
            return Err(GptError::ConfigurationInvariantViolation(format!(
                "expected [batch, seq_len] context, got shape {:?}",
                context.size()
            )));
        }
        // Disable gradient tracking since we're not training now.
        let _guard = tch::no_grad_guard();
        let window = self.block_size() as i64;
        let mut tokens = context.shallow_clone();
        for _ in 0..max_new_tokens {
            let len = tokens.size()[1];
            // [batch, min(len, block_size)]
            let window_tensor = if len > window {
                tokens.narrow(1, len - window, window)
            } else {
                tokens.shallow_clone()
            };
            // [batch, window, vocab_size]
            let (logits, _) = self.forward(&window_tensor, None, Mode::Eval)?;
            // Only the final position predicts the next token: [batch, vocab_size]
            let next = sample_next(&logits.i((.., -1, ..)), rng)?;
            // [batch, len + 1]
            tokens = Tensor::cat(&[tokens, next], 1);
        }
        Ok(tokens)
    }
}

/// Encodes `prompt` (or a context of `DEFAULT_CONTEXT_LENGTH` zero tokens when
/// there is none), extends it and decodes the whole sequence, seed included.
pub fn sample_text<R: Rng>(
    model: &MiniGPT,
    tokenizer: &Tokenizer,
    prompt: Option<&str>,
    max_new_tokens: usize,
    device: Device,
    rng: &mut R,
) -> anyhow::Result<String> {
    let seed = match prompt {
        Some(text) if !text.is_empty() => tokenizer.encode(text)?,
        _ => vec![0; DEFAULT_CONTEXT_LENGTH],
    };
    // [1, seq_len]
    let context = Tensor::from_slice(&seed).to_device(device).unsqueeze(0);
    let generated = model.generate(&context, max_new_tokens, rng)?;
    let tokens = Vec::<i64>::try_from(&generated.get(0).to_device(Device::Cpu))?;
    Ok(tokenizer.decode(&tokens)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use rand::{SeedableRng, rngs::StdRng};
    use tch::{Kind, nn};

    const CORPUS: &str = "hello world, hello gpt";

    fn setup_model(config: &Config, vocab_size: usize) -> (nn::VarStore, MiniGPT) {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = MiniGPT::new(&vs.root(), config, vocab_size).unwrap();
        (vs, model)
    }

    #[test]
    fn test_generate_length_and_range() -> Result<()> {
        let config = Config::tiny();
        let (_vs, model) = setup_model(&config, 7);
        let mut rng = StdRng::seed_from_u64(0);
        let context = Tensor::zeros([1, 1], (Kind::Int64, Device::Cpu));
        let generated = model.generate(&context, 20, &mut rng)?;
        assert_eq!(generated.size(), &[1, 21]);
        let tokens = Vec::<i64>::try_from(&generated.get(0)).unwrap();
        assert_eq!(tokens[0], 0);
        assert!(tokens.iter().all(|&t| (0..7).contains(&t)));
        Ok(())
    }

    #[test]
    fn test_generate_slides_past_block_size() -> Result<()> {
        let config = Config::tiny();
        let (_vs, model) = setup_model(&config, 7);
        let mut rng = StdRng::seed_from_u64(0);
        // Seed already longer than the context window, two rows.
        let len = config.block_size as i64 + 3;
        let context = Tensor::arange(len, (Kind::Int64, Device::Cpu))
            .remainder(7)
            .unsqueeze(0)
            .repeat([2, 1]);
        let generated = model.generate(&context, 5, &mut rng)?;
        assert_eq!(generated.size(), &[2, len + 5]);
        assert!(generated.narrow(1, 0, len).equal(&context));
        Ok(())
    }

    #[test]
    fn test_generate_zero_tokens_is_identity() -> Result<()> {
        let config = Config::tiny();
        let (_vs, model) = setup_model(&config, 7);
        let context = Tensor::from_slice2(&[&[1i64, 2, 3]]);
        let generated = model.generate(&context, 0, &mut StdRng::seed_from_u64(0))?;
        assert!(generated.equal(&context));
        Ok(())
    }

    #[test]
    fn test_generate_is_reproducible_with_seed() -> Result<()> {
        let config = Config::tiny();
        let (_vs, model) = setup_model(&config, 7);
        let context = Tensor::zeros([3, 2], (Kind::Int64, Device::Cpu));
        let a = model.generate(&context, 30, &mut StdRng::seed_from_u64(99))?;
        let b = model.generate(&context, 30, &mut StdRng::seed_from_u64(99))?;
        assert!(a.equal(&b));
        Ok(())
    }

    #[test]
    fn test_generate_samples_from_final_position() -> Result<()> {
        let config = Config::tiny();
        let (_vs, model) = setup_model(&config, 7);
        let context = Tensor::from_slice2(&[&[0i64, 1, 2, 3, 4], &[6, 5, 4, 3, 2]]);
        for seed in 0..5 {
            let generated = model.generate(&context, 1, &mut StdRng::seed_from_u64(seed))?;
            let (logits, _) = model.forward(&context, None, Mode::Eval)?;
            let expected =
                sample_next(&logits.i((.., -1, ..)), &mut StdRng::seed_from_u64(seed))?;
            assert!(generated.narrow(1, 5, 1).equal(&expected));
        }
        Ok(())
    }

    #[test]
    fn test_generate_follows_peaked_head() -> Result<()> {
        let config = Config::tiny();
        let (vs, model) = setup_model(&config, 7);
        {
            // Output head ignores its input and puts nearly all mass on token 3.
            let _guard = tch::no_grad_guard();
            let variables = vs.variables();
            let _ = variables["lm_head.weight"].shallow_clone().zero_();
            let _ = variables["lm_head.bias"].shallow_clone().zero_();
            let _ = variables["lm_head.bias"].get(3).fill_(50.0);
        }
        let context = Tensor::zeros([2, 1], (Kind::Int64, Device::Cpu));
        let generated = model.generate(&context, 20, &mut StdRng::seed_from_u64(1))?;
        let sampled = generated.narrow(1, 1, 20);
        assert!(sampled.equal(&Tensor::full([2, 20], 3, (Kind::Int64, Device::Cpu))));
        Ok(())
    }

    #[test]
    fn test_sample_next_rejects_nan_logits() {
        let logits = Tensor::from_slice(&[f32::NAN, 0.0, 0.0]).view([1, 3]);
        assert!(matches!(
            sample_next(&logits, &mut StdRng::seed_from_u64(0)),
            Err(GptError::DegenerateDistribution(_))
        ));
    }

    #[test]
    fn test_generate_rejects_flat_context() {
        let config = Config::tiny();
        let (_vs, model) = setup_model(&config, 7);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(model.generate(&Tensor::from_slice(&[0i64]), 3, &mut rng).is_err());
    }

    #[test]
    fn test_sample_text_decodes_prompt_and_continuation() -> anyhow::Result<()> {
        let config = Config::tiny();
        let tokenizer = Tokenizer::new(CORPUS);
        let (_vs, model) = setup_model(&config, tokenizer.vocab_size());
        let mut rng = StdRng::seed_from_u64(0);
        let text = sample_text(&model, &tokenizer, Some("hell"), 12, Device::Cpu, &mut rng)?;
        assert!(text.starts_with("hell"));
        assert_eq!(text.chars().count(), 16);
        assert!(text.chars().all(|c| CORPUS.contains(c)));

        // No prompt: a block of zero tokens, i.e. the smallest corpus character.
        let text = sample_text(&model, &tokenizer, None, 5, Device::Cpu, &mut rng)?;
        assert_eq!(text.chars().count(), DEFAULT_CONTEXT_LENGTH + 5);
        assert!(text.starts_with(&" ".repeat(DEFAULT_CONTEXT_LENGTH)));

        let err = sample_text(&model, &tokenizer, Some("xyz"), 5, Device::Cpu, &mut rng);
        assert!(err.is_err());
        Ok(())
    }
}
