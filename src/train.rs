use std::time::Instant;

use anyhow::{Context, anyhow};
use log::{debug, info};
use rand::{SeedableRng, rngs::StdRng};
use tch::{
    Device, Tensor,
    nn::{AdamW, Optimizer, OptimizerConfig, VarStore},
};

use crate::{
    config::Config,
    dataset::{Batch, DataSet},
    error::Split,
    generate,
    model::{MiniGPT, Mode},
    tokenizer::Tokenizer,
};

/// True after the step that completes each `log_interval`-sized stretch.
fn reports_progress(step: usize, log_interval: usize) -> bool {
    (step + 1) % log_interval == 0
}

/// Mean loss over `eval_iters` batches of each split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossEstimate {
    pub train: f64,
    pub validation: f64,
}

pub struct MiniGPTTrainer {
    var_store: VarStore,
    model: MiniGPT,
    optimizer: Optimizer,
    dataset: DataSet,
    config: Config,
    rng: StdRng,
}

impl MiniGPTTrainer {
    /// Validates the configuration against the data, seeds both random sources
    /// and initializes the parameters.
    pub fn new(
        device: Device,
        config: &Config,
        dataset: DataSet,
        vocab_size: usize,
    ) -> anyhow::Result<MiniGPTTrainer> {
        config.validate()?;
        dataset.check(config.block_size)?;
        tch::manual_seed(config.seed as i64);
        let var_store = VarStore::new(device);
        let model = MiniGPT::new(&var_store.root(), config, vocab_size)?;
        let optimizer = AdamW::default()
            .build(&var_store, config.learning_rate)
            .context("failed to create AdamW optimizer")?;
        Ok(MiniGPTTrainer {
            var_store,
            model,
            optimizer,
            dataset,
            config: config.clone(),
            rng: StdRng::seed_from_u64(config.seed),
        })
    }

    pub fn model(&self) -> &MiniGPT {
        &self.model
    }

    pub fn num_parameters(&self) -> usize {
        self.var_store
            .trainable_variables()
            .iter()
            .map(Tensor::numel)
            .sum()
    }

    /// Runs `max_iters` optimization steps, estimating the loss every `eval_interval`
    /// steps starting at step 0. Returns the estimates in order.
    pub fn train(&mut self) -> anyhow::Result<Vec<(usize, LossEstimate)>> {
        let mut history = Vec::new();
        let started = Instant::now();
        for step in 0..self.config.max_iters {
            if step % self.config.eval_interval == 0 {
                let losses = self.estimate_loss()?;
                println!(
                    "step={step}: train loss = {:.4}, val loss = {:.4}",
                    losses.train, losses.validation
                );
                history.push((step, losses));
            }
            let batch = self.dataset.sample(
                Split::Train,
                self.config.batch_size,
                self.config.block_size,
                &mut self.rng,
            )?;
            let loss = self.train_step(&batch)?;
            if reports_progress(step, self.config.log_interval) {
                info!(
                    "step {}/{}: batch loss = {loss:.4}, {:.1}s elapsed",
                    step + 1,
                    self.config.max_iters,
                    started.elapsed().as_secs_f64()
                );
            } else {
                debug!("step={step}: batch loss = {loss:.4}");
            }
        }
        info!("finished {} steps", self.config.max_iters);
        Ok(history)
    }

    /// Samples a continuation of `prompt` from the current model, drawing from the
    /// same seeded source as batch sampling.
    pub fn sample_text(
        &mut self,
        tokenizer: &Tokenizer,
        prompt: Option<&str>,
        max_new_tokens: usize,
    ) -> anyhow::Result<String> {
        generate::sample_text(
            &self.model,
            tokenizer,
            prompt,
            max_new_tokens,
            self.var_store.device(),
            &mut self.rng,
        )
    }

    /// Read-only: evaluation mode, no gradient tracking.
    pub fn estimate_loss(&mut self) -> anyhow::Result<LossEstimate> {
        let _guard = tch::no_grad_guard();
        Ok(LossEstimate {
            train: self.split_loss(Split::Train)?,
            validation: self.split_loss(Split::Validation)?,
        })
    }

    fn split_loss(&mut self, split: Split) -> anyhow::Result<f64> {
        let mut total_loss = 0.0;
        for _ in 0..self.config.eval_iters {
            let batch = self.dataset.sample(
                split,
                self.config.batch_size,
                self.config.block_size,
                &mut self.rng,
            )?;
            let loss = self.loss(&batch, Mode::Eval)?;
            total_loss += f64::try_from(&loss)?;
        }
        Ok(total_loss / self.config.eval_iters as f64)
    }

    fn loss(&self, batch: &Batch, mode: Mode) -> anyhow::Result<Tensor> {
        let (_logits, loss) = self
            .model
            .forward(&batch.inputs, Some(&batch.targets), mode)?;
        loss.ok_or_else(|| anyhow!("forward with targets returned no loss"))
    }

    /// One forward, clear, backward, update cycle. Returns the batch loss.
    fn train_step(&mut self, batch: &Batch) -> anyhow::Result<f64> {
        let loss = self.loss(batch, Mode::Train)?;
        self.optimizer.zero_grad();
        loss.backward();
        self.optimizer.step();
        Ok(f64::try_from(&loss)?)
    }
}
