use std::{ffi::CString, os::unix::ffi::OsStrExt, path::Path};

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use tch::Device;

mod config;
mod constants;
mod dataset;
mod error;
mod generate;
mod logger;
mod model;
mod tokenizer;
mod train;

use config::Args;
use dataset::DataSet;
use error::Split;
use train::MiniGPTTrainer;

/// libtorch loads its CUDA backend lazily, so `Cuda::is_available` can report false
/// until the library is opened by hand.
fn load_cuda_library(path: &Path) -> Result<()> {
    let path_c = CString::new(path.as_os_str().as_bytes())?;
    let handle = unsafe { libc::dlopen(path_c.as_ptr(), libc::RTLD_LAZY) };
    if handle.is_null() {
        warn!("could not load {}", path.display());
    } else {
        info!("loaded {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init(args.log_level)?;

    if let Some(path) = &args.cuda_library {
        load_cuda_library(path)?;
    }
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    println!("Using device: {device:?}");

    let config = args.config(device);
    config.validate()?;
    println!("{}", config.summary());

    let (tokenizer, dataset) = DataSet::load(&args.corpus, device)?;
    info!(
        "vocabulary of {} characters, {} train / {} val tokens",
        tokenizer.vocab_size(),
        dataset.len(Split::Train),
        dataset.len(Split::Validation)
    );

    let mut trainer = MiniGPTTrainer::new(device, &config, dataset, tokenizer.vocab_size())?;
    println!("{} parameters", trainer.num_parameters());
    info!(
        "model: {} blocks over a {}-token vocabulary, context {}",
        config.num_layers,
        trainer.model().vocab_size(),
        trainer.model().block_size()
    );
    trainer.train()?;

    let text = trainer.sample_text(&tokenizer, args.prompt.as_deref(), args.max_new_tokens)?;
    println!("{text}");
    Ok(())
}
