use anyhow::Context;
use clap::Parser;
use gujju_gpt::config::{TrainArgs, TrainConfig};
use gujju_gpt::data::{Dataset, TokenSplit};
use gujju_gpt::events::EventWriter;
use gujju_gpt::model::ModelConfig;
use gujju_gpt::train::training_loop;

fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = TrainArgs::parse();
    let train_cfg = TrainConfig::from(&args);
    let model_cfg = match &args.model_config {
        Some(path) => ModelConfig::load(path)?,
        None => ModelConfig::default(),
    };

    let dev = args
        .device
        .to_device()
        .with_context(|| format!("failed to open device {}", args.device))?;

    let train_data = TokenSplit::load(&args.train_data)?;
    let val_data = TokenSplit::load(&args.val_data)?;
    let mut ds = Dataset::new(
        train_data,
        val_data,
        model_cfg.max_len,
        model_cfg.vocab_size,
        args.seed,
    )?;

    let mut events = EventWriter::create(args.log_dir.as_deref())?;
    let report = training_loop(&mut ds, &train_cfg, &model_cfg, &dev, &mut events)?;
    tracing::info!(
        final_train_loss = report.final_train_loss(),
        final_val_loss = report.final_val_loss(),
        "training finished"
    );
    Ok(())
}
