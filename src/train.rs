use crate::config::TrainConfig;
use crate::data::{Batch, Dataset, Split};
use crate::events::EventWriter;
use crate::loss::{cross_entropy_ignore, IGNORE_INDEX};
use crate::model::{ModelConfig, TransformerDecoder};
use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use std::path::PathBuf;
use tracing::{debug, info};

/// Loss curves and artifacts of a finished run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub train_losses: Vec<f32>,
    /// `(epoch, loss)` for every validation pass.
    pub val_losses: Vec<(usize, f32)>,
    pub weights_path: PathBuf,
    pub config_path: PathBuf,
}

impl TrainReport {
    pub fn final_train_loss(&self) -> Option<f32> {
        self.train_losses.last().copied()
    }

    pub fn final_val_loss(&self) -> Option<f32> {
        self.val_losses.last().map(|(_, l)| *l)
    }
}

fn batch_loss(model: &TransformerDecoder, batch: &Batch, train: bool) -> candle_core::Result<Tensor> {
    let logits = model.forward(&batch.inputs, train)?;
    cross_entropy_ignore(&logits, &batch.targets, IGNORE_INDEX)
}

fn num_parameters(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|v| v.as_tensor().elem_count())
        .sum()
}

pub fn training_loop(
    ds: &mut Dataset,
    cfg: &TrainConfig,
    model_cfg: &ModelConfig,
    dev: &Device,
    events: &mut EventWriter,
) -> anyhow::Result<TrainReport> {
    cfg.validate()?;
    if ds.block_size() != model_cfg.max_len {
        bail!(
            "dataset block size {} does not match the model context window {}",
            ds.block_size(),
            model_cfg.max_len
        );
    }

    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let model = TransformerDecoder::new(model_cfg, vs)?;
    info!(
        parameters = num_parameters(&varmap),
        device = ?dev,
        "transformer decoder initialized"
    );

    let params = ParamsAdamW {
        lr: cfg.learning_rate,
        weight_decay: 0.0,
        ..Default::default()
    };
    let mut optim = AdamW::new(varmap.all_vars(), params)?;

    let mut train_losses = Vec::with_capacity(cfg.epochs);
    let mut val_losses = Vec::new();

    info!(epochs = cfg.epochs, batch_size = cfg.batch_size, "starting training");
    for epoch in 0..cfg.epochs {
        let batch = ds.get_batch(Split::Train, cfg.batch_size, dev)?;
        debug!(shape = ?batch.inputs.dims(), "train batch");
        let loss = batch_loss(&model, &batch, true)?;
        let train_loss = loss.to_vec0::<f32>()?;
        if !train_loss.is_finite() {
            bail!("training diverged at epoch {epoch}: loss is {train_loss}");
        }
        optim.backward_step(&loss)?;

        info!(epoch, train_loss, "train step");
        events.add_scalar("Loss/Train", train_loss, epoch)?;
        train_losses.push(train_loss);

        // one validation step, no optimizer update
        if epoch % cfg.eval_interval == 0 {
            let val_batch = ds.get_batch(Split::Val, cfg.batch_size, dev)?;
            let val_loss = batch_loss(&model, &val_batch, false)?.to_vec0::<f32>()?;
            info!(epoch, val_loss, "validation");
            events.add_scalar("Loss/Validation", val_loss, epoch)?;
            val_losses.push((epoch, val_loss));
        }
    }

    let weights_path = cfg.output.clone();
    let config_path = cfg.config_path();
    if let Some(parent) = weights_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    varmap
        .save(&weights_path)
        .with_context(|| format!("failed to save weights to {}", weights_path.display()))?;
    model_cfg.save(&config_path)?;
    events.close()?;
    info!(weights = %weights_path.display(), config = %config_path.display(), "saved model");

    Ok(TrainReport {
        train_losses,
        val_losses,
        weights_path,
        config_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TokenSplit;

    fn tiny_model() -> ModelConfig {
        ModelConfig {
            vocab_size: 8,
            d_model: 16,
            num_heads: 2,
            num_layers: 1,
            d_ff: 32,
            max_len: 6,
            dropout: 0.0,
        }
    }

    fn cyclic(n: usize) -> TokenSplit {
        TokenSplit::from_tokens((0..n).map(|i| (i % 8) as u32).collect())
    }

    #[test]
    fn validates_at_the_configured_interval() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let model_cfg = tiny_model();
        let mut ds = Dataset::new(cyclic(200), cyclic(50), model_cfg.max_len, 8, Some(1))?;
        let cfg = TrainConfig {
            batch_size: 2,
            learning_rate: 1e-3,
            epochs: 7,
            eval_interval: 3,
            output: dir.path().join("w.safetensors"),
        };
        let report = training_loop(&mut ds, &cfg, &model_cfg, &Device::Cpu, &mut EventWriter::disabled())?;
        assert_eq!(report.train_losses.len(), 7);
        let epochs: Vec<usize> = report.val_losses.iter().map(|(e, _)| *e).collect();
        assert_eq!(epochs, vec![0, 3, 6]);
        assert!(report.weights_path.exists());
        assert!(report.config_path.exists());
        Ok(())
    }

    #[test]
    fn rejects_mismatched_block_size() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ds = Dataset::new(cyclic(100), cyclic(100), 4, 8, None)?;
        let cfg = TrainConfig {
            output: dir.path().join("w.safetensors"),
            ..TrainConfig::default()
        };
        let res = training_loop(&mut ds, &cfg, &tiny_model(), &Device::Cpu, &mut EventWriter::disabled());
        assert!(res.is_err());
        Ok(())
    }

    #[test]
    fn saved_weights_load_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let model_cfg = tiny_model();
        let mut ds = Dataset::new(cyclic(100), cyclic(100), model_cfg.max_len, 8, Some(3))?;
        let cfg = TrainConfig {
            batch_size: 2,
            epochs: 2,
            output: dir.path().join("nested").join("w.safetensors"),
            ..TrainConfig::default()
        };
        let report = training_loop(&mut ds, &cfg, &model_cfg, &Device::Cpu, &mut EventWriter::disabled())?;

        let loaded_cfg = ModelConfig::load(&report.config_path)?;
        assert_eq!(loaded_cfg, model_cfg);
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _model = TransformerDecoder::new(&loaded_cfg, vb)?;
        varmap.load(&report.weights_path)?;
        Ok(())
    }
}
