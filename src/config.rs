//! Command line arguments and run configuration.

use anyhow::{bail, Context};
use candle_core::Device;
use clap::Parser;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::model::ModelConfig;

/// Where tensors live during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceArg {
    /// CUDA device 0 when available, CPU otherwise.
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl FromStr for DeviceArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let ordinal = |rest: &str| -> Result<usize, String> {
            if rest.is_empty() {
                return Ok(0);
            }
            rest.strip_prefix(':')
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| format!("invalid device ordinal in {s:?}"))
        };
        match s.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            _ if s.starts_with("cuda") => ordinal(&s[4..]).map(Self::Cuda),
            _ if s.starts_with("metal") => ordinal(&s[5..]).map(Self::Metal),
            _ => Err(format!("unknown device {s:?}, expected auto, cpu, cuda[:N] or metal[:N]")),
        }
    }
}

impl std::fmt::Display for DeviceArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(n) => write!(f, "cuda:{n}"),
            Self::Metal(n) => write!(f, "metal:{n}"),
        }
    }
}

impl DeviceArg {
    pub fn to_device(self) -> candle_core::Result<Device> {
        match self {
            Self::Auto => Device::cuda_if_available(0),
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(n) => Device::new_cuda(n),
            Self::Metal(n) => Device::new_metal(n),
        }
    }
}

/// Train a decoder-only transformer on pre-tokenized arrays.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct TrainArgs {
    /// Path to training tokens (.npy, .u16/.bin, .u32 or .gz)
    #[arg(long = "train_data")]
    pub train_data: PathBuf,

    /// Path to validation tokens
    #[arg(long = "val_data")]
    pub val_data: PathBuf,

    #[arg(long = "batch_size", default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long = "learning_rate", default_value_t = 0.001)]
    pub learning_rate: f64,

    /// Number of iterations, each on one randomly sampled batch
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,

    #[arg(long, default_value = "auto")]
    pub device: DeviceArg,

    /// JSON file with the model hyperparameters
    #[arg(long = "model_config")]
    pub model_config: Option<PathBuf>,

    /// Run validation every N iterations
    #[arg(long = "eval_interval", default_value_t = 2)]
    pub eval_interval: usize,

    #[arg(long, default_value = "gujju-gpt.safetensors")]
    pub output: PathBuf,

    /// Directory for the scalar event log, defaults to runs/<timestamp>
    #[arg(long = "log_dir")]
    pub log_dir: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,
}

/// Settings of a training run, independent of how they were parsed.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub epochs: usize,
    pub eval_interval: usize,
    pub output: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            learning_rate: 1e-3,
            epochs: 10,
            eval_interval: 2,
            output: PathBuf::from("gujju-gpt.safetensors"),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if self.eval_interval == 0 {
            bail!("eval interval must be positive");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.) {
            bail!("learning rate must be a positive number, got {}", self.learning_rate);
        }
        Ok(())
    }

    /// Path of the model config written next to the weights.
    pub fn config_path(&self) -> PathBuf {
        self.output.with_extension("json")
    }
}

impl From<&TrainArgs> for TrainConfig {
    fn from(args: &TrainArgs) -> Self {
        Self {
            batch_size: args.batch_size,
            learning_rate: args.learning_rate,
            epochs: args.epochs,
            eval_interval: args.eval_interval,
            output: args.output.clone(),
        }
    }
}

impl ModelConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open model config {}", path.display()))?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse model config {}", path.display()))?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}
