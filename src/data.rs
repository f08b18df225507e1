use anyhow::{bail, Context};
use candle_core::{Device, Tensor};
use flate2::bufread::GzDecoder;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

use crate::npy;

fn extract_gz(path: &Path) -> anyhow::Result<Vec<u8>> {
    let file = File::open(path)?;
    let bufreader = BufReader::new(file);
    let mut gz = GzDecoder::new(bufreader);
    let mut bytes = Vec::new();
    gz.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn read_raw_tokens(path: &Path, width: usize) -> anyhow::Result<Vec<u32>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % width != 0 {
        bail!(
            "file size {} is not a multiple of the {width}-byte token width",
            bytes.len()
        );
    }
    let tokens = match width {
        2 => bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
            .collect(),
        _ => bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    };
    Ok(tokens)
}

/// A flat sequence of token ids for one split of the corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSplit {
    tokens: Vec<u32>,
}

impl TokenSplit {
    pub fn from_tokens(tokens: Vec<u32>) -> Self {
        Self { tokens }
    }

    /// Loads a split, picking the decoder from the file extension.
    ///
    /// `.npy` arrays of any integer dtype are accepted, `.u16`/`.bin` and
    /// `.u32` are raw little-endian dumps, and `.gz` is a compressed byte corpus where
    /// every byte is one token.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let tokens = match ext.as_str() {
            "npy" => npy::read_tokens(path),
            "u16" | "bin" => read_raw_tokens(path, 2),
            "u32" => read_raw_tokens(path, 4),
            "gz" => extract_gz(path).map(|bytes| bytes.into_iter().map(u32::from).collect()),
            other => bail!("unsupported token file extension {other:?}"),
        }
        .with_context(|| format!("failed to load tokens from {}", path.display()))?;

        tracing::info!(path = %path.display(), tokens = tokens.len(), "loaded token split");
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn max_token(&self) -> Option<u32> {
        self.tokens.iter().copied().max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Val => write!(f, "val"),
        }
    }
}

/// Input windows and their next-token targets, both `(batch_size, block_size)`.
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

pub struct Dataset {
    train_data: TokenSplit,
    val_data: TokenSplit,
    block_size: usize,
    rng: StdRng,
}

impl Dataset {
    pub fn new(
        train_data: TokenSplit,
        val_data: TokenSplit,
        block_size: usize,
        vocab_size: usize,
        seed: Option<u64>,
    ) -> anyhow::Result<Self> {
        if block_size == 0 {
            bail!("block size must be positive");
        }
        for (split, data) in [(Split::Train, &train_data), (Split::Val, &val_data)] {
            // a window needs block_size inputs plus one shifted target
            if data.len() <= block_size {
                bail!(
                    "{split} split has {} tokens, needs more than the block size {block_size}",
                    data.len()
                );
            }
            if let Some(max) = data.max_token() {
                if max as usize >= vocab_size {
                    bail!("{split} split contains token id {max}, vocab size is {vocab_size}");
                }
            }
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            train_data,
            val_data,
            block_size,
            rng,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn split(&self, split: Split) -> &TokenSplit {
        match split {
            Split::Train => &self.train_data,
            Split::Val => &self.val_data,
        }
    }

    pub fn get_batch(
        &mut self,
        split: Split,
        batch_size: usize,
        device: &Device,
    ) -> anyhow::Result<Batch> {
        let block_size = self.block_size;
        let mut inputs: Vec<u32> = Vec::with_capacity(batch_size * block_size);
        let mut targets: Vec<u32> = Vec::with_capacity(batch_size * block_size);
        for _ in 0..batch_size {
            let idx = self.sample_offset(split);
            let data = self.split(split).tokens();
            inputs.extend_from_slice(&data[idx..idx + block_size]);
            targets.extend_from_slice(&data[idx + 1..idx + 1 + block_size]);
        }
        let inputs = Tensor::from_vec(inputs, (batch_size, block_size), device)?;
        let targets = Tensor::from_vec(targets, (batch_size, block_size), device)?;
        Ok(Batch { inputs, targets })
    }

    fn sample_offset(&mut self, split: Split) -> usize {
        let len = self.split(split).len();
        self.rng.gen_range(0..(len - self.block_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npy::tests::npy_bytes;
    use candle_core::DType;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn ramp(n: u32) -> TokenSplit {
        TokenSplit::from_tokens((0..n).collect())
    }

    #[test]
    fn batch_shapes_match_config() -> anyhow::Result<()> {
        let mut ds = Dataset::new(ramp(100), ramp(40), 8, 128, Some(0))?;
        let batch = ds.get_batch(Split::Train, 4, &Device::Cpu)?;
        assert_eq!(batch.inputs.dims(), &[4, 8]);
        assert_eq!(batch.targets.dims(), &[4, 8]);
        assert_eq!(batch.inputs.dtype(), DType::U32);
        Ok(())
    }

    #[test]
    fn targets_are_inputs_shifted_by_one() -> anyhow::Result<()> {
        let mut ds = Dataset::new(ramp(64), ramp(64), 5, 64, Some(7))?;
        for split in [Split::Train, Split::Val] {
            let batch = ds.get_batch(split, 3, &Device::Cpu)?;
            let x = batch.inputs.to_vec2::<u32>()?;
            let y = batch.targets.to_vec2::<u32>()?;
            for (xr, yr) in x.iter().zip(y.iter()) {
                for (a, b) in xr.iter().zip(yr.iter()) {
                    assert_eq!(a + 1, *b);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn windows_stay_in_bounds() -> anyhow::Result<()> {
        // smallest legal split: exactly one valid offset
        let mut ds = Dataset::new(ramp(9), ramp(9), 8, 16, None)?;
        for _ in 0..20 {
            let batch = ds.get_batch(Split::Val, 2, &Device::Cpu)?;
            assert_eq!(batch.targets.to_vec2::<u32>()?[0][7], 8);
        }
        Ok(())
    }

    #[test]
    fn rejects_short_split() {
        let err = Dataset::new(ramp(100), ramp(8), 8, 128, None).err().unwrap();
        assert!(err.to_string().contains("val split"));
    }

    #[test]
    fn rejects_out_of_vocab_tokens() {
        let err = Dataset::new(ramp(100), ramp(40), 8, 50, None).err().unwrap();
        assert!(err.to_string().contains("token id 99"));
    }

    #[test]
    fn same_seed_same_batches() -> anyhow::Result<()> {
        let mut a = Dataset::new(ramp(500), ramp(500), 16, 512, Some(42))?;
        let mut b = Dataset::new(ramp(500), ramp(500), 16, 512, Some(42))?;
        let xa = a.get_batch(Split::Train, 4, &Device::Cpu)?.inputs.to_vec2::<u32>()?;
        let xb = b.get_batch(Split::Train, 4, &Device::Cpu)?.inputs.to_vec2::<u32>()?;
        assert_eq!(xa, xb);
        Ok(())
    }

    #[test]
    fn loads_npy_arrays() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.npy");
        Tensor::new(&[3i64, 1, 4, 1, 5, 9], &Device::Cpu)?.write_npy(&path)?;
        let split = TokenSplit::load(&path)?;
        assert_eq!(split.tokens(), &[3, 1, 4, 1, 5, 9]);
        Ok(())
    }

    #[test]
    fn rejects_negative_npy_tokens() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.npy");
        Tensor::new(&[1i64, -1, 2], &Device::Cpu)?.write_npy(&path)?;
        let err = TokenSplit::load(&path).err().unwrap();
        assert!(format!("{err:#}").contains("position 1"));
        Ok(())
    }

    #[test]
    fn loads_narrow_integer_npy_arrays() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let p16 = dir.path().join("train.npy");
        let payload: Vec<u8> = [10u16, 20, 30].iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(&p16, npy_bytes("<u2", &[3], &payload))?;
        assert_eq!(TokenSplit::load(&p16)?.tokens(), &[10, 20, 30]);

        let p32 = dir.path().join("valid.npy");
        let payload: Vec<u8> = [1i32, 2, 70_000].iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(&p32, npy_bytes("<i4", &[3], &payload))?;
        assert_eq!(TokenSplit::load(&p32)?.tokens(), &[1, 2, 70_000]);
        Ok(())
    }

    #[test]
    fn rejects_fractional_float_npy_tokens() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("floats.npy");
        Tensor::new(&[1f32, 2.7], &Device::Cpu)?.write_npy(&path)?;
        assert!(TokenSplit::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn loads_raw_dumps() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let p16 = dir.path().join("val.u16");
        std::fs::write(&p16, [1u8, 0, 0, 1])?;
        assert_eq!(TokenSplit::load(&p16)?.tokens(), &[1, 256]);

        let p32 = dir.path().join("val.u32");
        std::fs::write(&p32, [2u8, 0, 0, 0, 0, 0, 1, 0])?;
        assert_eq!(TokenSplit::load(&p32)?.tokens(), &[2, 65536]);

        let odd = dir.path().join("odd.u32");
        std::fs::write(&odd, [1u8, 2, 3])?;
        assert!(TokenSplit::load(&odd).is_err());
        Ok(())
    }

    #[test]
    fn loads_gzip_byte_corpus() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("input.txt.gz");
        let mut enc = GzEncoder::new(File::create(&path)?, Compression::default());
        enc.write_all(b"abc")?;
        enc.finish()?;
        assert_eq!(TokenSplit::load(&path)?.tokens(), &[97, 98, 99]);
        Ok(())
    }

    #[test]
    fn unknown_extension_is_an_error() {
        assert!(TokenSplit::load("corpus.txt").is_err());
    }
}
