use candle_core::{Device, Module, Result, Tensor, D};
use candle_nn::{embedding, linear, Dropout, Embedding, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

/// Hyperparameters of the decoder. `max_len` doubles as the training block size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub d_ff: usize,
    pub max_len: usize,
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 512,
            d_model: 256,
            num_heads: 8,
            num_layers: 4,
            d_ff: 1024,
            max_len: 128,
            dropout: 0.2,
        }
    }
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads
    }
}

/// Layer norm built from primitive ops so gradients flow through it.
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.))?;
        Ok(Self { weight, bias, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (var + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&denom)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.d_model;
        Ok(Self {
            q_proj: linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: linear(dim, dim, vb.pp("out_proj"))?,
            attn_dropout: Dropout::new(cfg.dropout),
            resid_dropout: Dropout::new(cfg.dropout),
            num_heads: cfg.num_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// x: [batch, seq, d_model], mask: [seq, seq] with -inf above the diagonal
    fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq_len, dim) = x.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(x)?, batch, seq_len)?;
        let k = self.split_heads(&self.k_proj.forward(x)?, batch, seq_len)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, batch, seq_len)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? / scale)?;
        let scores = scores.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let weights = self.attn_dropout.forward(&weights, train)?;

        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, dim))?;
        self.resid_dropout
            .forward(&self.out_proj.forward(&out)?, train)
    }
}

struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    dropout: Dropout,
}

impl FeedForward {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let linear1 = linear(cfg.d_model, cfg.d_ff, vb.pp("linear1"))?;
        let linear2 = linear(cfg.d_ff, cfg.d_model, vb.pp("linear2"))?;
        Ok(Self {
            linear1,
            linear2,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.linear1.forward(x)?.relu()?;
        self.dropout.forward(&self.linear2.forward(&out)?, train)
    }
}

struct DecoderBlock {
    norm1: LayerNorm,
    attn: CausalSelfAttention,
    norm2: LayerNorm,
    ffn: FeedForward,
}

impl DecoderBlock {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: LayerNorm::new(cfg.d_model, 1e-5, vb.pp("norm1"))?,
            attn: CausalSelfAttention::new(cfg, vb.pp("attn"))?,
            norm2: LayerNorm::new(cfg.d_model, 1e-5, vb.pp("norm2"))?,
            ffn: FeedForward::new(cfg, vb.pp("ffn"))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let x = self
            .attn
            .forward(&self.norm1.forward(x)?, mask, train)?
            .add(x)?;
        self.ffn.forward(&self.norm2.forward(&x)?, train)?.add(&x)
    }
}

fn causal_mask(size: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..size)
        .flat_map(|i| (0..size).map(move |j| if j > i { f32::NEG_INFINITY } else { 0. }))
        .collect();
    Tensor::from_vec(mask, (size, size), device)
}

/// Decoder-only transformer language model.
pub struct TransformerDecoder {
    token_emb: Embedding,
    pos_emb: Embedding,
    emb_dropout: Dropout,
    layers: Vec<DecoderBlock>,
    norm: LayerNorm,
    to_logits: Linear,
    mask: Tensor,
    max_len: usize,
}

impl TransformerDecoder {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        for (name, size) in [
            ("vocab_size", cfg.vocab_size),
            ("d_model", cfg.d_model),
            ("num_layers", cfg.num_layers),
            ("d_ff", cfg.d_ff),
            ("max_len", cfg.max_len),
        ] {
            if size == 0 {
                candle_core::bail!("{name} must be positive")
            }
        }
        if cfg.num_heads == 0 || cfg.d_model % cfg.num_heads != 0 {
            candle_core::bail!(
                "d_model {} is not divisible by num_heads {}",
                cfg.d_model,
                cfg.num_heads
            )
        }
        if !(0.0..1.0).contains(&cfg.dropout) {
            candle_core::bail!("dropout {} must be in [0, 1)", cfg.dropout)
        }
        let token_emb = embedding(cfg.vocab_size, cfg.d_model, vb.pp("token_emb"))?;
        let pos_emb = embedding(cfg.max_len, cfg.d_model, vb.pp("pos_emb"))?;
        let layers = (0..cfg.num_layers)
            .map(|i| DecoderBlock::new(cfg, vb.pp(format!("block{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNorm::new(cfg.d_model, 1e-5, vb.pp("norm"))?;
        let to_logits = linear(cfg.d_model, cfg.vocab_size, vb.pp("to_logits"))?;
        let mask = causal_mask(cfg.max_len, vb.device())?;

        Ok(Self {
            token_emb,
            pos_emb,
            emb_dropout: Dropout::new(cfg.dropout),
            layers,
            norm,
            to_logits,
            mask,
            max_len: cfg.max_len,
        })
    }

    /// x: [batch, seq] token ids -> [batch, seq, vocab_size] logits.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch, seq_len) = x.dims2()?;
        if seq_len > self.max_len {
            candle_core::bail!(
                "sequence length {seq_len} exceeds the context window {}",
                self.max_len
            )
        }
        let positions = Tensor::arange(0u32, seq_len as u32, x.device())?;
        let tok = self.token_emb.forward(x)?;
        let pos = self.pos_emb.forward(&positions)?;
        let mut out = self
            .emb_dropout
            .forward(&tok.broadcast_add(&pos)?, train)?;

        let mask = self.mask.narrow(0, 0, seq_len)?.narrow(1, 0, seq_len)?;
        for block in self.layers.iter() {
            out = block.forward(&out, &mask, train)?;
        }

        let out = self.norm.forward(&out)?;
        self.to_logits.forward(&out)
    }
}
