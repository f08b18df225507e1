use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

/// Target id that is excluded from the loss, the unsigned image of `-1`.
pub const IGNORE_INDEX: u32 = u32::MAX;

/// Mean cross-entropy over `logits` [.., vocab] and `targets` [..], skipping
/// positions whose target is `ignore_index`.
pub fn cross_entropy_ignore(logits: &Tensor, targets: &Tensor, ignore_index: u32) -> Result<Tensor> {
    let vocab = logits.dim(D::Minus1)?;
    let logits = logits.reshape(((), vocab))?;
    let targets = targets.flatten_all()?;
    if logits.dim(0)? != targets.dim(0)? {
        candle_core::bail!(
            "logits have {} positions but targets have {}",
            logits.dim(0)?,
            targets.dim(0)?
        )
    }

    let keep = targets.ne(ignore_index)?;
    let safe_targets = keep.where_cond(&targets, &targets.zeros_like()?)?;
    let keep = keep.to_dtype(DType::F32)?;
    let kept = keep.sum_all()?.to_scalar::<f32>()?;
    if kept == 0. {
        candle_core::bail!("every target in the batch is the ignore index")
    }

    let log_probs = ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs
        .gather(&safe_targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    nll.mul(&keep)?.sum_all()? / kept as f64
}
