use anyhow::{ensure, Result};
use candle_core::Tensor;

/// Reshape a `(seq_len, width)` table so it broadcasts against `x`.
///
/// The table's two axes are aligned with axis 1 and the last axis of `x`;
/// every other axis gets size 1. `freqs` must have shape
/// `(x.dim(1), x.dim(-1))` and `x` must have at least 2 dimensions.
/// A contiguous `freqs` is returned as a view without copying.
pub fn reshape_for_broadcast(freqs: &Tensor, x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let rank = dims.len();
    ensure!(
        rank >= 2,
        "broadcast target must have at least 2 dims, got shape {:?}",
        dims
    );

    let expected = [dims[1], dims[rank - 1]];
    ensure!(
        freqs.dims() == expected.as_slice(),
        "shape mismatch: freqs has shape {:?}, expected {:?} for target {:?}",
        freqs.dims(),
        expected,
        dims
    );

    let shape: Vec<usize> = dims
        .iter()
        .enumerate()
        .map(|(i, &d)| if i == 1 || i == rank - 1 { d } else { 1 })
        .collect();
    Ok(freqs.reshape(shape)?)
}
