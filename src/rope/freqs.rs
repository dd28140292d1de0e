use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device, Tensor};

pub const BASE_THETA: f32 = 10_000.0;

/// Per-pair frequencies `theta^(-2d / head_dim)` for `d in 0..head_dim/2`.
///
/// The exponent is normalised by the full `head_dim`, not by the pair count.
pub fn inverse_frequencies(head_dim: usize, theta: f32) -> Vec<f32> {
    (0..head_dim / 2)
        .map(|d| theta.powf(-((2 * d) as f32 / head_dim as f32)))
        .collect()
}

/// cos/sin tables with shape (seq_len, head_dim/2), always stored as f32.
#[derive(Debug, Clone)]
pub struct RopeTables {
    cos: Tensor,
    sin: Tensor,
}

impl RopeTables {
    pub fn new(seq_len: usize, head_dim: usize, theta: f32, device: &Device) -> Result<Self> {
        ensure!(seq_len > 0, "sequence length must be non-zero");
        ensure!(
            head_dim > 0 && head_dim.is_multiple_of(2),
            "head_dim must be even and non-zero, got {}",
            head_dim
        );
        ensure!(
            theta.is_finite() && theta > 0.0,
            "theta must be a positive finite number, got {}",
            theta
        );
        let half_dim = head_dim / 2;

        let inv_freq = Tensor::from_vec(inverse_frequencies(head_dim, theta), (1, half_dim), device)?;
        let end = u32::try_from(seq_len)
            .with_context(|| format!("sequence length {} does not fit in u32", seq_len))?;
        let positions = Tensor::arange(0u32, end, device)?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;

        // angles[pos, d] = pos * inv_freq[d]
        let angles = positions.broadcast_mul(&inv_freq)?;

        Ok(Self {
            cos: angles.cos()?,
            sin: angles.sin()?,
        })
    }

    /// Rows `[offset, offset + len)` of both tables.
    pub fn narrow(&self, offset: usize, len: usize) -> Result<Self> {
        ensure!(
            offset
                .checked_add(len)
                .is_some_and(|end| end <= self.seq_len()),
            "position range [{}, {}+{}) exceeds table length {}",
            offset,
            offset,
            len,
            self.seq_len()
        );
        Ok(Self {
            cos: self.cos.narrow(0, offset, len)?,
            sin: self.sin.narrow(0, offset, len)?,
        })
    }

    pub fn cos(&self) -> &Tensor {
        &self.cos
    }

    pub fn sin(&self) -> &Tensor {
        &self.sin
    }

    pub fn seq_len(&self) -> usize {
        self.cos.dims()[0]
    }

    pub fn half_dim(&self) -> usize {
        self.cos.dims()[1]
    }
}
