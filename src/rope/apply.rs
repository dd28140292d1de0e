use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, D};
use tracing::{debug, trace};

use super::broadcast::reshape_for_broadcast;
use super::freqs::RopeTables;

/// Rotate adjacent feature pairs of `x` by the given angle tables.
///
/// `x` is `(batch, seq_len, heads, head_dim)`; `cos` and `sin` are
/// `(seq_len, head_dim/2)`. Feature `2i` is treated as the real part and
/// `2i + 1` as the imaginary part of pair `i`:
///
/// ```text
/// out[2i]     = cos * x[2i] - sin * x[2i+1]
/// out[2i + 1] = sin * x[2i] + cos * x[2i+1]
/// ```
///
/// Math runs in f32; the result is cast back to the dtype of `x`.
pub fn rotate_pairs(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, heads, head_dim) = x.dims4()?;
    ensure!(
        head_dim > 0 && head_dim.is_multiple_of(2),
        "head_dim must be even and non-zero, got {}",
        head_dim
    );
    let half = head_dim / 2;
    let in_dtype = x.dtype();

    // (B, S, H, D) -> (B, S, H, D/2, 2) keeps every pair inside its own (b, s, h) row
    let pairs = x
        .to_dtype(DType::F32)?
        .reshape((batch, seq_len, heads, half, 2))?;
    let real = pairs.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
    let imag = pairs.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;

    let cos = reshape_for_broadcast(&cos.to_dtype(DType::F32)?, &real)?;
    let sin = reshape_for_broadcast(&sin.to_dtype(DType::F32)?, &real)?;

    let out_real = real
        .broadcast_mul(&cos)?
        .sub(&imag.broadcast_mul(&sin)?)?;
    let out_imag = real
        .broadcast_mul(&sin)?
        .add(&imag.broadcast_mul(&cos)?)?;

    // Stack on a fresh trailing axis so re-interleaving never mixes rows.
    let out = Tensor::stack(&[&out_real, &out_imag], D::Minus1)?
        .reshape((batch, seq_len, heads, head_dim))?;
    Ok(out.to_dtype(in_dtype)?)
}

/// Apply rotary embeddings to a query/key pair.
///
/// `query` is `(batch, seq_len, n_heads, head_dim)` and `key` is
/// `(batch, seq_len, n_kv_heads, head_dim)`. Angles are computed for the
/// query's actual sequence length; `max_seq_len` does not bound the
/// computation. Use [`crate::rope::RotaryEmbedding`] to reuse tables
/// across calls.
pub fn apply_rotary_emb(
    query: &Tensor,
    key: &Tensor,
    head_dim: usize,
    max_seq_len: usize,
    theta: f32,
) -> Result<(Tensor, Tensor)> {
    let (_, seq_len, _, q_dim) = query.dims4()?;
    let (_, k_seq_len, _, k_dim) = key.dims4()?;

    ensure!(
        q_dim == head_dim,
        "query head_dim mismatch: expected {}, got {}",
        head_dim,
        q_dim
    );
    ensure!(
        k_dim == head_dim,
        "key head_dim mismatch: expected {}, got {}",
        head_dim,
        k_dim
    );
    ensure!(
        k_seq_len == seq_len,
        "query and key sequence lengths differ: {} vs {}",
        seq_len,
        k_seq_len
    );

    if seq_len > max_seq_len {
        debug!(seq_len, max_seq_len, "sequence longer than max_seq_len");
    }

    let tables = RopeTables::new(seq_len, head_dim, theta, query.device())?;
    trace!(seq_len, head_dim, theta, "applying rotary embedding");

    let query_out = rotate_pairs(query, tables.cos(), tables.sin())?;
    let key_out = rotate_pairs(key, tables.cos(), tables.sin())?;
    Ok((query_out, key_out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rope::freqs::BASE_THETA;
    use candle_core::Device;

    #[test]
    fn rotates_single_pair_by_position_angle() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // one head, two positions, head_dim = 2: pair (1, 0) at each position
        let x = Tensor::from_vec(vec![1f32, 0., 1., 0.], (1, 2, 1, 2), &device)?;
        let (q, k) = apply_rotary_emb(&x, &x, 2, 2, BASE_THETA)?;

        let q = q.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(&q[..2], &[1.0, 0.0]);
        // position 1, frequency 1: rotate (1, 0) by one radian
        assert!((q[2] - 1f32.cos()).abs() < 1e-6, "got {}", q[2]);
        assert!((q[3] - 1f32.sin()).abs() < 1e-6, "got {}", q[3]);
        assert_eq!(k.flatten_all()?.to_vec1::<f32>()?, q);
        Ok(())
    }

    #[test]
    fn pairs_stay_within_their_head() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // a single non-zero feature at (b=1, s=1, h=1, d=0) of a (2, 2, 3, 4) tensor
        let mut data = vec![0f32; 2 * 2 * 3 * 4];
        let idx = ((2 + 1) * 3 + 1) * 4;
        data[idx] = 2.0;
        let x = Tensor::from_vec(data, (2, 2, 3, 4), &device)?;

        let (q, _) = apply_rotary_emb(&x, &x, 4, 2, BASE_THETA)?;
        let out = q.flatten_all()?.to_vec1::<f32>()?;
        for (i, v) in out.iter().enumerate() {
            if i == idx || i == idx + 1 {
                continue;
            }
            assert_eq!(*v, 0.0, "value leaked to index {i}");
        }
        assert!((out[idx] - 2.0 * 1f32.cos()).abs() < 1e-6);
        assert!((out[idx + 1] - 2.0 * 1f32.sin()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn supports_different_head_counts() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 6, 8, 16), &device)?;
        let k = Tensor::randn(0f32, 1.0, (2, 6, 2, 16), &device)?;
        let (q_out, k_out) = apply_rotary_emb(&q, &k, 16, 32, BASE_THETA)?;
        assert_eq!(q_out.dims(), q.dims());
        assert_eq!(k_out.dims(), k.dims());
        Ok(())
    }

    #[test]
    fn keeps_input_dtype() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 3, 2, 8), &device)?.to_dtype(DType::BF16)?;
        let (q_out, k_out) = apply_rotary_emb(&q, &q, 8, 3, BASE_THETA)?;
        assert_eq!(q_out.dtype(), DType::BF16);
        assert_eq!(k_out.dtype(), DType::BF16);
        Ok(())
    }

    #[test]
    fn sequence_longer_than_max_is_still_rotated() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 10, 1, 4), &device)?;
        let (q_out, _) = apply_rotary_emb(&q, &q, 4, 4, BASE_THETA)?;
        assert_eq!(q_out.dims(), q.dims());
        Ok(())
    }

    #[test]
    fn rejects_inconsistent_inputs() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 4, 2, 8), DType::F32, &device)?;

        let odd = Tensor::zeros((1, 4, 2, 7), DType::F32, &device)?;
        assert!(apply_rotary_emb(&odd, &odd, 7, 4, BASE_THETA).is_err());

        let wrong_dim = Tensor::zeros((1, 4, 2, 6), DType::F32, &device)?;
        assert!(apply_rotary_emb(&q, &wrong_dim, 8, 4, BASE_THETA).is_err());
        assert!(apply_rotary_emb(&q, &q, 6, 4, BASE_THETA).is_err());

        let short_key = Tensor::zeros((1, 3, 2, 8), DType::F32, &device)?;
        assert!(apply_rotary_emb(&q, &short_key, 8, 4, BASE_THETA).is_err());

        let rank3 = Tensor::zeros((4, 2, 8), DType::F32, &device)?;
        assert!(apply_rotary_emb(&rank3, &rank3, 8, 4, BASE_THETA).is_err());
        Ok(())
    }
}
