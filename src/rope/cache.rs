use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use tracing::{debug, trace};

use super::apply::rotate_pairs;
use super::freqs::RopeTables;
use crate::config::RopeConfig;

/// Rotary embedding with cos/sin tables precomputed up to `max_seq_len`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Tables with shape (max_seq_len, head_dim/2)
    tables: RopeTables,
    config: RopeConfig,
}

impl RotaryEmbedding {
    pub fn new(config: &RopeConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let tables = RopeTables::new(config.max_seq_len, config.head_dim, config.theta, device)?;
        debug!(
            head_dim = config.head_dim,
            max_seq_len = config.max_seq_len,
            theta = config.theta,
            "precomputed rotary tables"
        );
        Ok(Self {
            tables,
            config: *config,
        })
    }

    /// Apply rotary embeddings to Q or K tensors
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch, seq_len, heads, head_dim]
    /// * `position_offset` - Position of the first token (for KV cache scenarios)
    pub fn apply(&self, x: &Tensor, position_offset: usize) -> Result<Tensor> {
        let (_batch, seq_len, _heads, head_dim) = x.dims4()?;

        ensure!(
            head_dim == self.config.head_dim,
            "head_dim mismatch: expected {}, got {}",
            self.config.head_dim,
            head_dim
        );
        ensure!(
            position_offset
                .checked_add(seq_len)
                .is_some_and(|end| end <= self.config.max_seq_len),
            "position range [{}, {}+{}) exceeds max {}",
            position_offset,
            position_offset,
            seq_len,
            self.config.max_seq_len
        );

        let tables = self.tables.narrow(position_offset, seq_len)?;
        trace!(position_offset, seq_len, "applying cached rotary embedding");
        rotate_pairs(x, tables.cos(), tables.sin())
    }

    /// Rotate a query/key pair that share the same positions.
    pub fn apply_pair(
        &self,
        query: &Tensor,
        key: &Tensor,
        position_offset: usize,
    ) -> Result<(Tensor, Tensor)> {
        let q_len = query.dim(1)?;
        let k_len = key.dim(1)?;
        ensure!(
            q_len == k_len,
            "query and key sequence lengths differ: {} vs {}",
            q_len,
            k_len
        );
        Ok((
            self.apply(query, position_offset)?,
            self.apply(key, position_offset)?,
        ))
    }

    pub fn head_dim(&self) -> usize {
        self.config.head_dim
    }

    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    pub fn theta(&self) -> f32 {
        self.config.theta
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }
}
