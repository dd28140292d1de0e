use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::rope::BASE_THETA;

fn default_theta() -> f32 {
    BASE_THETA
}

/// Parameters of a rotary embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RopeConfig {
    /// Feature width of a single attention head
    pub head_dim: usize,
    /// Number of positions the cached tables cover
    pub max_seq_len: usize,
    #[serde(default = "default_theta")]
    pub theta: f32,
}

impl RopeConfig {
    pub fn new(head_dim: usize, max_seq_len: usize) -> Self {
        Self {
            head_dim,
            max_seq_len,
            theta: BASE_THETA,
        }
    }

    pub fn with_theta(mut self, theta: f32) -> Self {
        self.theta = theta;
        self
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read rope config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.head_dim > 0, "head_dim must be > 0");
        ensure!(
            self.head_dim.is_multiple_of(2),
            "head_dim ({}) must be even",
            self.head_dim
        );
        ensure!(self.max_seq_len > 0, "max_seq_len must be > 0");
        ensure!(
            self.theta.is_finite() && self.theta > 0.0,
            "theta must be a positive finite number, got {}",
            self.theta
        );
        Ok(())
    }
}
