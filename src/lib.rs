pub mod config;
pub mod rope;

pub use config::RopeConfig;
pub use rope::{apply_rotary_emb, reshape_for_broadcast, RotaryEmbedding, BASE_THETA};
