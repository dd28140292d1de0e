//! Rotary position embeddings (RoPE) for `(batch, seq_len, heads, head_dim)` tensors.
pub mod apply;
pub mod broadcast;
pub mod cache;
pub mod freqs;

pub use apply::{apply_rotary_emb, rotate_pairs};
pub use broadcast::reshape_for_broadcast;
pub use cache::RotaryEmbedding;
pub use freqs::{inverse_frequencies, RopeTables, BASE_THETA};
