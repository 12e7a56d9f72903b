#![deny(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
//! Double- and single-stream DiT transformer blocks for rectified-flow image
//! generation: rotary position embeddings, adaptive layer-norm modulation,
//! and memory-bounded chunked MLP evaluation, built on candle.

mod blocks;
mod config;
mod embed;
mod layers;
mod math;

pub use blocks::{DoubleStreamBlock, LastLayer, SelfAttention, SingleStreamBlock};
pub use config::Config;
pub use embed::{
    timestep_embedding, EmbedNd, MlpEmbedder, DEFAULT_MAX_PERIOD, DEFAULT_TIME_FACTOR,
};
pub use layers::{
    linear_split_map, LinearSplit, Mlp, Modulation1, Modulation2, ModulationOut, QkNorm,
};
pub use math::{attention, rope};
