#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use serde::Deserialize;

fn default_mlp_ratio() -> f64 {
    4.
}

fn default_theta() -> usize {
    10_000
}

fn default_axes_dim() -> Vec<usize> {
    vec![16, 56, 56]
}

fn default_qkv_bias() -> bool {
    true
}

fn default_patch_size() -> usize {
    1
}

/// Hyperparameters for a double/single-stream block stack.
///
/// The blocks themselves take these values as explicit arguments; this is
/// the surface an external assembly layer deserializes them from.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hidden_size: usize,
    pub num_heads: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    pub depth: usize,
    pub depth_single_blocks: usize,
    #[serde(default = "default_axes_dim")]
    pub axes_dim: Vec<usize>,
    #[serde(default = "default_theta")]
    pub theta: usize,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    pub out_channels: usize,
}

impl Config {
    // https://github.com/black-forest-labs/flux/blob/727e3a71faf37390f318cf9434f0939653302b60/src/flux/util.py#L32
    pub fn flux_dev() -> Self {
        Self {
            hidden_size: 3072,
            num_heads: 24,
            mlp_ratio: 4.0,
            depth: 19,
            depth_single_blocks: 38,
            axes_dim: vec![16, 56, 56],
            theta: 10_000,
            qkv_bias: true,
            patch_size: 1,
            out_channels: 64,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn mlp_hidden_dim(&self) -> usize {
        (self.hidden_size as f64 * self.mlp_ratio) as usize
    }
}
