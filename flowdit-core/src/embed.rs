#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::math::rope;

pub const DEFAULT_MAX_PERIOD: f64 = 10_000.;
pub const DEFAULT_TIME_FACTOR: f64 = 1000.;

/// Multi-axis rotary embedding table, computed once per forward pass and
/// shared read-only by every attention call in the stack.
#[derive(Debug, Clone)]
pub struct EmbedNd {
    dim: usize,
    theta: usize,
    axes_dim: Vec<usize>,
}

impl EmbedNd {
    pub fn new(dim: usize, theta: usize, axes_dim: Vec<usize>) -> Self {
        Self {
            dim,
            theta,
            axes_dim,
        }
    }
}

impl Module for EmbedNd {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        if self.axes_dim.iter().sum::<usize>() != self.dim {
            candle_core::bail!(
                "axes dims {:?} do not sum to the embedding dim {}",
                self.axes_dim,
                self.dim
            )
        }
        let n_axes = ids.dim(D::Minus1)?;
        if n_axes != self.axes_dim.len() {
            candle_core::bail!(
                "position ids carry {n_axes} axes but {} were configured",
                self.axes_dim.len()
            )
        }
        let ids = if ids.dtype().is_float() {
            ids.clone()
        } else {
            ids.to_dtype(DType::F32)?
        };
        let mut emb = Vec::with_capacity(n_axes);
        for idx in 0..n_axes {
            let r = rope(
                &ids.get_on_dim(D::Minus1, idx)?,
                self.axes_dim[idx],
                self.theta,
            )?;
            emb.push(r)
        }
        let emb = Tensor::cat(&emb, 2)?;
        emb.unsqueeze(1)
    }
}

/// Sinusoidal timestep embedding.
///
/// Timesteps are scaled by `time_factor` before the `dim / 2` log-spaced
/// frequencies in `[1, 1 / max_period]` are applied; an odd `dim` pads one
/// zero column. The result is cast back to the dtype of `t` when `t` is a
/// floating point tensor and stays in f32 otherwise.
pub fn timestep_embedding(
    t: &Tensor,
    dim: usize,
    max_period: f64,
    time_factor: f64,
) -> Result<Tensor> {
    let dev = t.device();
    let t_dtype = t.dtype();
    let half = dim / 2;
    let t = (t.to_dtype(DType::F32)? * time_factor)?;
    let arange = Tensor::arange(0, half as u32, dev)?.to_dtype(DType::F32)?;
    let freqs = (arange * (-max_period.ln() / half as f64))?.exp()?;
    let args = t.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
    let mut emb = Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?;
    if dim % 2 == 1 {
        let pad = Tensor::zeros((emb.dim(0)?, 1), DType::F32, dev)?;
        emb = Tensor::cat(&[emb, pad], D::Minus1)?;
    }
    if t_dtype.is_float() {
        emb = emb.to_dtype(t_dtype)?;
    }
    Ok(emb)
}

/// Two-layer SiLU embedder that lifts timestep or pooled-vector embeddings
/// into the conditioning space.
#[derive(Debug, Clone)]
pub struct MlpEmbedder {
    in_layer: Linear,
    out_layer: Linear,
}

impl MlpEmbedder {
    pub fn new(in_sz: usize, h_sz: usize, vb: VarBuilder) -> Result<Self> {
        let in_layer = candle_nn::linear(in_sz, h_sz, vb.pp("in_layer"))?;
        let out_layer = candle_nn::linear(h_sz, h_sz, vb.pp("out_layer"))?;
        Ok(Self {
            in_layer,
            out_layer,
        })
    }
}

impl Module for MlpEmbedder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.in_layer)?.silu()?.apply(&self.out_layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_timestep_embedding_shape() -> Result<()> {
        let dev = Device::Cpu;
        let t = Tensor::from_vec(vec![0f32, 0.5, 1.0], 3, &dev)?;
        let emb = timestep_embedding(&t, 8, DEFAULT_MAX_PERIOD, DEFAULT_TIME_FACTOR)?;
        assert_eq!(emb.dims(), &[3, 8]);
        assert_eq!(emb.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_timestep_embedding_odd_dim_pads_zero() -> Result<()> {
        let dev = Device::Cpu;
        let t = Tensor::from_vec(vec![1f32], 1, &dev)?;

        let odd = timestep_embedding(&t, 5, DEFAULT_MAX_PERIOD, DEFAULT_TIME_FACTOR)?;
        assert_eq!(odd.dims(), &[1, 5]);
        let last = odd.get_on_dim(D::Minus1, 4)?.to_vec1::<f32>()?;
        assert_eq!(last, vec![0f32]);

        let even = timestep_embedding(&t, 4, DEFAULT_MAX_PERIOD, DEFAULT_TIME_FACTOR)?;
        assert_eq!(even.dims(), &[1, 4]);
        let last = even.get_on_dim(D::Minus1, 3)?.to_vec1::<f32>()?;
        assert!(last[0].abs() > 1e-3);
        Ok(())
    }

    #[test]
    fn test_timestep_embedding_integer_input_stays_f32() -> Result<()> {
        let dev = Device::Cpu;
        let t = Tensor::from_vec(vec![0u32, 1], 2, &dev)?;
        let emb = timestep_embedding(&t, 6, DEFAULT_MAX_PERIOD, DEFAULT_TIME_FACTOR)?;
        assert_eq!(emb.dims(), &[2, 6]);
        assert_eq!(emb.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_embed_nd_concatenates_axes() -> Result<()> {
        let dev = Device::Cpu;
        let embedder = EmbedNd::new(8, 10_000, vec![4, 4]);
        let ids = Tensor::zeros((1, 6, 2), DType::F32, &dev)?;
        let pe = ids.apply(&embedder)?;
        assert_eq!(pe.dims(), &[1, 1, 6, 4, 2, 2]);

        // Integer ids are promoted before the rotation table is built.
        let ids = Tensor::zeros((1, 6, 2), DType::U32, &dev)?;
        let pe = ids.apply(&embedder)?;
        assert_eq!(pe.dims(), &[1, 1, 6, 4, 2, 2]);

        let bad = EmbedNd::new(9, 10_000, vec![4, 4]);
        assert!(ids.apply(&bad).is_err());
        Ok(())
    }

    #[test]
    fn test_mlp_embedder_shape() -> Result<()> {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let embedder = MlpEmbedder::new(16, 32, vb)?;
        let xs = Tensor::ones((2, 16), DType::F32, &dev)?;
        let ys = xs.apply(&embedder)?;
        assert_eq!(ys.dims(), &[2, 32]);
        Ok(())
    }
}
