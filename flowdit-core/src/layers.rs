#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, Module, RmsNorm, VarBuilder};
use indexmap::IndexMap;
use tracing::debug;

/// Parameter-free LayerNorm: the weight is fixed to ones and never loaded
/// from a checkpoint.
pub(crate) fn layer_norm(dim: usize, vb: VarBuilder) -> Result<LayerNorm> {
    let ws = Tensor::ones(dim, vb.dtype(), vb.device())?;
    Ok(LayerNorm::new_no_bias(ws, 1e-6))
}

/// Independent RMS normalization of the query and key projections over the
/// head dimension.
///
/// The two paths are separate methods on purpose: each depends only on its
/// own input and learned scale, and the result is cast to the dtype of the
/// `like` tensor (the value projection in the blocks).
#[derive(Debug, Clone)]
pub struct QkNorm {
    query_norm: RmsNorm,
    key_norm: RmsNorm,
}

impl QkNorm {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let query_norm = vb.get(dim, "query_norm.scale")?;
        let query_norm = RmsNorm::new(query_norm, 1e-6);
        let key_norm = vb.get(dim, "key_norm.scale")?;
        let key_norm = RmsNorm::new(key_norm, 1e-6);
        Ok(Self {
            query_norm,
            key_norm,
        })
    }

    pub fn normalize_query(&self, q: &Tensor, like: &Tensor) -> Result<Tensor> {
        q.apply(&self.query_norm)?.to_dtype(like.dtype())
    }

    pub fn normalize_key(&self, k: &Tensor, like: &Tensor) -> Result<Tensor> {
        k.apply(&self.key_norm)?.to_dtype(like.dtype())
    }
}

/// One shift/scale/gate triple derived from the conditioning vector, each
/// broadcastable as `(batch, 1, hidden)`.
pub struct ModulationOut {
    pub shift: Tensor,
    pub scale: Tensor,
    pub gate: Tensor,
}

impl ModulationOut {
    pub fn scale_shift(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_mul(&(&self.scale + 1.)?)?
            .broadcast_add(&self.shift)
    }

    pub fn gate(&self, xs: &Tensor) -> Result<Tensor> {
        self.gate.broadcast_mul(xs)
    }
}

/// Single-stream modulation: one shift/scale/gate triple.
#[derive(Debug, Clone)]
pub struct Modulation1 {
    lin: Linear,
}

impl Modulation1 {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let lin = candle_nn::linear(dim, 3 * dim, vb.pp("lin"))?;
        Ok(Self { lin })
    }

    pub fn forward(&self, vec_: &Tensor) -> Result<ModulationOut> {
        let ys = vec_
            .silu()?
            .apply(&self.lin)?
            .unsqueeze(1)?
            .chunk(3, D::Minus1)?;
        if ys.len() != 3 {
            candle_core::bail!("unexpected len from chunk {ys:?}")
        }
        Ok(ModulationOut {
            shift: ys[0].clone(),
            scale: ys[1].clone(),
            gate: ys[2].clone(),
        })
    }
}

/// Double-stream modulation: one triple for the attention path and one for
/// the MLP path.
#[derive(Debug, Clone)]
pub struct Modulation2 {
    lin: Linear,
}

impl Modulation2 {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let lin = candle_nn::linear(dim, 6 * dim, vb.pp("lin"))?;
        Ok(Self { lin })
    }

    pub fn forward(&self, vec_: &Tensor) -> Result<(ModulationOut, ModulationOut)> {
        let ys = vec_
            .silu()?
            .apply(&self.lin)?
            .unsqueeze(1)?
            .chunk(6, D::Minus1)?;
        if ys.len() != 6 {
            candle_core::bail!("unexpected len from chunk {ys:?}")
        }
        let mod1 = ModulationOut {
            shift: ys[0].clone(),
            scale: ys[1].clone(),
            gate: ys[2].clone(),
        };
        let mod2 = ModulationOut {
            shift: ys[3].clone(),
            scale: ys[4].clone(),
            gate: ys[5].clone(),
        };
        Ok((mod1, mod2))
    }
}

/// Expand / gelu / project MLP with an optional row-chunked evaluation path
/// that never materializes the full hidden expansion.
#[derive(Debug, Clone)]
pub struct Mlp {
    lin1: Linear,
    lin2: Linear,
}

impl Mlp {
    pub fn new(in_sz: usize, mlp_sz: usize, vb: VarBuilder) -> Result<Self> {
        let lin1 = candle_nn::linear(in_sz, mlp_sz, vb.pp("0"))?;
        let lin2 = candle_nn::linear(mlp_sz, in_sz, vb.pp("2"))?;
        Ok(Self { lin1, lin2 })
    }

    /// Evaluate the MLP over `chunks` equal row slices of the flattened
    /// `(batch * seq, channel)` tensor. `chunks` must divide the row count
    /// exactly; a remainder is a configuration error. The result matches the
    /// unchunked forward up to float accumulation order.
    pub fn forward_chunked(&self, xs: &Tensor, chunks: usize) -> Result<Tensor> {
        let (b, l, d) = xs.dims3()?;
        let rows = b * l;
        if chunks == 0 || rows % chunks != 0 {
            candle_core::bail!("chunk count {chunks} does not divide {rows} rows")
        }
        let xs = xs.reshape((rows, d))?;
        let chunk_rows = rows / chunks;
        let mut out = Vec::with_capacity(chunks);
        for idx in 0..chunks {
            let chunk = xs.narrow(0, idx * chunk_rows, chunk_rows)?;
            out.push(chunk.apply(&self.lin1)?.gelu()?.apply(&self.lin2)?);
        }
        Tensor::cat(&out, 0)?.reshape((b, l, d))
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.lin1)?.gelu()?.apply(&self.lin2)
    }
}

/// Largest chunk count `<= target` that divides `rows` exactly.
///
/// The blocks use this to bound peak memory for arbitrary sequence lengths
/// while `forward_chunked` keeps its exact-division contract.
pub(crate) fn mlp_chunk_count(rows: usize, target: usize) -> usize {
    let target = target.clamp(1, rows.max(1));
    let count = (1..=target).rev().find(|c| rows % c == 0).unwrap_or(1);
    if count != target {
        debug!("degrading mlp chunk count from {target} to {count} for {rows} rows");
    }
    count
}

/// How a fused linear layer decomposes into named logical sub-projections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearSplit {
    pub mapped_modules: Vec<&'static str>,
    pub split_sizes: Vec<usize>,
}

/// Decomposition of the fused linear layers into their logical
/// sub-projections, keyed by layer name in declaration order.
///
/// This is metadata for external weight-loading and quantization tooling;
/// nothing in the forward path consults it.
pub fn linear_split_map(
    hidden_size: usize,
    mlp_hidden_dim: usize,
) -> IndexMap<&'static str, LinearSplit> {
    IndexMap::from([
        (
            "qkv",
            LinearSplit {
                mapped_modules: vec!["q", "k", "v"],
                split_sizes: vec![hidden_size, hidden_size, hidden_size],
            },
        ),
        (
            "linear1",
            LinearSplit {
                mapped_modules: vec![
                    "linear1_attn_q",
                    "linear1_attn_k",
                    "linear1_attn_v",
                    "linear1_mlp",
                ],
                split_sizes: vec![hidden_size, hidden_size, hidden_size, mlp_hidden_dim],
            },
        ),
    ])
}
