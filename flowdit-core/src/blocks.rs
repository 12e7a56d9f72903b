#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::layers::{layer_norm, mlp_chunk_count, Mlp, Modulation1, Modulation2, QkNorm};
use crate::math::attention;

// Row-chunk targets for the memory-bounded MLP paths.
const MLP_CHUNKS: usize = 8;
const FUSED_MLP_CHUNKS: usize = 6;

/// Per-stream attention components: fused qkv projection, query/key
/// normalization, and the output projection.
///
/// The blocks drive these pieces directly around the shared joint-attention
/// call; there is no standalone single-stream forward here.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    qkv: Linear,
    norm: QkNorm,
    proj: Linear,
    num_heads: usize,
}

impl SelfAttention {
    pub fn new(dim: usize, num_heads: usize, qkv_bias: bool, vb: VarBuilder) -> Result<Self> {
        if dim % num_heads != 0 {
            candle_core::bail!("hidden size {dim} is not divisible by {num_heads} heads")
        }
        let head_dim = dim / num_heads;
        let qkv = candle_nn::linear_b(dim, dim * 3, qkv_bias, vb.pp("qkv"))?;
        let norm = QkNorm::new(head_dim, vb.pp("norm"))?;
        let proj = candle_nn::linear(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            norm,
            proj,
            num_heads,
        })
    }

    /// Project to per-head q/k/v, with query and key normalized.
    pub fn qkv(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let qkv = xs.apply(&self.qkv)?;
        let (b, l, _khd) = qkv.dims3()?;
        let qkv = qkv.reshape((b, l, 3, self.num_heads, ()))?;
        let q = qkv.i((.., .., 0))?.transpose(1, 2)?;
        let k = qkv.i((.., .., 1))?.transpose(1, 2)?;
        let v = qkv.i((.., .., 2))?.transpose(1, 2)?;
        let q = self.norm.normalize_query(&q, &v)?;
        let k = self.norm.normalize_key(&k, &v)?;
        Ok((q, k, v))
    }
}

/// Joint image/text block: independent modulation and MLP paths per stream,
/// one fused attention call over the concatenated sequence.
#[derive(Debug, Clone)]
pub struct DoubleStreamBlock {
    img_mod: Modulation2,
    img_norm1: LayerNorm,
    img_attn: SelfAttention,
    img_norm2: LayerNorm,
    img_mlp: Mlp,
    txt_mod: Modulation2,
    txt_norm1: LayerNorm,
    txt_attn: SelfAttention,
    txt_norm2: LayerNorm,
    txt_mlp: Mlp,
}

impl DoubleStreamBlock {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        mlp_ratio: f64,
        qkv_bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mlp_sz = (hidden_size as f64 * mlp_ratio) as usize;
        let img_mod = Modulation2::new(hidden_size, vb.pp("img_mod"))?;
        let img_norm1 = layer_norm(hidden_size, vb.pp("img_norm1"))?;
        let img_attn = SelfAttention::new(hidden_size, num_heads, qkv_bias, vb.pp("img_attn"))?;
        let img_norm2 = layer_norm(hidden_size, vb.pp("img_norm2"))?;
        let img_mlp = Mlp::new(hidden_size, mlp_sz, vb.pp("img_mlp"))?;
        let txt_mod = Modulation2::new(hidden_size, vb.pp("txt_mod"))?;
        let txt_norm1 = layer_norm(hidden_size, vb.pp("txt_norm1"))?;
        let txt_attn = SelfAttention::new(hidden_size, num_heads, qkv_bias, vb.pp("txt_attn"))?;
        let txt_norm2 = layer_norm(hidden_size, vb.pp("txt_norm2"))?;
        let txt_mlp = Mlp::new(hidden_size, mlp_sz, vb.pp("txt_mlp"))?;
        Ok(Self {
            img_mod,
            img_norm1,
            img_attn,
            img_norm2,
            img_mlp,
            txt_mod,
            txt_norm1,
            txt_attn,
            txt_norm2,
            txt_mlp,
        })
    }

    pub fn forward(
        &self,
        img: &Tensor,
        txt: &Tensor,
        vec_: &Tensor,
        pe: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (img_mod1, img_mod2) = self.img_mod.forward(vec_)?;
        let (txt_mod1, txt_mod2) = self.txt_mod.forward(vec_)?;

        let img_modulated = img_mod1.scale_shift(&img.apply(&self.img_norm1)?)?;
        let (img_q, img_k, img_v) = self.img_attn.qkv(&img_modulated)?;

        let txt_modulated = txt_mod1.scale_shift(&txt.apply(&self.txt_norm1)?)?;
        let (txt_q, txt_k, txt_v) = self.txt_attn.qkv(&txt_modulated)?;

        // Text tokens lead the joint sequence; the positional table is laid
        // out in the same order.
        let q = Tensor::cat(&[txt_q, img_q], 2)?;
        let k = Tensor::cat(&[txt_k, img_k], 2)?;
        let v = Tensor::cat(&[txt_v, img_v], 2)?;

        let attn = attention(&q, &k, &v, pe)?;
        let txt_len = txt.dim(1)?;
        let txt_attn = attn.narrow(1, 0, txt_len)?;
        let img_attn = attn.narrow(1, txt_len, attn.dim(1)? - txt_len)?;

        let img = (img + img_mod1.gate(&img_attn.apply(&self.img_attn.proj)?)?)?;
        let img_mlp_in = img_mod2.scale_shift(&img.apply(&self.img_norm2)?)?;
        let img_rows = img.dim(0)? * img.dim(1)?;
        let img_mlp_out = self
            .img_mlp
            .forward_chunked(&img_mlp_in, mlp_chunk_count(img_rows, MLP_CHUNKS))?;
        let img = (&img + img_mod2.gate(&img_mlp_out)?)?;

        let txt = (txt + txt_mod1.gate(&txt_attn.apply(&self.txt_attn.proj)?)?)?;
        let txt_mlp_in = txt_mod2.scale_shift(&txt.apply(&self.txt_norm2)?)?;
        let txt_rows = txt.dim(0)? * txt.dim(1)?;
        let txt_mlp_out = self
            .txt_mlp
            .forward_chunked(&txt_mlp_in, mlp_chunk_count(txt_rows, MLP_CHUNKS))?;
        let txt = (&txt + txt_mod2.gate(&txt_mlp_out)?)?;

        Ok((img, txt))
    }
}

/// Combined-stream block with parallel attention and MLP computed from a
/// single fused input projection.
#[derive(Debug, Clone)]
pub struct SingleStreamBlock {
    linear1: Linear,
    linear2: Linear,
    norm: QkNorm,
    pre_norm: LayerNorm,
    modulation: Modulation1,
    hidden_size: usize,
    mlp_hidden_dim: usize,
    num_heads: usize,
}

impl SingleStreamBlock {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        mlp_ratio: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if hidden_size % num_heads != 0 {
            candle_core::bail!("hidden size {hidden_size} is not divisible by {num_heads} heads")
        }
        let head_dim = hidden_size / num_heads;
        let mlp_hidden_dim = (hidden_size as f64 * mlp_ratio) as usize;
        let linear1 = candle_nn::linear(
            hidden_size,
            hidden_size * 3 + mlp_hidden_dim,
            vb.pp("linear1"),
        )?;
        let linear2 =
            candle_nn::linear(hidden_size + mlp_hidden_dim, hidden_size, vb.pp("linear2"))?;
        let norm = QkNorm::new(head_dim, vb.pp("norm"))?;
        let pre_norm = layer_norm(hidden_size, vb.pp("pre_norm"))?;
        let modulation = Modulation1::new(hidden_size, vb.pp("modulation"))?;
        Ok(Self {
            linear1,
            linear2,
            norm,
            pre_norm,
            modulation,
            hidden_size,
            mlp_hidden_dim,
            num_heads,
        })
    }

    pub fn forward(&self, xs: &Tensor, vec_: &Tensor, pe: &Tensor) -> Result<Tensor> {
        let mod_ = self.modulation.forward(vec_)?;
        let x_mod = mod_.scale_shift(&xs.apply(&self.pre_norm)?)?;
        let x_proj = x_mod.apply(&self.linear1)?;
        let (b, l, _) = x_proj.dims3()?;

        let qkv = x_proj.narrow(D::Minus1, 0, 3 * self.hidden_size)?;
        let qkv = qkv.reshape((b, l, 3, self.num_heads, ()))?;
        let q = qkv.i((.., .., 0))?.transpose(1, 2)?;
        let k = qkv.i((.., .., 1))?.transpose(1, 2)?;
        let v = qkv.i((.., .., 2))?.transpose(1, 2)?;
        let q = self.norm.normalize_query(&q, &v)?;
        let k = self.norm.normalize_key(&k, &v)?;
        let attn = attention(&q, &k, &v, pe)?;

        // The attention rows and the MLP expansion are consumed in aligned
        // row chunks so the linear2 input is never materialized whole.
        let mlp = x_proj.narrow(D::Minus1, 3 * self.hidden_size, self.mlp_hidden_dim)?;
        let rows = b * l;
        let attn = attn.reshape((rows, self.hidden_size))?;
        let mlp = mlp.reshape((rows, self.mlp_hidden_dim))?;
        let chunks = mlp_chunk_count(rows, FUSED_MLP_CHUNKS);
        let chunk_rows = rows / chunks;
        let mut out = Vec::with_capacity(chunks);
        for idx in 0..chunks {
            let attn_rows = attn.narrow(0, idx * chunk_rows, chunk_rows)?;
            let mlp_rows = mlp.narrow(0, idx * chunk_rows, chunk_rows)?.gelu()?;
            out.push(Tensor::cat(&[attn_rows, mlp_rows], D::Minus1)?.apply(&self.linear2)?);
        }
        let output = Tensor::cat(&out, 0)?.reshape((b, l, self.hidden_size))?;
        xs + mod_.gate(&output)?
    }
}

/// Terminal projection: modulated norm then a linear map to
/// `patch_size^2 * out_channels`. No gate, no residual.
#[derive(Debug, Clone)]
pub struct LastLayer {
    norm_final: LayerNorm,
    linear: Linear,
    ada_ln_modulation: Linear,
}

impl LastLayer {
    pub fn new(
        hidden_size: usize,
        patch_size: usize,
        out_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm_final = layer_norm(hidden_size, vb.pp("norm_final"))?;
        let linear = candle_nn::linear(
            hidden_size,
            patch_size * patch_size * out_channels,
            vb.pp("linear"),
        )?;
        let ada_ln_modulation =
            candle_nn::linear(hidden_size, 2 * hidden_size, vb.pp("adaLN_modulation.1"))?;
        Ok(Self {
            norm_final,
            linear,
            ada_ln_modulation,
        })
    }

    pub fn forward(&self, xs: &Tensor, vec_: &Tensor) -> Result<Tensor> {
        let chunks = vec_.silu()?.apply(&self.ada_ln_modulation)?.chunk(2, 1)?;
        let (shift, scale) = (&chunks[0], &chunks[1]);
        let xs = xs
            .apply(&self.norm_final)?
            .broadcast_mul(&(scale.unsqueeze(1)? + 1.0)?)?
            .broadcast_add(&shift.unsqueeze(1)?)?;
        xs.apply(&self.linear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbedNd;
    use crate::testing::{ramp, seed_vars};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn positional_pe(seq: usize, head_dim: usize, dev: &Device) -> Result<Tensor> {
        let ids = Tensor::arange(0f32, seq as f32, dev)?.reshape((1, seq, 1))?;
        ids.apply(&EmbedNd::new(head_dim, 10_000, vec![head_dim]))
    }

    fn identity_pe(seq: usize, head_dim: usize, dev: &Device) -> Result<Tensor> {
        let ids = Tensor::zeros((1, seq, 1), DType::F32, dev)?;
        ids.apply(&EmbedNd::new(head_dim, 10_000, vec![head_dim]))
    }

    #[test]
    fn test_double_block_zero_wiring() -> Result<()> {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let block = DoubleStreamBlock::new(64, 4, 4.0, true, vb)?;

        let img = Tensor::zeros((1, 8, 64), DType::F32, &dev)?;
        let txt = Tensor::zeros((1, 4, 64), DType::F32, &dev)?;
        let vec_ = Tensor::zeros((1, 64), DType::F32, &dev)?;
        // Zero position ids build an identity rotation table.
        let ids = Tensor::zeros((1, 12, 3), DType::F32, &dev)?;
        let pe = ids.apply(&EmbedNd::new(16, 10_000, vec![4, 4, 8]))?;

        let (img_out, txt_out) = block.forward(&img, &txt, &vec_, &pe)?;
        assert_eq!(img_out.dims(), img.dims());
        assert_eq!(txt_out.dims(), txt.dims());
        for v in img_out.flatten_all()?.to_vec1::<f32>()? {
            assert_eq!(v, 0f32);
        }
        for v in txt_out.flatten_all()?.to_vec1::<f32>()? {
            assert_eq!(v, 0f32);
        }
        Ok(())
    }

    #[test]
    fn test_double_block_deterministic_and_shape_preserving() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = DoubleStreamBlock::new(32, 4, 4.0, true, vb)?;
        seed_vars(&varmap)?;

        // Sequence lengths that do not divide the chunk target.
        let img = ramp(&[1, 10, 32], &dev)?;
        let txt = ramp(&[1, 3, 32], &dev)?;
        let vec_ = ramp(&[1, 32], &dev)?;
        let pe = positional_pe(13, 8, &dev)?;

        let (img_a, txt_a) = block.forward(&img, &txt, &vec_, &pe)?;
        let (img_b, txt_b) = block.forward(&img, &txt, &vec_, &pe)?;
        assert_eq!(img_a.dims(), &[1, 10, 32]);
        assert_eq!(txt_a.dims(), &[1, 3, 32]);
        assert_eq!(
            img_a.flatten_all()?.to_vec1::<f32>()?,
            img_b.flatten_all()?.to_vec1::<f32>()?
        );
        assert_eq!(
            txt_a.flatten_all()?.to_vec1::<f32>()?,
            txt_b.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_double_block_streams_are_coupled() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = DoubleStreamBlock::new(32, 4, 4.0, true, vb)?;
        seed_vars(&varmap)?;

        let img = ramp(&[1, 6, 32], &dev)?;
        let txt_a = ramp(&[1, 4, 32], &dev)?;
        let txt_b = (&txt_a * 0.5)?;
        let vec_ = ramp(&[1, 32], &dev)?;
        let pe = positional_pe(10, 8, &dev)?;

        let (img_a, _) = block.forward(&img, &txt_a, &vec_, &pe)?;
        let (img_b, _) = block.forward(&img, &txt_b, &vec_, &pe)?;
        let a = img_a.flatten_all()?.to_vec1::<f32>()?;
        let b = img_b.flatten_all()?.to_vec1::<f32>()?;
        let max_diff = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0f32, f32::max);
        assert!(max_diff > 1e-6, "text tokens must reach the image stream");
        Ok(())
    }

    #[test]
    fn test_single_block_shape_preserving() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = SingleStreamBlock::new(32, 4, 4.0, vb)?;
        seed_vars(&varmap)?;

        let xs = ramp(&[2, 7, 32], &dev)?;
        let vec_ = ramp(&[2, 32], &dev)?;
        let pe = positional_pe(7, 8, &dev)?;

        let ys = block.forward(&xs, &vec_, &pe)?;
        assert_eq!(ys.dims(), xs.dims());
        let again = block.forward(&xs, &vec_, &pe)?;
        assert_eq!(
            ys.flatten_all()?.to_vec1::<f32>()?,
            again.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_single_block_zero_wiring() -> Result<()> {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let block = SingleStreamBlock::new(64, 4, 4.0, vb)?;
        let xs = Tensor::zeros((1, 6, 64), DType::F32, &dev)?;
        let vec_ = Tensor::zeros((1, 64), DType::F32, &dev)?;
        let pe = identity_pe(6, 16, &dev)?;
        let ys = block.forward(&xs, &vec_, &pe)?;
        for v in ys.flatten_all()?.to_vec1::<f32>()? {
            assert_eq!(v, 0f32);
        }
        Ok(())
    }

    #[test]
    fn test_last_layer_output_shape() -> Result<()> {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let last = LastLayer::new(32, 2, 4, vb)?;
        let xs = Tensor::ones((1, 6, 32), DType::F32, &dev)?;
        let vec_ = Tensor::zeros((1, 32), DType::F32, &dev)?;
        let ys = last.forward(&xs, &vec_)?;
        assert_eq!(ys.dims(), &[1, 6, 16]);
        Ok(())
    }

    #[test]
    fn test_self_attention_rejects_bad_head_count() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        assert!(SelfAttention::new(30, 4, true, vb).is_err());
    }
}
