//! Multi-head attention over one window with a learned relative-position bias.
//!
//! Unlike Swin's signed `(2w-1)^2` table, TinyViT buckets by the absolute offset
//! `(|Δrow|, |Δcol|)`. Buckets are numbered in first-seen order while walking every
//! (point, point) pair of the window in row-major order, so the numbering is part of the
//! checkpoint format and must not change.

use std::collections::HashMap;
use std::sync::Mutex;

use candle_core::{Device, Module, ModuleT, Result, Tensor, D};
use candle_nn::{Init, LayerNorm, Linear, VarBuilder};

use crate::layers::Parameters;

/// Offset-to-bucket mapping for one window resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelativeOffsetTable {
    resolution: (usize, usize),
    num_buckets: usize,
    /// Row-major [N, N] bucket ids
    idxs: Vec<u32>,
}

impl RelativeOffsetTable {
    pub fn new(resolution: (usize, usize)) -> Self {
        let (rows, cols) = resolution;
        let points: Vec<(usize, usize)> = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .collect();
        let n = points.len();

        let mut buckets: HashMap<(usize, usize), u32> = HashMap::new();
        let mut idxs = Vec::with_capacity(n * n);
        for p1 in &points {
            for p2 in &points {
                let offset = (p1.0.abs_diff(p2.0), p1.1.abs_diff(p2.1));
                let next = buckets.len() as u32;
                idxs.push(*buckets.entry(offset).or_insert(next));
            }
        }

        Self {
            resolution,
            num_buckets: buckets.len(),
            idxs,
        }
    }

    pub fn resolution(&self) -> (usize, usize) {
        self.resolution
    }

    /// Tokens per window
    pub fn num_tokens(&self) -> usize {
        self.resolution.0 * self.resolution.1
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Bucket id for the token pair (i, j)
    pub fn bucket(&self, i: usize, j: usize) -> u32 {
        self.idxs[i * self.num_tokens() + j]
    }

    pub fn idxs(&self) -> &[u32] {
        &self.idxs
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_slice(&self.idxs, self.idxs.len(), device)
    }
}

/// Eval-mode cache of the expanded [num_heads, N, N] bias.
#[derive(Debug, Default)]
pub enum BiasCache {
    #[default]
    Invalid,
    Valid(Tensor),
}

impl BiasCache {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn invalidate(&mut self) {
        *self = Self::Invalid;
    }

    /// Returns the cached value, computing it first when invalid.
    pub fn materialize<F>(&mut self, compute: F) -> Result<Tensor>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        match self {
            Self::Valid(bias) => Ok(bias.clone()),
            Self::Invalid => {
                let bias = compute()?;
                *self = Self::Valid(bias.clone());
                Ok(bias)
            }
        }
    }
}

/// Multi-head self-attention over a fixed token grid
pub struct Attention {
    norm: LayerNorm,
    qkv: Linear,
    proj: Linear,
    attention_biases: Tensor,
    attention_bias_idxs: Tensor,
    offsets: RelativeOffsetTable,
    cache: Mutex<BiasCache>,
    num_heads: usize,
    key_dim: usize,
    /// Value dim per head
    d: usize,
    scale: f64,
}

impl Attention {
    pub fn new(
        dim: usize,
        key_dim: usize,
        num_heads: usize,
        attn_ratio: usize,
        resolution: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let nh_kd = key_dim * num_heads;
        let d = attn_ratio * key_dim;
        let dh = d * num_heads;

        let norm = candle_nn::layer_norm(dim, 1e-5, vb.pp("norm"))?;
        let qkv = candle_nn::linear(dim, dh + nh_kd * 2, vb.pp("qkv"))?;
        let proj = candle_nn::linear(dh, dim, vb.pp("proj"))?;

        let offsets = RelativeOffsetTable::new(resolution);
        let attention_biases = vb.get_with_hints(
            (num_heads, offsets.num_buckets()),
            "attention_biases",
            Init::Const(0.),
        )?;
        let attention_bias_idxs = offsets.to_tensor(attention_biases.device())?;

        Ok(Self {
            norm,
            qkv,
            proj,
            attention_biases,
            attention_bias_idxs,
            offsets,
            cache: Mutex::new(BiasCache::Invalid),
            num_heads,
            key_dim,
            d,
            scale: (key_dim as f64).powf(-0.5),
        })
    }

    pub fn offsets(&self) -> &RelativeOffsetTable {
        &self.offsets
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Gathers the [num_heads, N, N] bias from the learned table.
    pub fn expand_bias(&self) -> Result<Tensor> {
        let n = self.offsets.num_tokens();
        self.attention_biases
            .index_select(&self.attention_bias_idxs, 1)?
            .reshape((self.num_heads, n, n))
    }

    /// Expanded bias as used by a forward pass in the given mode.
    pub fn bias(&self, train: bool) -> Result<Tensor> {
        let mut cache = self.lock_cache();
        if train {
            cache.invalidate();
            return self.expand_bias();
        }
        cache.materialize(|| {
            tracing::trace!(
                heads = self.num_heads,
                tokens = self.offsets.num_tokens(),
                "materializing attention bias"
            );
            Ok(self.expand_bias()?.detach())
        })
    }

    pub fn invalidate_cache(&self) {
        self.lock_cache().invalidate();
    }

    pub fn cache_is_valid(&self) -> bool {
        self.lock_cache().is_valid()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, BiasCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ModuleT for Attention {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, n, _c) = x.dims3()?;
        let x = self.norm.forward(x)?;

        // [B, N, heads * (2 * key_dim + d)], laid out per head as q | k | v
        let qkv = self.qkv.forward(&x)?;
        let qkv = qkv.reshape((b, n, self.num_heads, 2 * self.key_dim + self.d))?;
        let q = qkv.narrow(D::Minus1, 0, self.key_dim)?;
        let k = qkv.narrow(D::Minus1, self.key_dim, self.key_dim)?;
        let v = qkv.narrow(D::Minus1, 2 * self.key_dim, self.d)?;

        // -> [B, heads, N, dim]
        let q = q.permute((0, 2, 1, 3))?.contiguous()?;
        let k = k.permute((0, 2, 1, 3))?.contiguous()?;
        let v = v.permute((0, 2, 1, 3))?.contiguous()?;

        let attn = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? * self.scale)?;
        let bias = self.bias(train)?.unsqueeze(0)?;
        let attn = attn.broadcast_add(&bias)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        let x = attn.matmul(&v)?;
        let x = x.transpose(1, 2)?.reshape((b, n, self.num_heads * self.d))?;
        self.proj.forward(&x)
    }
}

impl Parameters for Attention {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.norm.visit_params(f);
        self.qkv.visit_params(f);
        self.proj.visit_params(f);
        f(&self.attention_biases);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn window_7_has_49_buckets() {
        let table = RelativeOffsetTable::new((7, 7));
        assert_eq!(table.num_tokens(), 49);
        assert_eq!(table.num_buckets(), 49);
        assert_eq!(table.idxs().len(), 49 * 49);
        assert_eq!(table, RelativeOffsetTable::new((7, 7)));
    }

    #[test]
    fn buckets_follow_first_seen_order() {
        let table = RelativeOffsetTable::new((2, 2));
        // points: (0,0) (0,1) (1,0) (1,1)
        assert_eq!(table.num_buckets(), 4);
        assert_eq!(&table.idxs()[..4], &[0, 1, 2, 3]);
        assert_eq!(table.bucket(1, 0), 1);
        assert_eq!(table.bucket(3, 0), 3);
        assert_eq!(table.bucket(2, 1), 3);
        for i in 0..4 {
            assert_eq!(table.bucket(i, i), 0);
        }
    }

    #[test]
    fn table_is_symmetric() {
        let table = RelativeOffsetTable::new((5, 3));
        assert_eq!(table.num_buckets(), 15);
        let n = table.num_tokens();
        for i in 0..n {
            for j in 0..n {
                assert_eq!(table.bucket(i, j), table.bucket(j, i));
            }
        }
    }

    #[test]
    fn bias_cache_transitions() -> Result<()> {
        let mut cache = BiasCache::default();
        assert!(!cache.is_valid());
        let t = Tensor::new(&[1f32, 2.0], &Device::Cpu)?;
        let got = cache.materialize(|| Ok(t.clone()))?;
        assert!(cache.is_valid());
        assert_eq!(got.to_vec1::<f32>()?, vec![1.0, 2.0]);

        // a valid cache never recomputes
        let again = cache.materialize(|| candle_core::bail!("recomputed"))?;
        assert_eq!(again.to_vec1::<f32>()?, vec![1.0, 2.0]);

        cache.invalidate();
        assert!(!cache.is_valid());
        Ok(())
    }

    #[test]
    fn train_forward_invalidates_cache() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = Attention::new(8, 4, 2, 1, (3, 3), vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 9, 8), &Device::Cpu)?;

        let y = attn.forward_t(&x, false)?;
        assert_eq!(y.dims(), &[2, 9, 8]);
        assert!(attn.cache_is_valid());

        attn.forward_t(&x, true)?;
        assert!(!attn.cache_is_valid());
        Ok(())
    }
}
