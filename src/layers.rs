//! Shared building blocks: conv + batch-norm, channel layer-norm, stochastic depth,
//! and the [`Parameters`] walk every component implements.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, LayerNorm, Linear, VarBuilder};

/// Enumerates the trainable tensors a component owns.
///
/// Order is fixed by each implementation; batch-norm running statistics are buffers and are
/// never visited.
pub trait Parameters {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor));

    fn params(&self) -> Vec<Tensor> {
        let mut out = Vec::new();
        self.visit_params(&mut |t| out.push(t.clone()));
        out
    }

    /// Number of scalar parameters
    fn param_count(&self) -> usize {
        let mut n = 0;
        self.visit_params(&mut |t| n += t.elem_count());
        n
    }
}

impl Parameters for Conv2d {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        f(self.weight());
        if let Some(b) = self.bias() {
            f(b);
        }
    }
}

impl Parameters for Linear {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        f(self.weight());
        if let Some(b) = self.bias() {
            f(b);
        }
    }
}

impl Parameters for LayerNorm {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        f(self.weight());
        if let Some(b) = self.bias() {
            f(b);
        }
    }
}

impl Parameters for BatchNorm {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        if let Some((w, b)) = self.weight_and_bias() {
            f(w);
            f(b);
        }
    }
}

impl<T: Parameters> Parameters for Option<T> {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        if let Some(inner) = self {
            inner.visit_params(f);
        }
    }
}

impl<T: Parameters> Parameters for Vec<T> {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        for item in self {
            item.visit_params(f);
        }
    }
}

/// Geometry of a [`Conv2dBn`]
#[derive(Clone, Copy, Debug)]
pub struct Conv2dBnConfig {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
    /// Initial batch-norm scale; 0 makes a residual branch start as identity
    pub bn_weight_init: f64,
}

impl Default for Conv2dBnConfig {
    fn default() -> Self {
        Self {
            kernel: 1,
            stride: 1,
            padding: 0,
            groups: 1,
            bn_weight_init: 1.0,
        }
    }
}

/// Bias-free convolution followed by batch normalization
pub struct Conv2dBn {
    c: Conv2d,
    bn: BatchNorm,
}

impl Conv2dBn {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        cfg: Conv2dBnConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: cfg.padding,
            stride: cfg.stride,
            groups: cfg.groups,
            ..Default::default()
        };
        let c = candle_nn::conv2d_no_bias(in_channels, out_channels, cfg.kernel, conv_cfg, vb.pp("c"))?;

        let vb = vb.pp("bn");
        let running_mean = vb.get_with_hints(out_channels, "running_mean", Init::Const(0.))?;
        let running_var = vb.get_with_hints(out_channels, "running_var", Init::Const(1.))?;
        let weight = vb.get_with_hints(out_channels, "weight", Init::Const(cfg.bn_weight_init))?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.))?;
        let bn = BatchNorm::new(out_channels, running_mean, running_var, weight, bias, 1e-5)?;

        Ok(Self { c, bn })
    }

    /// Depthwise variant: one filter per channel
    pub fn depthwise(
        channels: usize,
        kernel: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dBnConfig {
            kernel,
            stride,
            padding: kernel / 2,
            groups: channels,
            ..Default::default()
        };
        Self::new(channels, channels, cfg, vb)
    }
}

impl ModuleT for Conv2dBn {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        x.apply(&self.c)?.apply_t(&self.bn, train)
    }
}

impl Parameters for Conv2dBn {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.c.visit_params(f);
        self.bn.visit_params(f);
    }
}

/// LayerNorm over the channel axis of a [B, C, H, W] tensor
pub struct LayerNorm2d {
    norm: LayerNorm,
}

impl LayerNorm2d {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let norm = candle_nn::layer_norm(channels, 1e-6, vb)?;
        Ok(Self { norm })
    }
}

impl Module for LayerNorm2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let nhwc = x.permute((0, 2, 3, 1))?;
        let y = self.norm.forward(&nhwc)?;
        y.permute((0, 3, 1, 2))
    }
}

impl Parameters for LayerNorm2d {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.norm.visit_params(f);
    }
}

/// Stochastic depth: drops the whole residual branch per sample while training.
#[derive(Clone, Copy, Debug)]
pub struct DropPath {
    drop_prob: f64,
}

impl DropPath {
    pub fn new(drop_prob: f64) -> Self {
        Self { drop_prob }
    }

    pub fn drop_prob(&self) -> f64 {
        self.drop_prob
    }
}

impl ModuleT for DropPath {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.drop_prob == 0.0 {
            return Ok(x.clone());
        }
        let keep = 1.0 - self.drop_prob;
        let b = x.dim(0)?;
        let mut mask_shape = vec![1usize; x.rank()];
        mask_shape[0] = b;

        let mask = Tensor::rand(0f32, 1f32, b, x.device())?
            .lt(keep as f32)?
            .to_dtype(x.dtype())?
            .reshape(mask_shape)?;
        x.broadcast_mul(&mask)? / keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn drop_path_is_identity_in_eval() -> Result<()> {
        let x = Tensor::randn(0f32, 1.0, (4, 3, 5), &Device::Cpu)?;
        let y = DropPath::new(0.9).forward_t(&x, false)?;
        let diff = (x - y)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn drop_path_zeroes_or_rescales_whole_samples() -> Result<()> {
        let x = Tensor::ones((16, 2, 3), DType::F32, &Device::Cpu)?;
        let y = DropPath::new(0.5).forward_t(&x, true)?;
        for sample in y.to_vec3::<f32>()? {
            let first = sample[0][0];
            assert!(first == 0.0 || (first - 2.0).abs() < 1e-6);
            assert!(sample.iter().flatten().all(|v| *v == first));
        }
        Ok(())
    }

    #[test]
    fn zero_init_bn_silences_branch() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = Conv2dBnConfig {
            bn_weight_init: 0.0,
            ..Default::default()
        };
        let conv = Conv2dBn::new(4, 6, cfg, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 5, 5), &Device::Cpu)?;
        let y = conv.forward_t(&x, false)?;
        assert_eq!(y.dims(), &[2, 6, 5, 5]);
        assert_eq!(y.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        // conv weight + bn weight + bn bias, running stats excluded
        assert_eq!(conv.params().len(), 3);
        Ok(())
    }

    #[test]
    fn layer_norm_2d_normalizes_channels() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = LayerNorm2d::new(8, vb)?;
        let x = Tensor::randn(3f32, 2.0, (1, 8, 4, 4), &Device::Cpu)?;
        let y = norm.forward(&x)?;
        let mean = y.mean_keepdim(1)?.abs()?.max_keepdim(2)?.max_keepdim(3)?;
        assert!(mean.flatten_all()?.to_vec1::<f32>()?[0] < 1e-4);
        Ok(())
    }
}
