//! Residual blocks: the inverted-bottleneck conv block of the first stage and the
//! windowed-attention transformer block of the later ones.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Dropout, LayerNorm, Linear, VarBuilder};

use crate::layers::{Conv2dBn, Conv2dBnConfig, DropPath, Parameters};
use crate::window::WindowAttention;

/// Feed-forward block: norm -> fc1 -> GELU -> fc2
pub struct Mlp {
    norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    drop: Dropout,
}

impl Mlp {
    pub fn new(in_features: usize, hidden_features: usize, drop: f64, vb: VarBuilder) -> Result<Self> {
        let norm = candle_nn::layer_norm(in_features, 1e-5, vb.pp("norm"))?;
        let fc1 = candle_nn::linear(in_features, hidden_features, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden_features, in_features, vb.pp("fc2"))?;
        Ok(Self {
            norm,
            fc1,
            fc2,
            drop: Dropout::new(drop as f32),
        })
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.norm.forward(x)?;
        let x = self.fc1.forward(&x)?.gelu_erf()?;
        let x = self.drop.forward(&x, train)?;
        let x = self.fc2.forward(&x)?;
        self.drop.forward(&x, train)
    }
}

impl Parameters for Mlp {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.norm.visit_params(f);
        self.fc1.visit_params(f);
        self.fc2.visit_params(f);
    }
}

/// Settings shared by every transformer block of a stage
#[derive(Clone, Copy, Debug)]
pub struct TinyVitBlockConfig {
    pub dim: usize,
    pub resolution: (usize, usize),
    pub num_heads: usize,
    pub window_size: usize,
    pub mlp_ratio: f64,
    pub drop: f64,
    pub local_conv_size: usize,
}

/// Transformer block: windowed attention, depthwise local conv, then MLP.
pub struct TinyVitBlock {
    attn: WindowAttention,
    local_conv: Conv2dBn,
    mlp: Mlp,
    drop_path: DropPath,
    resolution: (usize, usize),
}

impl TinyVitBlock {
    pub fn new(cfg: &TinyVitBlockConfig, drop_path: f64, vb: VarBuilder) -> Result<Self> {
        let attn = WindowAttention::new(
            cfg.dim,
            cfg.num_heads,
            cfg.window_size,
            cfg.resolution,
            vb.pp("attn"),
        )?;
        let mlp_hidden = (cfg.dim as f64 * cfg.mlp_ratio) as usize;
        let mlp = Mlp::new(cfg.dim, mlp_hidden, cfg.drop, vb.pp("mlp"))?;
        let local_conv = Conv2dBn::depthwise(cfg.dim, cfg.local_conv_size, 1, vb.pp("local_conv"))?;

        Ok(Self {
            attn,
            local_conv,
            mlp,
            drop_path: DropPath::new(drop_path),
            resolution: cfg.resolution,
        })
    }

    pub fn window_attention(&self) -> &WindowAttention {
        &self.attn
    }

    pub fn drop_path(&self) -> f64 {
        self.drop_path.drop_prob()
    }
}

impl ModuleT for TinyVitBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, l, c) = x.dims3()?;
        let (h, w) = self.resolution;
        assert_eq!(l, h * w, "input feature has wrong size: {l} tokens for a {h}x{w} grid");

        let res = x;
        let x = self.attn.forward_t(x, train)?;
        let x = (res + self.drop_path.forward_t(&x, train)?)?;

        let x = x.transpose(1, 2)?.reshape((b, c, h, w))?;
        let x = self.local_conv.forward_t(&x, train)?;
        let x = x.reshape((b, c, l))?.transpose(1, 2)?;

        let mlp = self.mlp.forward_t(&x, train)?;
        &x + self.drop_path.forward_t(&mlp, train)?
    }
}

impl Parameters for TinyVitBlock {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.attn.visit_params(f);
        self.mlp.visit_params(f);
        self.local_conv.visit_params(f);
    }
}

/// Inverted-bottleneck residual block on a [B, C, H, W] tensor
pub struct MbConv {
    conv1: Conv2dBn,
    conv2: Conv2dBn,
    conv3: Conv2dBn,
    drop_path: DropPath,
}

impl MbConv {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: f64,
        drop_path: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = (in_channels as f64 * expand_ratio) as usize;
        let conv1 = Conv2dBn::new(in_channels, hidden, Conv2dBnConfig::default(), vb.pp("conv1"))?;
        let conv2 = Conv2dBn::depthwise(hidden, 3, 1, vb.pp("conv2"))?;
        let conv3_cfg = Conv2dBnConfig {
            bn_weight_init: 0.0,
            ..Default::default()
        };
        let conv3 = Conv2dBn::new(hidden, out_channels, conv3_cfg, vb.pp("conv3"))?;

        Ok(Self {
            conv1,
            conv2,
            conv3,
            drop_path: DropPath::new(drop_path),
        })
    }

    pub fn drop_path(&self) -> f64 {
        self.drop_path.drop_prob()
    }
}

impl ModuleT for MbConv {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let shortcut = x;
        let x = self.conv1.forward_t(x, train)?.gelu_erf()?;
        let x = self.conv2.forward_t(&x, train)?.gelu_erf()?;
        let x = self.conv3.forward_t(&x, train)?;
        let x = self.drop_path.forward_t(&x, train)?;
        (x + shortcut)?.gelu_erf()
    }
}

impl Parameters for MbConv {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.conv1.visit_params(f);
        self.conv2.visit_params(f);
        self.conv3.visit_params(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, D};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn mbconv_starts_as_gelu_of_input() -> Result<()> {
        let varmap = VarMap::new();
        let block = MbConv::new(8, 8, 4.0, 0.0, vb(&varmap))?;
        let x = Tensor::randn(0f32, 1.0, (2, 8, 6, 6), &Device::Cpu)?;
        let y = block.forward_t(&x, false)?;
        let expected = x.gelu_erf()?;
        let diff = (y - expected)?.abs()?.flatten_all()?.max(D::Minus1)?;
        assert!(diff.to_scalar::<f32>()? < 1e-6);
        Ok(())
    }

    #[test]
    fn transformer_block_keeps_shape_on_unaligned_grid() -> Result<()> {
        let varmap = VarMap::new();
        let cfg = TinyVitBlockConfig {
            dim: 16,
            resolution: (13, 13),
            num_heads: 2,
            window_size: 7,
            mlp_ratio: 4.0,
            drop: 0.0,
            local_conv_size: 3,
        };
        let block = TinyVitBlock::new(&cfg, 0.1, vb(&varmap))?;
        let x = Tensor::randn(0f32, 1.0, (2, 169, 16), &Device::Cpu)?;
        assert_eq!(block.forward_t(&x, false)?.dims(), &[2, 169, 16]);
        assert_eq!(block.forward_t(&x, true)?.dims(), &[2, 169, 16]);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "input feature has wrong size")]
    fn transformer_block_rejects_wrong_token_count() {
        let varmap = VarMap::new();
        let cfg = TinyVitBlockConfig {
            dim: 8,
            resolution: (4, 4),
            num_heads: 1,
            window_size: 4,
            mlp_ratio: 2.0,
            drop: 0.0,
            local_conv_size: 3,
        };
        let block = TinyVitBlock::new(&cfg, 0.0, vb(&varmap)).unwrap();
        let x = Tensor::zeros((1, 15, 8), DType::F32, &Device::Cpu).unwrap();
        let _ = block.forward_t(&x, false);
    }
}
