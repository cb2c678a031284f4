//! TinyViT encoder: stem, stages, classification head and feature neck.

use candle_core::{DType, Device, Module, ModuleT, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder, VarMap};

use crate::config::{StageDescriptor, TinyVitConfig};
use crate::layers::{Conv2dBn, Conv2dBnConfig, LayerNorm2d, Parameters};
use crate::lr_decay::{assign_layer_lr_scales, LrScaleTable, ParamRegistry};
use crate::stage::{Stage, StageBlocks};

/// Stride-4 convolutional stem
pub struct PatchEmbed {
    conv1: Conv2dBn,
    conv2: Conv2dBn,
}

impl PatchEmbed {
    pub fn new(in_channels: usize, embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dBnConfig {
            kernel: 3,
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let conv1 = Conv2dBn::new(in_channels, embed_dim / 2, cfg, vb.pp("seq.0"))?;
        let conv2 = Conv2dBn::new(embed_dim / 2, embed_dim, cfg, vb.pp("seq.2"))?;
        Ok(Self { conv1, conv2 })
    }
}

impl ModuleT for PatchEmbed {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv1.forward_t(x, train)?.gelu_erf()?;
        self.conv2.forward_t(&x, train)
    }
}

impl Parameters for PatchEmbed {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.conv1.visit_params(f);
        self.conv2.visit_params(f);
    }
}

/// Projects the last stage to a fixed channel count: 1x1 conv, LN, 3x3 conv, LN.
pub struct FeatureNeck {
    conv1: Conv2d,
    norm1: LayerNorm2d,
    conv2: Conv2d,
    norm2: LayerNorm2d,
}

impl FeatureNeck {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = candle_nn::conv2d_no_bias(in_channels, out_channels, 1, Default::default(), vb.pp("0"))?;
        let norm1 = LayerNorm2d::new(out_channels, vb.pp("1"))?;
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv2 = candle_nn::conv2d_no_bias(out_channels, out_channels, 3, cfg, vb.pp("2"))?;
        let norm2 = LayerNorm2d::new(out_channels, vb.pp("3"))?;
        Ok(Self {
            conv1,
            norm1,
            conv2,
            norm2,
        })
    }
}

impl Module for FeatureNeck {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(x)?;
        let x = self.norm1.forward(&x)?;
        let x = self.conv2.forward(&x)?;
        self.norm2.forward(&x)
    }
}

impl Parameters for FeatureNeck {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.conv1.visit_params(f);
        self.norm1.visit_params(f);
        self.conv2.visit_params(f);
        self.norm2.visit_params(f);
    }
}

/// TinyViT image encoder
pub struct TinyVit {
    pub(crate) patch_embed: PatchEmbed,
    pub(crate) layers: Vec<Stage>,
    pub(crate) norm_head: LayerNorm,
    pub(crate) head: Option<Linear>,
    pub(crate) neck: FeatureNeck,
    config: TinyVitConfig,
    lr_scales: Option<LrScaleTable>,
}

impl TinyVit {
    /// Builds the encoder from any weight source (no lr-scale table).
    pub fn new(config: TinyVitConfig, vb: VarBuilder) -> crate::Result<Self> {
        let descriptors = config.stage_descriptors()?;

        let patch_embed = PatchEmbed::new(config.in_channels, config.embed_dims[0], vb.pp("patch_embed"))?;

        let mut layers = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let index = descriptor.index;
            let stage = Stage::new(
                descriptor,
                config.mlp_ratio,
                config.drop_rate,
                config.mbconv_expand_ratio,
                config.local_conv_size,
                vb.pp(format!("layers.{}", index)),
            )?;
            layers.push(stage);
        }

        let last_dim = config.embed_dims[config.num_stages() - 1];
        let norm_head = candle_nn::layer_norm(last_dim, 1e-5, vb.pp("norm_head"))?;
        let head = if config.num_classes > 0 {
            Some(candle_nn::linear(last_dim, config.num_classes, vb.pp("head"))?)
        } else {
            None
        };
        let neck = FeatureNeck::new(last_dim, config.neck_channels, vb.pp("neck"))?;

        let model = Self {
            patch_embed,
            layers,
            norm_head,
            head,
            neck,
            config,
            lr_scales: None,
        };
        tracing::info!(
            stages = model.layers.len(),
            blocks = model.config.total_depth(),
            params = model.param_count(),
            output = ?model.output_resolution(),
            "built TinyViT"
        );
        Ok(model)
    }

    /// Builds the encoder on fresh variables and tags every one with its lr scale.
    ///
    /// `varmap` must not hold variables from other models: any variable the walk does not
    /// reach is reported as untagged.
    pub fn new_trainable(
        config: TinyVitConfig,
        varmap: &VarMap,
        dtype: DType,
        device: &Device,
    ) -> crate::Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, dtype, device);
        let mut model = Self::new(config, vb)?;
        let registry = ParamRegistry::from_varmap(varmap);
        let table = assign_layer_lr_scales(&model, &registry, model.config.layer_lr_decay)?;
        model.lr_scales = Some(table);
        Ok(model)
    }

    pub fn config(&self) -> &TinyVitConfig {
        &self.config
    }

    pub fn patch_embed(&self) -> &PatchEmbed {
        &self.patch_embed
    }

    pub fn stages(&self) -> &[Stage] {
        &self.layers
    }

    pub fn neck(&self) -> &FeatureNeck {
        &self.neck
    }

    pub fn stage_descriptors(&self) -> Vec<&StageDescriptor> {
        self.layers.iter().map(|s| s.descriptor()).collect()
    }

    /// Side table of per-parameter lr multipliers, present on trainable models.
    pub fn lr_scales(&self) -> Option<&LrScaleTable> {
        self.lr_scales.as_ref()
    }

    /// Spatial size of the feature map returned by [`TinyVit::forward_features`].
    pub fn output_resolution(&self) -> (usize, usize) {
        self.layers
            .last()
            .map(|s| s.descriptor().output_resolution())
            .unwrap_or((0, 0))
    }

    /// Drops every cached attention bias; call after parameters were updated.
    pub fn invalidate_bias_caches(&self) {
        for stage in &self.layers {
            if let StageBlocks::Transformer(blocks) = stage.blocks() {
                for block in blocks {
                    block.window_attention().attention().invalidate_cache();
                }
            }
        }
    }

    /// Stem and stages; returns the final token grid [B, H*W, C].
    pub fn forward_tokens(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (_, c, h, w) = x.dims4()?;
        let size = self.config.image_size;
        assert_eq!(
            (c, h, w),
            (self.config.in_channels, size, size),
            "expected input [B, {}, {size}, {size}]",
            self.config.in_channels
        );

        let mut x = self.patch_embed.forward_t(x, train)?;
        for layer in &self.layers {
            x = layer.forward_t(&x, train)?;
        }
        Ok(x)
    }

    /// Feature map [B, neck_channels, H, W]
    pub fn forward_features_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.forward_tokens(x, train)?;
        let (b, _, c) = x.dims3()?;
        let (h, w) = self.output_resolution();
        let x = x.reshape((b, h, w, c))?.permute((0, 3, 1, 2))?;
        self.neck.forward(&x)
    }

    pub fn forward_features(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_features_t(x, false)
    }

    /// Class logits from the mean token; the tokens themselves if there is no head.
    pub fn classify_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.forward_tokens(x, train)?.mean(1)?;
        let x = self.norm_head.forward(&x)?;
        match &self.head {
            Some(head) => head.forward(&x),
            None => Ok(x),
        }
    }

    pub fn classify(&self, x: &Tensor) -> Result<Tensor> {
        self.classify_t(x, false)
    }
}

impl ModuleT for TinyVit {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_features_t(xs, train)
    }
}

impl Parameters for TinyVit {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.patch_embed.visit_params(f);
        self.layers.visit_params(f);
        self.norm_head.visit_params(f);
        self.head.visit_params(f);
        self.neck.visit_params(f);
    }
}
