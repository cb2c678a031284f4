//! TinyViT configuration and stage layout.
//!
//! The configuration is plain data; [`TinyVitConfig::stage_descriptors`] turns it into the
//! immutable per-stage layout the model is assembled from.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Channel widths whose incoming transition keeps the spatial resolution (stride 1).
pub const KEEP_RESOLUTION_DIMS: [usize; 3] = [320, 448, 576];

/// Configuration for TinyViT
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TinyVitConfig {
    pub image_size: usize,
    pub in_channels: usize,
    /// Classes of the optional classification head, 0 disables it
    pub num_classes: usize,
    pub embed_dims: Vec<usize>,
    pub depths: Vec<usize>,
    pub num_heads: Vec<usize>,
    pub window_sizes: Vec<usize>,
    pub mlp_ratio: f64,
    pub drop_rate: f64,
    pub drop_path_rate: f64,
    /// Recompute-for-memory toggle, recorded on every stage
    pub use_checkpoint: bool,
    pub mbconv_expand_ratio: f64,
    pub local_conv_size: usize,
    pub layer_lr_decay: f64,
    /// Output channels of the feature neck
    pub neck_channels: usize,
    /// Stage widths reached through a stride-1 transition
    pub keep_resolution_dims: Vec<usize>,
}

impl Default for TinyVitConfig {
    fn default() -> Self {
        Self {
            drop_path_rate: 0.1,
            ..Self::tiny_vit_5m()
        }
    }
}

impl TinyVitConfig {
    /// TinyViT-5M, 224px
    pub fn tiny_vit_5m() -> Self {
        Self {
            image_size: 224,
            in_channels: 3,
            num_classes: 1000,
            embed_dims: vec![64, 128, 160, 320],
            depths: vec![2, 2, 6, 2],
            num_heads: vec![2, 4, 5, 10],
            window_sizes: vec![7, 7, 14, 7],
            mlp_ratio: 4.0,
            drop_rate: 0.0,
            drop_path_rate: 0.0,
            use_checkpoint: false,
            mbconv_expand_ratio: 4.0,
            local_conv_size: 3,
            layer_lr_decay: 1.0,
            neck_channels: 256,
            keep_resolution_dims: KEEP_RESOLUTION_DIMS.to_vec(),
        }
    }

    /// TinyViT-11M, 224px
    pub fn tiny_vit_11m() -> Self {
        Self {
            embed_dims: vec![64, 128, 256, 448],
            num_heads: vec![2, 4, 8, 14],
            drop_path_rate: 0.1,
            ..Self::tiny_vit_5m()
        }
    }

    /// TinyViT-21M, 224px
    pub fn tiny_vit_21m() -> Self {
        Self {
            embed_dims: vec![96, 192, 384, 576],
            num_heads: vec![3, 6, 12, 18],
            drop_path_rate: 0.2,
            ..Self::tiny_vit_5m()
        }
    }

    /// MobileSAM image encoder (1024px input, 64x64 feature map)
    pub fn mobile_sam() -> Self {
        Self {
            image_size: 1024,
            layer_lr_decay: 0.8,
            ..Self::tiny_vit_5m()
        }
    }

    pub fn num_stages(&self) -> usize {
        self.depths.len()
    }

    /// Total number of blocks across all stages
    pub fn total_depth(&self) -> usize {
        self.depths.iter().sum()
    }

    /// Token grid side produced by the stride-4 stem
    pub fn patches_resolution(&self) -> usize {
        conv3x3_out(conv3x3_out(self.image_size, 2), 2)
    }

    /// Stride of the transition into a stage of width `out_dim`
    pub fn downsample_stride(&self, out_dim: usize) -> usize {
        if self.keep_resolution_dims.contains(&out_dim) {
            1
        } else {
            2
        }
    }

    /// Globally linear stochastic-depth schedule, one entry per block.
    pub fn drop_path_schedule(&self) -> Vec<f64> {
        let total = self.total_depth();
        match total {
            0 => Vec::new(),
            1 => vec![0.0],
            _ => (0..total)
                .map(|i| self.drop_path_rate * i as f64 / (total - 1) as f64)
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.num_stages();
        if n == 0 {
            return Err(invalid("at least one stage is required"));
        }
        for (name, len) in [
            ("embed_dims", self.embed_dims.len()),
            ("num_heads", self.num_heads.len()),
            ("window_sizes", self.window_sizes.len()),
        ] {
            if len != n {
                return Err(invalid(format!("{name} has {len} entries, depths has {n}")));
            }
        }
        if self.image_size == 0 || self.in_channels == 0 {
            return Err(invalid("image_size and in_channels must be non-zero"));
        }
        if self.embed_dims[0] < 2 {
            return Err(invalid("first stage width must be at least 2"));
        }
        for i in 0..n {
            if self.depths[i] == 0 || self.embed_dims[i] == 0 {
                return Err(invalid(format!("stage {i} has zero depth or width")));
            }
            if i > 0 {
                let (dim, heads, ws) = (self.embed_dims[i], self.num_heads[i], self.window_sizes[i]);
                if heads == 0 || dim % heads != 0 {
                    return Err(invalid(format!(
                        "stage {i}: width {dim} is not divisible by {heads} heads"
                    )));
                }
                if ws == 0 {
                    return Err(invalid(format!("stage {i}: window size must be non-zero")));
                }
            }
        }
        if self.local_conv_size % 2 == 0 {
            return Err(invalid("local_conv_size must be odd"));
        }
        if !(0.0..1.0).contains(&self.drop_path_rate) || !(0.0..1.0).contains(&self.drop_rate) {
            return Err(invalid("drop rates must lie in [0, 1)"));
        }
        if self.layer_lr_decay <= 0.0 {
            return Err(invalid("layer_lr_decay must be positive"));
        }
        if self.mlp_ratio <= 0.0 || self.mbconv_expand_ratio <= 0.0 || self.neck_channels == 0 {
            return Err(invalid("expansion ratios and neck width must be positive"));
        }
        Ok(())
    }

    /// Per-stage layout: kind, resolution, drop-path slice and outgoing transition.
    pub fn stage_descriptors(&self) -> Result<Vec<StageDescriptor>> {
        self.validate()?;
        let dpr = self.drop_path_schedule();
        let n = self.num_stages();
        let base = self.patches_resolution();

        let mut stages = Vec::with_capacity(n);
        let mut resolution = (base, base);
        let mut offset = 0;
        for i in 0..n {
            let depth = self.depths[i];
            let downsample = (i + 1 < n).then(|| {
                let out_dim = self.embed_dims[i + 1];
                DownsampleSpec {
                    out_dim,
                    stride: self.downsample_stride(out_dim),
                }
            });
            stages.push(StageDescriptor {
                index: i,
                dim: self.embed_dims[i],
                resolution,
                depth,
                kind: if i == 0 {
                    BlockKind::Convolutional
                } else {
                    BlockKind::Transformer
                },
                num_heads: self.num_heads[i],
                window_size: self.window_sizes[i],
                drop_path: dpr[offset..offset + depth].to_vec(),
                downsample: downsample.clone(),
                use_checkpoint: self.use_checkpoint,
            });
            offset += depth;
            if let Some(ds) = downsample {
                resolution = (
                    conv3x3_out(resolution.0, ds.stride),
                    conv3x3_out(resolution.1, ds.stride),
                );
            }
        }
        Ok(stages)
    }
}

/// Block family used by a stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Convolutional,
    Transformer,
}

/// Transition to the next stage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownsampleSpec {
    pub out_dim: usize,
    pub stride: usize,
}

/// Immutable description of one stage
#[derive(Clone, Debug, PartialEq)]
pub struct StageDescriptor {
    pub index: usize,
    pub dim: usize,
    /// Token grid (rows, cols) this stage operates on
    pub resolution: (usize, usize),
    pub depth: usize,
    pub kind: BlockKind,
    /// Unused by convolutional stages
    pub num_heads: usize,
    /// Unused by convolutional stages
    pub window_size: usize,
    pub drop_path: Vec<f64>,
    pub downsample: Option<DownsampleSpec>,
    pub use_checkpoint: bool,
}

impl StageDescriptor {
    /// Resolution after the outgoing transition
    pub fn output_resolution(&self) -> (usize, usize) {
        match &self.downsample {
            Some(ds) => (
                conv3x3_out(self.resolution.0, ds.stride),
                conv3x3_out(self.resolution.1, ds.stride),
            ),
            None => self.resolution,
        }
    }

    pub fn output_dim(&self) -> usize {
        self.downsample.as_ref().map_or(self.dim, |ds| ds.out_dim)
    }
}

/// Output side of a 3x3 convolution with padding 1.
pub(crate) fn conv3x3_out(size: usize, stride: usize) -> usize {
    (size + 2 - 3) / stride + 1
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}
