//! Stages and the downsampling transition between them.

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use crate::blocks::{MbConv, TinyVitBlock, TinyVitBlockConfig};
use crate::config::{BlockKind, StageDescriptor};
use crate::layers::{Conv2dBn, Conv2dBnConfig, Parameters};

/// Downsample transform: pointwise -> strided depthwise -> pointwise
pub struct PatchMerging {
    conv1: Conv2dBn,
    conv2: Conv2dBn,
    conv3: Conv2dBn,
    input_resolution: (usize, usize),
    stride: usize,
}

impl PatchMerging {
    pub fn new(
        input_resolution: (usize, usize),
        dim: usize,
        out_dim: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv1 = Conv2dBn::new(dim, out_dim, Conv2dBnConfig::default(), vb.pp("conv1"))?;
        let conv2 = Conv2dBn::depthwise(out_dim, 3, stride, vb.pp("conv2"))?;
        let conv3 = Conv2dBn::new(out_dim, out_dim, Conv2dBnConfig::default(), vb.pp("conv3"))?;
        Ok(Self {
            conv1,
            conv2,
            conv3,
            input_resolution,
            stride,
        })
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl ModuleT for PatchMerging {
    /// Accepts a token grid [B, H*W, C] or a spatial tensor [B, C, H, W]; returns tokens.
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = if x.rank() == 3 {
            let (b, l, c) = x.dims3()?;
            let (h, w) = self.input_resolution;
            assert_eq!(l, h * w, "downsample input has wrong size: {l} tokens for a {h}x{w} grid");
            x.reshape((b, h, w, c))?.permute((0, 3, 1, 2))?
        } else {
            x.clone()
        };

        let x = self.conv1.forward_t(&x, train)?.gelu_erf()?;
        let x = self.conv2.forward_t(&x, train)?.gelu_erf()?;
        let x = self.conv3.forward_t(&x, train)?;
        x.flatten_from(2)?.transpose(1, 2)
    }
}

impl Parameters for PatchMerging {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.conv1.visit_params(f);
        self.conv2.visit_params(f);
        self.conv3.visit_params(f);
    }
}

/// Blocks of one stage
pub enum StageBlocks {
    /// Operate on [B, C, H, W]
    Conv(Vec<MbConv>),
    /// Operate on [B, H*W, C]
    Transformer(Vec<TinyVitBlock>),
}

/// One stage: a stack of blocks followed by an optional transition.
pub struct Stage {
    blocks: StageBlocks,
    downsample: Option<PatchMerging>,
    descriptor: StageDescriptor,
}

impl Stage {
    pub fn new(
        descriptor: StageDescriptor,
        mlp_ratio: f64,
        drop_rate: f64,
        mbconv_expand_ratio: f64,
        local_conv_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let dim = descriptor.dim;
        let blocks = match descriptor.kind {
            BlockKind::Convolutional => {
                let blocks = descriptor
                    .drop_path
                    .iter()
                    .enumerate()
                    .map(|(i, &dp)| {
                        MbConv::new(dim, dim, mbconv_expand_ratio, dp, vb.pp(format!("blocks.{}", i)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                StageBlocks::Conv(blocks)
            }
            BlockKind::Transformer => {
                let block_cfg = TinyVitBlockConfig {
                    dim,
                    resolution: descriptor.resolution,
                    num_heads: descriptor.num_heads,
                    window_size: descriptor.window_size,
                    mlp_ratio,
                    drop: drop_rate,
                    local_conv_size,
                };
                let blocks = descriptor
                    .drop_path
                    .iter()
                    .enumerate()
                    .map(|(i, &dp)| TinyVitBlock::new(&block_cfg, dp, vb.pp(format!("blocks.{}", i))))
                    .collect::<Result<Vec<_>>>()?;
                StageBlocks::Transformer(blocks)
            }
        };

        let downsample = match &descriptor.downsample {
            Some(ds) => Some(PatchMerging::new(
                descriptor.resolution,
                dim,
                ds.out_dim,
                ds.stride,
                vb.pp("downsample"),
            )?),
            None => None,
        };

        tracing::debug!(
            stage = descriptor.index,
            kind = ?descriptor.kind,
            resolution = ?descriptor.resolution,
            depth = descriptor.depth,
            dim,
            drop_path = ?(descriptor.drop_path.first(), descriptor.drop_path.last()),
            downsample = ?descriptor.downsample,
            "built stage"
        );

        Ok(Self {
            blocks,
            downsample,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    pub fn blocks(&self) -> &StageBlocks {
        &self.blocks
    }

    pub fn downsample(&self) -> Option<&PatchMerging> {
        self.downsample.as_ref()
    }

    pub fn depth(&self) -> usize {
        match &self.blocks {
            StageBlocks::Conv(b) => b.len(),
            StageBlocks::Transformer(b) => b.len(),
        }
    }

    /// Per-block parameter views, in block order.
    pub fn block_params(&self) -> Vec<&dyn Parameters> {
        match &self.blocks {
            StageBlocks::Conv(blocks) => blocks.iter().map(|b| b as &dyn Parameters).collect(),
            StageBlocks::Transformer(blocks) => {
                blocks.iter().map(|b| b as &dyn Parameters).collect()
            }
        }
    }
}

impl ModuleT for Stage {
    /// Conv stages take [B, C, H, W], transformer stages [B, H*W, C]; both return tokens.
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        match &self.blocks {
            StageBlocks::Conv(blocks) => {
                for block in blocks {
                    x = block.forward_t(&x, train)?;
                }
            }
            StageBlocks::Transformer(blocks) => {
                for block in blocks {
                    x = block.forward_t(&x, train)?;
                }
            }
        }

        match &self.downsample {
            Some(downsample) => downsample.forward_t(&x, train),
            None if x.rank() == 4 => x.flatten_from(2)?.transpose(1, 2),
            None => Ok(x),
        }
    }
}

impl Parameters for Stage {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        for block in self.block_params() {
            block.visit_params(f);
        }
        self.downsample.visit_params(f);
    }
}
