//! Window partition / unpartition and windowed attention over arbitrary grids.

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use crate::attention::Attention;
use crate::layers::Parameters;

/// Shape bookkeeping for one partition, needed to undo it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowLayout {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub window_size: usize,
}

impl WindowLayout {
    pub fn pad_bottom(&self) -> usize {
        (self.window_size - self.height % self.window_size) % self.window_size
    }

    pub fn pad_right(&self) -> usize {
        (self.window_size - self.width % self.window_size) % self.window_size
    }

    pub fn padded(&self) -> (usize, usize) {
        (self.height + self.pad_bottom(), self.width + self.pad_right())
    }

    /// Windows per image as (rows, cols)
    pub fn grid(&self) -> (usize, usize) {
        let (hp, wp) = self.padded();
        (hp / self.window_size, wp / self.window_size)
    }

    pub fn num_windows(&self) -> usize {
        let (nh, nw) = self.grid();
        self.batch * nh * nw
    }
}

/// Splits [B, H, W, C] into [B * nH * nW, ws * ws, C], zero-padding bottom/right.
///
/// Windows are ordered batch-major, then row blocks, then column blocks.
pub fn window_partition(x: &Tensor, window_size: usize) -> Result<(Tensor, WindowLayout)> {
    let (batch, height, width, channels) = x.dims4()?;
    let layout = WindowLayout {
        batch,
        height,
        width,
        channels,
        window_size,
    };

    let (pad_b, pad_r) = (layout.pad_bottom(), layout.pad_right());
    let x = if pad_b > 0 || pad_r > 0 {
        x.pad_with_zeros(2, 0, pad_r)?.pad_with_zeros(1, 0, pad_b)?
    } else {
        x.clone()
    };

    let (nh, nw) = layout.grid();
    let ws = window_size;
    let windows = x
        .reshape((batch, nh, ws, nw, ws, channels))?
        .transpose(2, 3)?
        .reshape((batch * nh * nw, ws * ws, channels))?;
    Ok((windows, layout))
}

/// Inverse of [`window_partition`]: back to [B, H, W, C] with padding cropped away.
pub fn window_unpartition(windows: &Tensor, layout: &WindowLayout) -> Result<Tensor> {
    let (nh, nw) = layout.grid();
    let (hp, wp) = layout.padded();
    let ws = layout.window_size;
    let (b, c) = (layout.batch, layout.channels);

    let x = windows
        .reshape((b, nh, nw, ws, ws, c))?
        .transpose(2, 3)?
        .reshape((b, hp, wp, c))?;

    if hp > layout.height || wp > layout.width {
        x.narrow(1, 0, layout.height)?
            .narrow(2, 0, layout.width)?
            .contiguous()
    } else {
        Ok(x)
    }
}

/// Attention applied independently to every window of a token grid.
pub struct WindowAttention {
    attn: Attention,
    window_size: usize,
    resolution: (usize, usize),
}

impl WindowAttention {
    pub fn new(
        dim: usize,
        num_heads: usize,
        window_size: usize,
        resolution: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let head_dim = dim / num_heads;
        let attn = Attention::new(dim, head_dim, num_heads, 1, (window_size, window_size), vb)?;
        Ok(Self {
            attn,
            window_size,
            resolution,
        })
    }

    pub fn attention(&self) -> &Attention {
        &self.attn
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Pad, partition, attend, unpartition and crop, regardless of grid size.
    pub fn forward_partitioned(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, l, c) = x.dims3()?;
        let (h, w) = self.resolution;

        let x = x.reshape((b, h, w, c))?;
        let (windows, layout) = window_partition(&x, self.window_size)?;
        let windows = self.attn.forward_t(&windows, train)?;
        let x = window_unpartition(&windows, &layout)?;
        x.reshape((b, l, c))
    }
}

impl ModuleT for WindowAttention {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (h, w) = self.resolution;
        if h == self.window_size && w == self.window_size {
            self.attn.forward_t(x, train)
        } else {
            self.forward_partitioned(x, train)
        }
    }
}

impl Parameters for WindowAttention {
    fn visit_params(&self, f: &mut dyn FnMut(&Tensor)) {
        self.attn.visit_params(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, D};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()
    }

    #[test]
    fn partition_roundtrip_is_identity() -> Result<()> {
        for (h, w, ws) in [(13, 13, 7), (14, 14, 7), (5, 9, 4), (1, 1, 3), (64, 64, 14)] {
            let x = Tensor::randn(0f32, 1.0, (2, h, w, 3), &Device::Cpu)?;
            let (windows, layout) = window_partition(&x, ws)?;
            assert_eq!(windows.dims(), &[layout.num_windows(), ws * ws, 3]);
            let back = window_unpartition(&windows, &layout)?;
            assert_eq!(back.dims(), x.dims());
            assert_eq!(max_abs_diff(&back, &x)?, 0.0, "h={h} w={w} ws={ws}");
        }
        Ok(())
    }

    #[test]
    fn thirteen_by_thirteen_pads_one() -> Result<()> {
        let x = Tensor::ones((1, 13, 13, 1), DType::F32, &Device::Cpu)?;
        let (windows, layout) = window_partition(&x, 7)?;
        assert_eq!((layout.pad_bottom(), layout.pad_right()), (1, 1));
        assert_eq!(layout.grid(), (2, 2));
        // 14 * 14 padded tokens, 13 * 13 of them real
        let total = windows.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(total, 169.0);
        Ok(())
    }

    #[test]
    fn windows_are_row_block_major() -> Result<()> {
        // token value = row * 4 + col on a 4x4 grid, window 2
        let x = Tensor::arange(0f32, 16.0, &Device::Cpu)?.reshape((1, 4, 4, 1))?;
        let (windows, _) = window_partition(&x, 2)?;
        let windows = windows.squeeze(2)?.to_vec2::<f32>()?;
        assert_eq!(windows[0], vec![0.0, 1.0, 4.0, 5.0]);
        assert_eq!(windows[1], vec![2.0, 3.0, 6.0, 7.0]);
        assert_eq!(windows[2], vec![8.0, 9.0, 12.0, 13.0]);
        Ok(())
    }

    #[test]
    fn fast_path_matches_partitioned_path() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let wa = WindowAttention::new(8, 2, 7, (7, 7), vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 49, 8), &Device::Cpu)?;

        let fast = wa.forward_t(&x, false)?;
        let general = wa.forward_partitioned(&x, false)?;
        assert!(max_abs_diff(&fast, &general)? < 1e-5);
        Ok(())
    }

    #[test]
    fn windows_do_not_leak() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let wa = WindowAttention::new(4, 1, 3, (5, 5), vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 25, 4), &Device::Cpu)?;
        let y = wa.forward_t(&x, false)?;

        // perturb token (4, 4), which lives in the bottom-right (padded) window
        let bump = Tensor::zeros((1, 24, 4), DType::F32, &Device::Cpu)?;
        let last = Tensor::ones((1, 1, 4), DType::F32, &Device::Cpu)?;
        let x2 = (&x + Tensor::cat(&[&bump, &last], 1)?)?;
        let y2 = wa.forward_t(&x2, false)?;

        // token (0, 0) sits in the top-left window and must be unchanged
        let a = y.narrow(1, 0, 1)?;
        let b = y2.narrow(1, 0, 1)?;
        assert_eq!(max_abs_diff(&a, &b)?, 0.0);
        Ok(())
    }
}
