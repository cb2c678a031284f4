//! TinyViT - hierarchical vision encoder for candle
//!
//! A convolutional first stage followed by windowed-attention stages, finished by a small
//! conv neck. With [`TinyVitConfig::mobile_sam`] this is the MobileSAM image encoder,
//! producing a [B, 256, 64, 64] feature map from a 1024x1024 image.
//! https://github.com/microsoft/Cream/tree/main/TinyViT

pub mod attention;
pub mod blocks;
pub mod config;
pub mod error;
pub mod layers;
pub mod lr_decay;
pub mod model;
pub mod stage;
pub mod window;

pub use attention::{Attention, BiasCache, RelativeOffsetTable};
pub use config::{BlockKind, DownsampleSpec, StageDescriptor, TinyVitConfig};
pub use error::{Error, Result};
pub use layers::Parameters;
pub use lr_decay::{assign_layer_lr_scales, LrScaleTable, ParamGroup, ParamRegistry};
pub use model::TinyVit;
pub use window::{window_partition, window_unpartition, WindowAttention, WindowLayout};
