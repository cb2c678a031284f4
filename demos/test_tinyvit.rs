//! Build a MobileSAM-sized TinyViT with random weights and check the feature map

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use candle_tinyvit::{BlockKind, TinyVit, TinyVitConfig};

fn device() -> candle_core::Result<Device> {
    if cfg!(feature = "metal") {
        Device::new_metal(0)
    } else if cfg!(feature = "cuda") {
        Device::new_cuda(0)
    } else {
        Ok(Device::Cpu)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let device = device()?;
    let dtype = DType::F32;

    println!("Testing TinyViT encoder...\n");

    let config = TinyVitConfig::mobile_sam();
    println!("Config: mobile_sam");
    println!("  image_size: {}", config.image_size);
    println!("  embed_dims: {:?}", config.embed_dims);
    println!("  depths: {:?}", config.depths);
    println!("  num_heads: {:?}", config.num_heads);
    println!("  window_sizes: {:?}", config.window_sizes);

    let varmap = VarMap::new();
    println!("\nBuilding model...");
    let model = TinyVit::new_trainable(config.clone(), &varmap, dtype, &device)?;

    println!("\nStages:");
    for d in model.stage_descriptors() {
        let kind = match d.kind {
            BlockKind::Convolutional => "mbconv",
            BlockKind::Transformer => "attn",
        };
        println!(
            "  Stage {}: {:>6} dim={:<4} {:?} depth={} -> {:?}",
            d.index,
            kind,
            d.dim,
            d.resolution,
            d.depth,
            d.output_resolution()
        );
    }

    if let Some(table) = model.lr_scales() {
        println!("\nlr scales ({} params):", table.len());
        for group in table.param_groups(&varmap) {
            println!("  {:.4}: {} tensors", group.lr_scale, group.vars.len());
        }
    }

    let size = config.image_size;
    let input = Tensor::randn(0f32, 1.0, (1, 3, size, size), &device)?;
    println!("\nInput shape: [1, 3, {}, {}]", size, size);

    println!("Running forward pass...");
    let start = std::time::Instant::now();
    let features = model.forward_features(&input)?;
    let _ = features.sum_all()?.to_scalar::<f32>()?;
    println!("Forward time: {:?}", start.elapsed());
    println!("Output: {:?}", features.dims());

    let (h, w) = model.output_resolution();
    assert_eq!(features.dims(), &[1, config.neck_channels, h, w]);
    println!("\nExpected [1, 256, 64, 64] for mobile_sam");
    println!("TinyViT test passed!");

    Ok(())
}
