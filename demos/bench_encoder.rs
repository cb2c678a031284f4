//! Benchmark TinyViT encoder stages

use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_tinyvit::{TinyVit, TinyVitConfig};
use std::time::Instant;

fn sync(t: &Tensor) {
    // Force GPU sync by reading a value back to CPU
    let _ = t.sum_all().and_then(|s| s.to_scalar::<f32>());
}

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

    let config = match std::env::args().nth(1).as_deref() {
        Some("5m") => TinyVitConfig::tiny_vit_5m(),
        Some("11m") => TinyVitConfig::tiny_vit_11m(),
        Some("21m") => TinyVitConfig::tiny_vit_21m(),
        _ => TinyVitConfig::mobile_sam(),
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, &device);
    let model = TinyVit::new(config.clone(), vb)?;

    let size = config.image_size;
    let x = Tensor::randn(0f32, 1.0, (1, 3, size, size), &device)?;

    println!("\nWarmup...");
    sync(&model.forward_features(&x)?);

    println!("\n=== Benchmarking stages ===");
    let start = Instant::now();
    let mut h = model.patch_embed().forward_t(&x, false)?;
    sync(&h);
    println!("Patch embed: {:?}", start.elapsed());

    for stage in model.stages() {
        let start = Instant::now();
        h = stage.forward_t(&h, false)?;
        sync(&h);
        let d = stage.descriptor();
        println!(
            "Stage {} ({:?}, {:?}): {:?}",
            d.index,
            d.kind,
            d.resolution,
            start.elapsed()
        );
    }

    let (b, _, c) = h.dims3()?;
    let (oh, ow) = model.output_resolution();
    let spatial = h.reshape((b, oh, ow, c))?.permute((0, 3, 1, 2))?;
    let start = Instant::now();
    let out = model.neck().forward(&spatial)?;
    sync(&out);
    println!("Neck: {:?}", start.elapsed());

    println!("\n=== Attention bias cache ===");
    model.invalidate_bias_caches();
    let start = Instant::now();
    sync(&model.forward_t(&x, false)?);
    println!("Eval forward (cold bias): {:?}", start.elapsed());

    let start = Instant::now();
    sync(&model.forward_t(&x, false)?);
    println!("Eval forward (cached bias): {:?}", start.elapsed());

    let start = Instant::now();
    sync(&model.forward_t(&x, true)?);
    println!("Train-mode forward: {:?}", start.elapsed());

    println!("\n=== Full encoder ===");
    let start = Instant::now();
    let features = model.forward_features(&x)?;
    sync(&features);
    println!("Total: {:?} -> {:?}", start.elapsed(), features.dims());

    Ok(())
}
