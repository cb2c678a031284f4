//! Encode an image with the MobileSAM TinyViT encoder and save a feature heatmap

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use candle_tinyvit::{TinyVit, TinyVitConfig};
use image::{GenericImageView, ImageBuffer, Luma};

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

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <image_path> [output_path]", args[0]);
        eprintln!("Set TINYVIT_WEIGHTS to a MobileSAM safetensors file, random weights otherwise");
        std::process::exit(1);
    }

    let input_path = &args[1];
    let output_path = args.get(2).map(|s| s.as_str()).unwrap_or("features.png");

    let device = device()?;
    let dtype = DType::F32;
    let config = TinyVitConfig::mobile_sam();

    // MobileSAM checkpoints keep the encoder under `image_encoder.`
    let varmap = VarMap::new();
    let model = match std::env::var("TINYVIT_WEIGHTS") {
        Ok(path) => {
            println!("Loading weights from {}", path);
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, &device)? };
            TinyVit::new(config.clone(), vb.pp("image_encoder"))?
        }
        Err(_) => {
            println!("TINYVIT_WEIGHTS not set, using random weights");
            TinyVit::new(config.clone(), VarBuilder::from_varmap(&varmap, dtype, &device))?
        }
    };

    println!("Loading image: {}", input_path);
    let img = image::open(input_path)?;
    let (orig_w, orig_h) = img.dimensions();
    println!("Original size: {}x{}", orig_w, orig_h);

    let size = config.image_size as u32;
    let resized = img.resize_exact(size, size, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // ImageNet normalization, planar [1, 3, H, W]
    let mean = [0.485f32, 0.456, 0.406];
    let std = [0.229f32, 0.224, 0.225];
    let plane = (size * size) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = (y * size + x) as usize;
        for c in 0..3 {
            data[c * plane + idx] = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    let input = Tensor::from_vec(data, (1, 3, size as usize, size as usize), &device)?;

    println!("Running encoder...");
    let start = std::time::Instant::now();
    let features = model.forward_features(&input)?;
    let _ = features.sum_all()?.to_scalar::<f32>()?;
    println!("Encode time: {:?}", start.elapsed());
    println!("Features: {:?}", features.dims());

    // Channel-wise L2 norm as a heatmap
    let energy = features.sqr()?.sum(1)?.sqrt()?.squeeze(0)?;
    let min = energy.flatten_all()?.min(D::Minus1)?.to_scalar::<f32>()?;
    let max = energy.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()?;
    println!("Feature energy range: [{:.4}, {:.4}]", min, max);

    let (h, w) = model.output_resolution();
    let values: Vec<f32> = energy.flatten_all()?.to_vec1()?;
    let range = (max - min).max(f32::EPSILON);
    let heatmap: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
        let v = (values[y as usize * w + x as usize] - min) / range;
        Luma([(v * 255.0).clamp(0.0, 255.0) as u8])
    });

    let heatmap = image::imageops::resize(
        &heatmap,
        orig_w,
        orig_h,
        image::imageops::FilterType::Triangle,
    );
    heatmap.save(output_path)?;
    println!("Saved heatmap to: {}", output_path);

    Ok(())
}
