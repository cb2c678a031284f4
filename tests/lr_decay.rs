use candle_core::{DType, Device};
use candle_nn::{Init, VarBuilder, VarMap};
use candle_tinyvit::{
    assign_layer_lr_scales, Error, ParamRegistry, Parameters, TinyVit, TinyVitConfig,
};

/// Five blocks over four stages, decay 0.5: scales 1/16, 1/8, 1/4, 1/2, 1.
fn config() -> TinyVitConfig {
    TinyVitConfig {
        image_size: 64,
        num_classes: 10,
        embed_dims: vec![8, 16, 24, 32],
        depths: vec![1, 2, 1, 1],
        num_heads: vec![1, 2, 3, 4],
        window_sizes: vec![7, 7, 7, 4],
        layer_lr_decay: 0.5,
        keep_resolution_dims: vec![32],
        ..TinyVitConfig::tiny_vit_5m()
    }
}

fn trainable(varmap: &VarMap) -> candle_tinyvit::Result<TinyVit> {
    TinyVit::new_trainable(config(), varmap, DType::F32, &Device::Cpu)
}

#[test]
fn every_trainable_variable_is_tagged() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let model = trainable(&varmap)?;
    let table = model.lr_scales().expect("trainable model carries lr scales");
    let registry = ParamRegistry::from_varmap(&varmap);

    assert_eq!(table.len(), registry.len());
    for name in registry.names() {
        assert!(table.get(name).is_some(), "{name} untagged");
    }
    assert_eq!(model.params().len(), registry.len());
    assert!(table.iter().all(|(name, _)| !name.ends_with("running_mean")));
    assert!(table.iter().all(|(name, _)| !name.ends_with("running_var")));
    Ok(())
}

#[test]
fn scales_follow_block_position() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let model = trainable(&varmap)?;
    let table = model.lr_scales().expect("trainable model carries lr scales");
    let scale = |name: &str| table.get(name).unwrap_or_else(|| panic!("{name} missing"));

    assert_eq!(scale("layers.0.blocks.0.conv1.c.weight"), 0.0625);
    assert_eq!(scale("layers.1.blocks.0.attn.qkv.weight"), 0.125);
    assert_eq!(scale("layers.1.blocks.1.mlp.fc2.bias"), 0.25);
    assert_eq!(scale("layers.2.blocks.0.local_conv.bn.weight"), 0.5);
    assert_eq!(scale("layers.3.blocks.0.attn.attention_biases"), 1.0);

    // stem shares the first block, a downsample its stage's last block
    assert_eq!(scale("patch_embed.seq.0.c.weight"), 0.0625);
    assert_eq!(scale("patch_embed.seq.2.bn.bias"), 0.0625);
    assert_eq!(scale("layers.0.downsample.conv1.c.weight"), 0.0625);
    assert_eq!(scale("layers.1.downsample.conv2.c.weight"), 0.25);
    assert_eq!(scale("layers.2.downsample.conv3.bn.weight"), 0.5);

    for name in ["norm_head.weight", "head.weight", "head.bias", "neck.0.weight", "neck.3.bias"] {
        assert_eq!(scale(name), 1.0, "{name}");
    }
    Ok(())
}

#[test]
fn param_groups_partition_the_variables() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let model = trainable(&varmap)?;
    let table = model.lr_scales().expect("trainable model carries lr scales");

    let groups = table.param_groups(&varmap);
    let scales: Vec<f64> = groups.iter().map(|g| g.lr_scale).collect();
    assert_eq!(scales, vec![0.0625, 0.125, 0.25, 0.5, 1.0]);

    let total: usize = groups.iter().map(|g| g.vars.len()).sum();
    assert_eq!(total, table.len());
    for group in &groups {
        assert_eq!(group.names.len(), group.vars.len());
    }
    Ok(())
}

#[test]
fn foreign_variable_is_reported() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    vb.pp("stray").get_with_hints(4, "weight", Init::Const(1.))?;

    match trainable(&varmap) {
        Err(Error::UntaggedParameter(name)) => assert_eq!(name, "stray.weight"),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("stray variable went unnoticed"),
    }
    Ok(())
}

#[test]
fn no_decay_gives_uniform_scales() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let model = TinyVit::new_trainable(
        TinyVitConfig {
            layer_lr_decay: 1.0,
            ..config()
        },
        &varmap,
        DType::F32,
        &Device::Cpu,
    )?;
    let table = model.lr_scales().expect("trainable model carries lr scales");
    assert_eq!(table.distinct_scales(), vec![1.0]);
    Ok(())
}

#[test]
fn plain_models_have_no_table() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = TinyVit::new(config(), vb)?;
    assert!(model.lr_scales().is_none());
    Ok(())
}

#[test]
fn parameters_outside_the_registry_are_reported() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = TinyVit::new(config(), vb)?;

    // registry of an unrelated model with the same layout
    let other = VarMap::new();
    trainable(&other)?;
    let registry = ParamRegistry::from_varmap(&other);

    match assign_layer_lr_scales(&model, &registry, 0.5) {
        Err(Error::UnregisteredParameter {
            component,
            index,
            shape,
        }) => {
            assert_eq!(component, "patch_embed");
            assert_eq!(index, 0);
            // first stem conv: 3 -> embed_dims[0] / 2, 3x3
            assert_eq!(shape, vec![4, 3, 3, 3]);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("foreign registry went unnoticed"),
    }
    Ok(())
}
