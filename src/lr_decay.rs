//! Layer-wise learning-rate decay.
//!
//! Every trainable variable gets a multiplier `decay^(depth - position - 1)` where `position`
//! counts blocks across all stages. The stem shares the first block's scale, a stage's
//! downsample shares its last block's scale, and the head and neck share the final scale.
//! The result is a side table keyed by variable name; the parameters themselves are not
//! touched.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Tensor, TensorId, Var};
use candle_nn::VarMap;

use crate::error::{Error, Result};
use crate::layers::Parameters;
use crate::model::TinyVit;

/// Leaf names of batch-norm statistics, which are stored as variables but never trained.
const BUFFER_LEAVES: [&str; 2] = ["running_mean", "running_var"];

/// Every trainable variable of a model, by identity.
#[derive(Debug, Default)]
pub struct ParamRegistry {
    names: HashMap<TensorId, String>,
}

impl ParamRegistry {
    pub fn from_varmap(varmap: &VarMap) -> Self {
        let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let names = data
            .iter()
            .filter(|(name, _)| !is_buffer(name))
            .map(|(name, var)| (var.as_tensor().id(), name.clone()))
            .collect();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name_of(&self, tensor: &Tensor) -> Option<&str> {
        self.names.get(&tensor.id()).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.values().map(String::as_str)
    }
}

fn is_buffer(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .is_some_and(|leaf| BUFFER_LEAVES.contains(&leaf))
}

/// Learning-rate multiplier per variable name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LrScaleTable {
    scales: BTreeMap<String, f64>,
}

/// Variables sharing one lr multiplier
#[derive(Debug)]
pub struct ParamGroup {
    pub lr_scale: f64,
    pub names: Vec<String>,
    pub vars: Vec<Var>,
}

impl LrScaleTable {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.scales.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.scales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.scales.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Distinct scales, ascending
    pub fn distinct_scales(&self) -> Vec<f64> {
        let mut scales: Vec<f64> = self.scales.values().copied().collect();
        scales.sort_by(f64::total_cmp);
        scales.dedup();
        scales
    }

    /// Groups the varmap's variables by scale, ascending, for optimizer setup.
    pub fn param_groups(&self, varmap: &VarMap) -> Vec<ParamGroup> {
        let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        self.distinct_scales()
            .into_iter()
            .map(|lr_scale| {
                let names: Vec<String> = self
                    .scales
                    .iter()
                    .filter(|(_, s)| **s == lr_scale)
                    .map(|(name, _)| name.clone())
                    .collect();
                let vars = names.iter().filter_map(|n| data.get(n).cloned()).collect();
                ParamGroup {
                    lr_scale,
                    names,
                    vars,
                }
            })
            .collect()
    }
}

/// `decay^(depth - i - 1)` for every block position `i`
pub fn layer_lr_scales(decay: f64, depth: usize) -> Vec<f64> {
    (0..depth)
        .map(|i| decay.powi((depth - i - 1) as i32))
        .collect()
}

struct Tagger<'a> {
    registry: &'a ParamRegistry,
    scales: BTreeMap<String, f64>,
}

impl<'a> Tagger<'a> {
    fn new(registry: &'a ParamRegistry) -> Self {
        Self {
            registry,
            scales: BTreeMap::new(),
        }
    }

    fn tag(&mut self, component: &str, params: &dyn Parameters, scale: f64) -> Result<()> {
        let registry = self.registry;
        let scales = &mut self.scales;
        let mut outcome = Ok(());
        let mut index = 0;
        params.visit_params(&mut |t| {
            if outcome.is_err() {
                return;
            }
            outcome = match registry.name_of(t) {
                None => Err(Error::UnregisteredParameter {
                    component: component.to_string(),
                    index,
                    shape: t.dims().to_vec(),
                }),
                Some(name) => match scales.insert(name.to_string(), scale) {
                    Some(_) => Err(Error::DuplicateTag(name.to_string())),
                    None => Ok(()),
                },
            };
            index += 1;
        });
        outcome
    }

    fn finish(self) -> Result<LrScaleTable> {
        let mut missing: Vec<&str> = self
            .registry
            .names()
            .filter(|name| !self.scales.contains_key(*name))
            .collect();
        missing.sort_unstable();
        if let Some(name) = missing.first() {
            return Err(Error::UntaggedParameter(name.to_string()));
        }
        Ok(LrScaleTable {
            scales: self.scales,
        })
    }
}

/// Walks stem, stage blocks, downsamples, head and neck in order and tags every parameter.
pub fn assign_layer_lr_scales(
    model: &TinyVit,
    registry: &ParamRegistry,
    decay: f64,
) -> Result<LrScaleTable> {
    let depth = model.config().total_depth();
    let lr_scales = layer_lr_scales(decay, depth);
    let (first, last) = match (lr_scales.first(), lr_scales.last()) {
        (Some(&first), Some(&last)) => (first, last),
        _ => return Err(Error::DepthMismatch { expected: 0, visited: 0 }),
    };
    let mut tagger = Tagger::new(registry);

    tagger.tag("patch_embed", &model.patch_embed, first)?;

    let mut i = 0;
    for (s, stage) in model.layers.iter().enumerate() {
        for (b, block) in stage.block_params().into_iter().enumerate() {
            let scale = *lr_scales.get(i).ok_or(Error::DepthMismatch {
                expected: depth,
                visited: i + 1,
            })?;
            tagger.tag(&format!("layers.{s}.blocks.{b}"), block, scale)?;
            i += 1;
        }
        if let Some(downsample) = stage.downsample() {
            let scale = lr_scales[i.saturating_sub(1)];
            tagger.tag(&format!("layers.{s}.downsample"), downsample, scale)?;
        }
    }
    if i != depth {
        return Err(Error::DepthMismatch {
            expected: depth,
            visited: i,
        });
    }

    tagger.tag("norm_head", &model.norm_head, last)?;
    tagger.tag("head", &model.head, last)?;
    tagger.tag("neck", &model.neck, last)?;

    let table = tagger.finish()?;
    tracing::info!(
        params = table.len(),
        decay,
        distinct_scales = table.distinct_scales().len(),
        "assigned layer-wise lr scales"
    );
    Ok(table)
}
