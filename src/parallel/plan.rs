// Copyright 2021 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::gpt2::{Gpt2Config, Gpt2LayerPolicy, Gpt2Model};
use crate::gpt_neo::{GptNeoConfig, GptNeoLayerPolicy, GptNeoModel};
use crate::parallel::layer::{Layer, ModuleKind, Replacement, ShardingStrategy};
use crate::parallel::policy::{check_divisible, check_world_size, LayerPolicy};
use crate::TensorParallelError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// # Role of a descriptor within the model
pub enum LayerRole {
    AttnQkv,
    AttnOut,
    AttnNorm,
    MlpIn,
    MlpOut,
    MlpNorm,
    WordEmbedding,
    PreBlock,
    PostBlock,
    CopyToAll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// # Sharding instruction for a single module
pub struct ShardSpec {
    /// Module path relative to the base model
    pub name: String,
    pub role: LayerRole,
    pub module: ModuleKind,
    pub strategy: ShardingStrategy,
    pub replace: Option<Replacement>,
    pub combined_qkv: bool,
    pub reversed: bool,
    /// Full (unsharded) weight shape
    pub weight_shape: Option<Vec<i64>>,
    /// Weight shape held by each rank
    pub weight_shard_shape: Option<Vec<i64>>,
    pub bias_shape: Option<Vec<i64>>,
    pub bias_shard_shape: Option<Vec<i64>>,
}

impl ShardSpec {
    /// Builds the instruction for a descriptor, computing the per-rank shapes.
    ///
    /// Column-parallel layers split the output features and their bias, row-parallel layers
    /// split the input features and keep the bias whole (it is added once after the
    /// reduction). Vocabulary-parallel embeddings split the rows; the last rank is padded
    /// when the vocabulary size is not a multiple of `world_size`.
    pub fn from_layer(
        layer: &Layer,
        role: LayerRole,
        world_size: i64,
    ) -> Result<ShardSpec, TensorParallelError> {
        let strategy = layer.strategy();
        let weight_shape = layer.weight.map(|weight| weight.size());
        let bias_shape = layer.bias.map(|bias| bias.size());

        let weight_shard_shape = match &weight_shape {
            Some(shape) => Some(shard_weight_shape(layer, strategy, shape, world_size)?),
            None => None,
        };
        let bias_shard_shape = match &bias_shape {
            Some(shape) if strategy == ShardingStrategy::ColumnParallel => {
                let mut shard = shape.clone();
                let features = shard[0];
                check_split_features(layer, strategy, features, world_size, "bias")?;
                shard[0] = features / world_size;
                Some(shard)
            }
            Some(shape) => Some(shape.clone()),
            None => None,
        };

        Ok(ShardSpec {
            name: layer.name.clone(),
            role,
            module: layer.module,
            strategy,
            replace: layer.replace,
            combined_qkv: layer.combined_qkv,
            reversed: layer.reversed,
            weight_shape,
            weight_shard_shape,
            bias_shape,
            bias_shard_shape,
        })
    }
}

fn shard_weight_shape(
    layer: &Layer,
    strategy: ShardingStrategy,
    shape: &[i64],
    world_size: i64,
) -> Result<Vec<i64>, TensorParallelError> {
    let mut shard = shape.to_vec();
    let split_dim = match strategy {
        ShardingStrategy::Replicated => return Ok(shard),
        ShardingStrategy::VocabParallel => {
            check_world_size(world_size)?;
            shard[0] = (shape[0] + world_size - 1) / world_size;
            return Ok(shard);
        }
        ShardingStrategy::ColumnParallel => usize::from(layer.reversed),
        ShardingStrategy::RowParallel => usize::from(!layer.reversed),
    };
    if shape.len() != 2 {
        return Err(TensorParallelError::ShardingPreconditionError(format!(
            "{} expects a 2D weight, got shape {:?}",
            layer.name, shape
        )));
    }
    let features = shape[split_dim];
    check_split_features(layer, strategy, features, world_size, "features")?;
    shard[split_dim] = features / world_size;
    Ok(shard)
}

/// Combined query/key/value dimensions are split per third, each third must divide evenly.
fn check_split_features(
    layer: &Layer,
    strategy: ShardingStrategy,
    features: i64,
    world_size: i64,
    tensor: &str,
) -> Result<(), TensorParallelError> {
    let description = format!("{} {}", layer.name, tensor);
    if layer.combined_qkv && strategy == ShardingStrategy::ColumnParallel {
        if features % 3 != 0 {
            return Err(TensorParallelError::ShardingPreconditionError(format!(
                "{} combined query/key/value size ({}) is not a multiple of 3",
                description, features
            )));
        }
        check_divisible(features / 3, world_size, &description)
    } else {
        check_divisible(features, world_size, &description)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// # Sharding instructions for one transformer block
pub struct BlockPlan {
    pub index: usize,
    pub layers: Vec<ShardSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// # Complete sharding plan handed to the parallel runtime
pub struct ShardingPlan {
    pub block_kind: ModuleKind,
    pub world_size: i64,
    pub word_embedding: Vec<ShardSpec>,
    pub preblock_layers: Vec<ShardSpec>,
    pub blocks: Vec<BlockPlan>,
    pub postblock_layers: Vec<ShardSpec>,
    pub fused_modules: HashMap<ModuleKind, ModuleKind>,
}

fn to_specs(
    layers: Vec<Layer>,
    role: LayerRole,
    world_size: i64,
) -> Result<Vec<ShardSpec>, TensorParallelError> {
    layers
        .iter()
        .map(|layer| ShardSpec::from_layer(layer, role, world_size))
        .collect()
}

impl ShardingPlan {
    /// Walks a policy over `model` and collects the sharding instructions for every module.
    ///
    /// # Arguments
    ///
    /// * `model` - base model the policy applies to
    /// * `config` - model configuration
    /// * `world_size` - number of tensor-parallel ranks
    ///
    /// # Errors
    ///
    /// `ShardingPreconditionError` if a sharded dimension is not divisible by `world_size`.
    pub fn from_policy<P: LayerPolicy>(
        model: &P::Model,
        config: &P::Config,
        world_size: i64,
    ) -> Result<ShardingPlan, TensorParallelError> {
        check_world_size(world_size)?;

        let word_embedding = to_specs(
            P::word_embedding(model, config),
            LayerRole::WordEmbedding,
            world_size,
        )?;
        let preblock_layers = to_specs(
            P::preblock_layers(model, config),
            LayerRole::PreBlock,
            world_size,
        )?;
        let postblock_layers = to_specs(
            P::postblock_layers(model, config),
            LayerRole::PostBlock,
            world_size,
        )?;

        let mut blocks = Vec::new();
        for (index, block) in P::block_layers(model, config).iter().enumerate() {
            let mut layers = Vec::new();
            for (role, descriptors) in [
                (LayerRole::AttnQkv, P::attn_qkv(block, config)),
                (LayerRole::AttnOut, P::attn_out(block, config)),
                (LayerRole::AttnNorm, P::attn_norm(block, config)),
                (LayerRole::MlpIn, P::mlp_in(block, config)),
                (LayerRole::MlpOut, P::mlp_out(block, config)),
                (LayerRole::MlpNorm, P::mlp_norm(block, config)),
                (LayerRole::CopyToAll, P::copy_to_all(block, config)),
            ] {
                layers.extend(to_specs(descriptors, role, world_size)?);
            }
            blocks.push(BlockPlan { index, layers });
        }

        debug!(
            block_kind = %P::original_layer_class(),
            world_size,
            num_blocks = blocks.len(),
            "built sharding plan"
        );

        Ok(ShardingPlan {
            block_kind: P::original_layer_class(),
            world_size,
            word_embedding,
            preblock_layers,
            blocks,
            postblock_layers,
            fused_modules: P::fused_modules(),
        })
    }

    /// Iterates over every instruction of the plan, model-level sections included.
    pub fn iter_specs(&self) -> impl Iterator<Item = &ShardSpec> {
        self.word_embedding
            .iter()
            .chain(self.preblock_layers.iter())
            .chain(self.blocks.iter().flat_map(|block| block.layers.iter()))
            .chain(self.postblock_layers.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// # Model families with a tensor-parallel policy
pub enum ModelFamily {
    GptNeo,
    Gpt2,
}

#[derive(Deserialize)]
struct ModelTypeField {
    model_type: Option<String>,
}

impl ModelFamily {
    /// Reads the family from the `model_type` field of a Transformers-style `config.json`.
    ///
    /// # Errors
    ///
    /// `InvalidConfigurationError` if the field is missing or names a model type without a
    /// tensor-parallel policy.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ModelFamily, TensorParallelError> {
        let f = File::open(path)?;
        let field: ModelTypeField = serde_json::from_reader(BufReader::new(f))?;
        match field.model_type {
            Some(model_type) => model_type.parse(),
            None => Err(TensorParallelError::InvalidConfigurationError(
                "configuration file has no model_type field".into(),
            )),
        }
    }

    /// `model_type` value written in the configuration files of the family
    pub fn model_type(&self) -> &'static str {
        match self {
            ModelFamily::GptNeo => "gpt_neo",
            ModelFamily::Gpt2 => "gpt2",
        }
    }

    /// Block kind targeted by the family's policy
    pub fn block_kind(&self) -> ModuleKind {
        match self {
            ModelFamily::GptNeo => GptNeoLayerPolicy::original_layer_class(),
            ModelFamily::Gpt2 => Gpt2LayerPolicy::original_layer_class(),
        }
    }
}

impl FromStr for ModelFamily {
    type Err = TensorParallelError;

    fn from_str(model_type: &str) -> Result<Self, Self::Err> {
        [ModelFamily::GptNeo, ModelFamily::Gpt2]
            .into_iter()
            .find(|family| family.model_type() == model_type)
            .ok_or_else(|| {
                TensorParallelError::InvalidConfigurationError(format!(
                    "no tensor-parallel policy registered for model type {}",
                    model_type
                ))
            })
    }
}

/// # Model handed over to the parallel runtime
/// Pairs a base model with its configuration and dispatches to the matching policy.
pub enum ParallelModel<'a> {
    GptNeo(&'a mut GptNeoModel, &'a GptNeoConfig),
    Gpt2(&'a mut Gpt2Model, &'a Gpt2Config),
}

impl<'a> ParallelModel<'a> {
    pub fn family(&self) -> ModelFamily {
        match self {
            ParallelModel::GptNeo(..) => ModelFamily::GptNeo,
            ParallelModel::Gpt2(..) => ModelFamily::Gpt2,
        }
    }

    /// Sharding plan of the model for `world_size` ranks
    pub fn sharding_plan(&self, world_size: i64) -> Result<ShardingPlan, TensorParallelError> {
        match self {
            ParallelModel::GptNeo(model, config) => {
                ShardingPlan::from_policy::<GptNeoLayerPolicy>(model, config, world_size)
            }
            ParallelModel::Gpt2(model, config) => {
                ShardingPlan::from_policy::<Gpt2LayerPolicy>(model, config, world_size)
            }
        }
    }

    /// Applies the policy's hyperparameter reduction to every block of the model.
    pub fn reduce_arguments(&mut self, world_size: i64) -> Result<(), TensorParallelError> {
        match self {
            ParallelModel::GptNeo(model, config) => {
                reduce_all_blocks::<GptNeoLayerPolicy>(model, config, world_size)
            }
            ParallelModel::Gpt2(model, config) => {
                reduce_all_blocks::<Gpt2LayerPolicy>(model, config, world_size)
            }
        }
    }

    /// Builds the sharding plan, then reduces the per-block hyperparameters. The model is left
    /// untouched if the plan cannot be built.
    pub fn parallelize(&mut self, world_size: i64) -> Result<ShardingPlan, TensorParallelError> {
        let plan = self.sharding_plan(world_size)?;
        self.reduce_arguments(world_size)?;
        Ok(plan)
    }
}

fn reduce_all_blocks<P: LayerPolicy>(
    model: &mut P::Model,
    config: &P::Config,
    world_size: i64,
) -> Result<(), TensorParallelError> {
    for block in P::block_layers_mut(model, config) {
        P::reduce_arguments(block, world_size, config)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind, Tensor};

    fn combined_qkv_layer<'a>(weight: &'a Tensor, bias: &'a Tensor) -> Layer<'a> {
        Layer::new("h.0.attn.c_attn", ModuleKind::Conv1D)
            .weight(weight)
            .bias(bias)
            .replace(Replacement::Conv1DToColumnParallel)
            .combined_qkv()
            .reversed()
    }

    #[test]
    fn combined_qkv_bias_is_split_per_third() -> Result<(), TensorParallelError> {
        let weight = Tensor::zeros([8, 24], (Kind::Float, Device::Cpu));
        let bias = Tensor::zeros([24], (Kind::Float, Device::Cpu));
        let spec =
            ShardSpec::from_layer(&combined_qkv_layer(&weight, &bias), LayerRole::AttnQkv, 2)?;
        assert_eq!(spec.weight_shard_shape, Some(vec![8, 12]));
        assert_eq!(spec.bias_shard_shape, Some(vec![12]));
        Ok(())
    }

    #[test]
    fn combined_qkv_bias_must_hold_three_equal_parts() {
        let weight = Tensor::zeros([8, 24], (Kind::Float, Device::Cpu));
        let bias = Tensor::zeros([26], (Kind::Float, Device::Cpu));
        assert!(matches!(
            ShardSpec::from_layer(&combined_qkv_layer(&weight, &bias), LayerRole::AttnQkv, 2),
            Err(TensorParallelError::ShardingPreconditionError(_))
        ));
    }
}
