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

use crate::parallel::layer::{Layer, ModuleKind};
use crate::TensorParallelError;
use std::collections::HashMap;

/// # Tensor-parallel layer policy for a model family
///
/// A policy declares, for a given model family, how every sub-module of a transformer block
/// (and of the surrounding model) is treated by a tensor-parallel runtime: split column-wise,
/// split row-wise, replicated, or copied verbatim. It does not own the model: the runtime
/// hands the model (or one of its blocks) to the policy accessors and receives descriptors
/// borrowing the relevant tensors.
///
/// The block-level accessors (`attn_qkv` to `mlp_norm`, `copy_to_all`) take a block, the
/// model-level accessors (`word_embedding`, `preblock_layers`, `block_layers`,
/// `postblock_layers`) take the base model.
pub trait LayerPolicy {
    /// Base model (embeddings, blocks and final norm)
    type Model;
    /// Repeated transformer block
    type Block;
    /// Model configuration
    type Config;

    /// Divides the per-rank attention hyperparameters (embedding dimension, number of heads)
    /// of `layer` by `world_size`. Values are recomputed from `config`, so that calling this
    /// function repeatedly with the same `world_size` gives the same result.
    ///
    /// # Errors
    ///
    /// `ShardingPreconditionError` if `world_size` is not positive or does not divide the
    /// number of heads and the hidden size.
    fn reduce_arguments(
        layer: &mut Self::Block,
        world_size: i64,
        config: &Self::Config,
    ) -> Result<(), TensorParallelError>;

    /// Mapping from unfused module kinds to their fused counterparts
    fn fused_modules() -> HashMap<ModuleKind, ModuleKind>;

    fn attn_qkv<'a>(layer: &'a Self::Block, config: &Self::Config) -> Vec<Layer<'a>>;

    fn attn_out<'a>(layer: &'a Self::Block, config: &Self::Config) -> Vec<Layer<'a>>;

    fn attn_norm<'a>(layer: &'a Self::Block, config: &Self::Config) -> Vec<Layer<'a>>;

    fn mlp_in<'a>(layer: &'a Self::Block, config: &Self::Config) -> Vec<Layer<'a>>;

    fn mlp_out<'a>(layer: &'a Self::Block, config: &Self::Config) -> Vec<Layer<'a>>;

    fn mlp_norm<'a>(layer: &'a Self::Block, config: &Self::Config) -> Vec<Layer<'a>>;

    fn word_embedding<'a>(model: &'a Self::Model, config: &Self::Config) -> Vec<Layer<'a>>;

    fn preblock_layers<'a>(model: &'a Self::Model, config: &Self::Config) -> Vec<Layer<'a>>;

    /// Ordered repeated blocks of the model
    fn block_layers<'a>(model: &'a Self::Model, config: &Self::Config) -> &'a [Self::Block];

    /// Mutable access to the repeated blocks, used to apply `reduce_arguments`
    fn block_layers_mut<'a>(
        model: &'a mut Self::Model,
        config: &Self::Config,
    ) -> &'a mut [Self::Block];

    fn postblock_layers<'a>(model: &'a Self::Model, config: &Self::Config) -> Vec<Layer<'a>>;

    /// Non-trainable tensors copied as-is to every rank
    fn copy_to_all<'a>(layer: &'a Self::Block, config: &Self::Config) -> Vec<Layer<'a>>;

    /// Block kind this policy applies to
    fn original_layer_class() -> ModuleKind;

    /// All block-level descriptors, in the order the runtime processes them.
    fn block_descriptors<'a>(layer: &'a Self::Block, config: &Self::Config) -> Vec<Layer<'a>> {
        let mut layers = Self::attn_qkv(layer, config);
        layers.extend(Self::attn_out(layer, config));
        layers.extend(Self::attn_norm(layer, config));
        layers.extend(Self::mlp_in(layer, config));
        layers.extend(Self::mlp_out(layer, config));
        layers.extend(Self::mlp_norm(layer, config));
        layers.extend(Self::copy_to_all(layer, config));
        layers
    }
}

pub(crate) fn check_world_size(world_size: i64) -> Result<(), TensorParallelError> {
    if world_size < 1 {
        return Err(TensorParallelError::ShardingPreconditionError(format!(
            "world size must be positive, got {}",
            world_size
        )));
    }
    Ok(())
}

pub(crate) fn check_divisible(
    value: i64,
    world_size: i64,
    description: &str,
) -> Result<(), TensorParallelError> {
    check_world_size(world_size)?;
    if value % world_size != 0 {
        return Err(TensorParallelError::ShardingPreconditionError(format!(
            "{} ({}) is not divisible by the world size ({})",
            description, value, world_size
        )));
    }
    Ok(())
}
