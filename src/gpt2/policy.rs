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

use crate::gpt2::attention::GPTConv1D;
use crate::gpt2::transformer::Gpt2Block;
use crate::gpt2::{Gpt2Config, Gpt2Model};
use crate::parallel::{check_divisible, Layer, LayerPolicy, ModuleKind, Replacement};
use crate::TensorParallelError;
use std::collections::HashMap;
use tch::nn;
use tracing::debug;

/// # Tensor-parallel policy for GPT2
/// GPT2 stores its dense layers as `Conv1D` modules with `[in_features, out_features]`
/// weights, so every descriptor of a dense layer is marked as reversed. The combined
/// query/key/value projection `c_attn` is split per third.
pub struct Gpt2LayerPolicy;

fn conv1d(name: String, conv: &GPTConv1D, replacement: Replacement) -> Layer<'_> {
    Layer::new(name, ModuleKind::Conv1D)
        .weight(&conv.weight)
        .bias(&conv.bias)
        .replace(replacement)
        .reversed()
}

fn layer_norm(name: String, layer_norm: &nn::LayerNorm) -> Layer<'_> {
    let layer = Layer::new(name, ModuleKind::LayerNorm)
        .maybe_bias(layer_norm.bs.as_ref())
        .parallel(false);
    match layer_norm.ws.as_ref() {
        Some(weight) => layer.weight(weight),
        None => layer,
    }
}

impl LayerPolicy for Gpt2LayerPolicy {
    type Model = Gpt2Model;
    type Block = Gpt2Block;
    type Config = Gpt2Config;

    fn reduce_arguments(
        layer: &mut Gpt2Block,
        world_size: i64,
        config: &Gpt2Config,
    ) -> Result<(), TensorParallelError> {
        check_divisible(config.n_head, world_size, "number of attention heads")?;
        check_divisible(config.n_embd, world_size, "embedding size")?;

        layer.attn.embed_dim = config.n_embd / world_size;
        layer.attn.split_size = config.n_embd / world_size;
        layer.attn.num_heads = config.n_head / world_size;
        debug!(
            layer = layer.layer_id,
            world_size,
            num_heads = layer.attn.num_heads,
            embed_dim = layer.attn.embed_dim,
            "reduced attention arguments"
        );
        Ok(())
    }

    fn fused_modules() -> HashMap<ModuleKind, ModuleKind> {
        HashMap::from([
            (ModuleKind::Gpt2Attention, ModuleKind::FusedGpt2Attention),
            (ModuleKind::Gpt2Mlp, ModuleKind::FusedGpt2Mlp),
        ])
    }

    fn attn_qkv<'a>(layer: &'a Gpt2Block, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![conv1d(
            layer.module_name("attn.c_attn"),
            &layer.attn.c_attn,
            Replacement::Conv1DToColumnParallel,
        )
        .combined_qkv()]
    }

    fn attn_out<'a>(layer: &'a Gpt2Block, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![conv1d(
            layer.module_name("attn.c_proj"),
            &layer.attn.c_proj,
            Replacement::Conv1DToRowParallel,
        )]
    }

    fn attn_norm<'a>(layer: &'a Gpt2Block, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![layer_norm(layer.module_name("ln_1"), &layer.ln_1)]
    }

    fn mlp_in<'a>(layer: &'a Gpt2Block, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![conv1d(
            layer.module_name("mlp.c_fc"),
            &layer.mlp.c_fc,
            Replacement::Conv1DToColumnParallel,
        )]
    }

    fn mlp_out<'a>(layer: &'a Gpt2Block, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![conv1d(
            layer.module_name("mlp.c_proj"),
            &layer.mlp.c_proj,
            Replacement::Conv1DToRowParallel,
        )]
    }

    fn mlp_norm<'a>(layer: &'a Gpt2Block, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![layer_norm(layer.module_name("ln_2"), &layer.ln_2)]
    }

    fn word_embedding<'a>(model: &'a Gpt2Model, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![Layer::new("wte", ModuleKind::Embedding)
            .weight(&model.wte.ws)
            .replace(Replacement::EmbeddingToVocabParallel)]
    }

    fn preblock_layers<'a>(model: &'a Gpt2Model, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![Layer::new("wpe", ModuleKind::Embedding)
            .weight(&model.wpe.ws)
            .parallel(false)]
    }

    fn block_layers<'a>(model: &'a Gpt2Model, _config: &Gpt2Config) -> &'a [Gpt2Block] {
        &model.h
    }

    fn block_layers_mut<'a>(model: &'a mut Gpt2Model, _config: &Gpt2Config) -> &'a mut [Gpt2Block] {
        &mut model.h
    }

    fn postblock_layers<'a>(model: &'a Gpt2Model, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![layer_norm("ln_f".to_string(), &model.ln_f)]
    }

    fn copy_to_all<'a>(layer: &'a Gpt2Block, _config: &Gpt2Config) -> Vec<Layer<'a>> {
        vec![
            Layer::buffer(layer.module_name("attn.bias"), &layer.attn.bias),
            Layer::buffer(layer.module_name("attn.masked_bias"), &layer.attn.masked_bias),
        ]
    }

    fn original_layer_class() -> ModuleKind {
        ModuleKind::Gpt2Block
    }
}
