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

use crate::gpt_neo::decoder::GptNeoBlock;
use crate::gpt_neo::{GptNeoConfig, GptNeoModel};
use crate::parallel::{check_divisible, Layer, LayerPolicy, ModuleKind, Replacement};
use crate::TensorParallelError;
use std::collections::HashMap;
use tracing::debug;

/// # Tensor-parallel policy for GPT-Neo
/// Query, key, value projections and the MLP input layer are split column-wise, the attention
/// output projection and the MLP output layer row-wise. Token embeddings are split along the
/// vocabulary; position embeddings, layer norms and the attention mask buffers are replicated.
pub struct GptNeoLayerPolicy;

impl LayerPolicy for GptNeoLayerPolicy {
    type Model = GptNeoModel;
    type Block = GptNeoBlock;
    type Config = GptNeoConfig;

    fn reduce_arguments(
        layer: &mut GptNeoBlock,
        world_size: i64,
        config: &GptNeoConfig,
    ) -> Result<(), TensorParallelError> {
        check_divisible(config.num_heads(), world_size, "number of attention heads")?;
        check_divisible(config.hidden_size(), world_size, "hidden size")?;

        layer.attention.embed_dim = config.hidden_size() / world_size;
        layer.attention.num_heads = config.num_heads() / world_size;
        debug!(
            layer = layer.layer_id,
            world_size,
            num_heads = layer.attention.num_heads,
            embed_dim = layer.attention.embed_dim,
            "reduced attention arguments"
        );
        Ok(())
    }

    fn fused_modules() -> HashMap<ModuleKind, ModuleKind> {
        HashMap::from([
            (
                ModuleKind::GptNeoSelfAttention,
                ModuleKind::FusedGptNeoSelfAttention,
            ),
            (ModuleKind::GptNeoMlp, ModuleKind::FusedGptNeoMlp),
        ])
    }

    fn attn_qkv<'a>(layer: &'a GptNeoBlock, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        let attention = &layer.attention;
        [
            ("q_proj", &attention.q_proj),
            ("k_proj", &attention.k_proj),
            ("v_proj", &attention.v_proj),
        ]
        .into_iter()
        .map(|(name, projection)| {
            Layer::new(
                layer.module_name(&format!("attn.attention.{}", name)),
                ModuleKind::Linear,
            )
            .weight(&projection.ws)
            .replace(Replacement::LinearToColumnParallel)
        })
        .collect()
    }

    fn attn_out<'a>(layer: &'a GptNeoBlock, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        let out_proj = &layer.attention.out_proj;
        vec![Layer::new(
            layer.module_name("attn.attention.out_proj"),
            ModuleKind::Linear,
        )
        .weight(&out_proj.ws)
        .maybe_bias(out_proj.bs.as_ref())
        .replace(Replacement::LinearToRowParallel)]
    }

    fn attn_norm<'a>(layer: &'a GptNeoBlock, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        vec![layer_norm(layer.module_name("ln_1"), &layer.ln_1)]
    }

    fn mlp_in<'a>(layer: &'a GptNeoBlock, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        let c_fc = &layer.mlp.c_fc;
        vec![Layer::new(layer.module_name("mlp.c_fc"), ModuleKind::Linear)
            .weight(&c_fc.ws)
            .maybe_bias(c_fc.bs.as_ref())
            .replace(Replacement::LinearToColumnParallel)]
    }

    fn mlp_out<'a>(layer: &'a GptNeoBlock, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        let c_proj = &layer.mlp.c_proj;
        vec![Layer::new(layer.module_name("mlp.c_proj"), ModuleKind::Linear)
            .weight(&c_proj.ws)
            .maybe_bias(c_proj.bs.as_ref())
            .replace(Replacement::LinearToRowParallel)]
    }

    fn mlp_norm<'a>(layer: &'a GptNeoBlock, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        vec![layer_norm(layer.module_name("ln_2"), &layer.ln_2)]
    }

    fn word_embedding<'a>(model: &'a GptNeoModel, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        vec![Layer::new("wte", ModuleKind::Embedding)
            .weight(&model.wte.ws)
            .replace(Replacement::EmbeddingToVocabParallel)]
    }

    fn preblock_layers<'a>(model: &'a GptNeoModel, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        vec![Layer::new("wpe", ModuleKind::Embedding)
            .weight(&model.wpe.ws)
            .parallel(false)]
    }

    fn block_layers<'a>(model: &'a GptNeoModel, _config: &GptNeoConfig) -> &'a [GptNeoBlock] {
        &model.h
    }

    fn block_layers_mut<'a>(
        model: &'a mut GptNeoModel,
        _config: &GptNeoConfig,
    ) -> &'a mut [GptNeoBlock] {
        &mut model.h
    }

    fn postblock_layers<'a>(model: &'a GptNeoModel, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        vec![layer_norm("ln_f".to_string(), &model.ln_f)]
    }

    fn copy_to_all<'a>(layer: &'a GptNeoBlock, _config: &GptNeoConfig) -> Vec<Layer<'a>> {
        vec![
            Layer::buffer(
                layer.module_name("attn.attention.bias"),
                &layer.attention.bias,
            ),
            Layer::buffer(
                layer.module_name("attn.attention.masked_bias"),
                &layer.attention.masked_bias,
            ),
        ]
    }

    fn original_layer_class() -> ModuleKind {
        ModuleKind::GptNeoBlock
    }
}

fn layer_norm(name: String, layer_norm: &tch::nn::LayerNorm) -> Layer<'_> {
    let layer = Layer::new(name, ModuleKind::LayerNorm)
        .maybe_bias(layer_norm.bs.as_ref())
        .parallel(false);
    match layer_norm.ws.as_ref() {
        Some(weight) => layer.weight(weight),
        None => layer,
    }
}
