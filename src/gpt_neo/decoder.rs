// Copyright 2021 The Eleuther AI and HuggingFace Inc. team. All rights reserved.
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

use crate::common::activations::TensorFunction;
use crate::common::dropout::Dropout;
use crate::gpt_neo::attention::{GptNeoSelfAttention, LayerState};
use crate::gpt_neo::GptNeoConfig;
use crate::TensorParallelError;
use std::borrow::Borrow;
use tch::nn::ModuleT;
use tch::{nn, Tensor};

#[derive(Debug)]
pub struct GptNeoMlp {
    pub(crate) c_fc: nn::Linear,
    pub(crate) c_proj: nn::Linear,
    activation_function: TensorFunction,
    dropout: Dropout,
}

impl GptNeoMlp {
    pub fn new<'p, P>(p: P, intermediate_size: i64, config: &GptNeoConfig) -> GptNeoMlp
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let c_fc = nn::linear(
            p / "c_fc",
            config.hidden_size(),
            intermediate_size,
            Default::default(),
        );
        let c_proj = nn::linear(
            p / "c_proj",
            intermediate_size,
            config.hidden_size(),
            Default::default(),
        );

        let activation_function = config.activation_function.get_function();
        let dropout = Dropout::new(config.resid_dropout);

        GptNeoMlp {
            c_fc,
            c_proj,
            activation_function,
            dropout,
        }
    }
}

impl ModuleT for GptNeoMlp {
    fn forward_t(&self, hidden_states: &Tensor, train: bool) -> Tensor {
        let hidden_states = hidden_states.apply(&self.c_fc);
        let hidden_states = self.activation_function.get_fn()(&hidden_states);
        hidden_states
            .apply(&self.c_proj)
            .apply_t(&self.dropout, train)
    }
}

/// # GPT-Neo transformer block
/// Pre-norm block: `x + attn(ln_1(x))` followed by `x + mlp(ln_2(x))`.
/// The attention type (global or local) is taken from the configuration for the block index.
pub struct GptNeoBlock {
    pub(crate) layer_id: usize,
    pub(crate) ln_1: nn::LayerNorm,
    pub(crate) attention: GptNeoSelfAttention,
    pub(crate) ln_2: nn::LayerNorm,
    pub(crate) mlp: GptNeoMlp,
}

impl GptNeoBlock {
    pub fn new<'p, P>(
        p: P,
        layer_id: usize,
        config: &GptNeoConfig,
    ) -> Result<GptNeoBlock, TensorParallelError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let attention_type = *config.attention_layers().get(layer_id).ok_or_else(|| {
            TensorParallelError::InvalidConfigurationError(format!(
                "No attention type defined for layer {}",
                layer_id
            ))
        })?;

        let layer_norm_config = nn::LayerNormConfig {
            eps: config.layer_norm_epsilon,
            ..Default::default()
        };

        let ln_1 = nn::layer_norm(p / "ln_1", vec![config.hidden_size()], layer_norm_config);
        let ln_2 = nn::layer_norm(p / "ln_2", vec![config.hidden_size()], layer_norm_config);
        let attention =
            GptNeoSelfAttention::new(p / "attn" / "attention", config, attention_type)?;
        let mlp = GptNeoMlp::new(p / "mlp", config.intermediate_size(), config);

        Ok(GptNeoBlock {
            layer_id,
            ln_1,
            attention,
            ln_2,
            mlp,
        })
    }

    /// Index of the block within the model
    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    pub fn attention(&self) -> &GptNeoSelfAttention {
        &self.attention
    }

    /// Path of a sub-module relative to the base model, e.g. `h.0.attn.attention.q_proj`
    pub(crate) fn module_name(&self, suffix: &str) -> String {
        format!("h.{}.{}", self.layer_id, suffix)
    }

    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        layer_state: Option<&LayerState>,
        attention_mask: Option<&Tensor>,
        local_attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>, LayerState), TensorParallelError> {
        let (attention_output, attention_weights, layer_state) = self.attention.forward_t(
            &hidden_states.apply(&self.ln_1),
            layer_state,
            attention_mask,
            local_attention_mask,
            train,
        )?;

        let hidden_states = hidden_states + attention_output;
        let output = &hidden_states + hidden_states.apply(&self.ln_2).apply_t(&self.mlp, train);

        Ok((output, attention_weights, layer_state))
    }
}
