// Copyright 2018-present, the HuggingFace Inc. team
// Copyright 2018-present, The OpenAI Team Authors
// Copyright (c) 2018, NVIDIA CORPORATION.  All rights reserved.
// Copyright 2019 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::common::activations::Activation;
use crate::common::dropout::Dropout;
use crate::common::embeddings::embed_inputs;
use crate::common::masks::{additive_attention_mask, incremental_position_ids};
use crate::gpt2::transformer::Gpt2Block;
use crate::{Config, TensorParallelError};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use tch::{nn, Tensor};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
/// # GPT2 model configuration
/// Defines the GPT2 model architecture (e.g. number of layers, hidden layer size, vocab size...).
/// Fields missing from a configuration file take the values of the small `gpt2` checkpoint.
pub struct Gpt2Config {
    pub attn_pdrop: Option<f64>,
    pub embd_pdrop: Option<f64>,
    pub hidden_dropout_prob: Option<f64>,
    #[serde(alias = "activation_function")]
    pub afn: Option<Activation>,
    pub initializer_range: f64,
    pub layer_norm_epsilon: f64,
    pub n_ctx: i64,
    pub n_embd: i64,
    pub n_head: i64,
    /// Hidden size of the MLP, `4 * n_embd` when not set
    pub n_inner: Option<i64>,
    pub n_layer: i64,
    pub n_positions: i64,
    pub num_labels: Option<i64>,
    pub output_past: Option<bool>,
    pub output_attentions: Option<bool>,
    pub output_hidden_states: Option<bool>,
    pub resid_pdrop: Option<f64>,
    pub vocab_size: i64,
    pub model_type: Option<String>,
}

impl Gpt2Config {
    pub fn head_dim(&self) -> i64 {
        self.n_embd / self.n_head
    }

    pub fn intermediate_size(&self) -> i64 {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    /// Checks the head split and the layer count, run on load and before building a model.
    pub fn check(&self) -> Result<(), TensorParallelError> {
        if self.n_head < 1 || self.n_embd % self.n_head != 0 {
            return Err(TensorParallelError::InvalidConfigurationError(format!(
                "Embedding size ({}) must be divisible by the number of heads ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.n_layer < 0 {
            return Err(TensorParallelError::InvalidConfigurationError(format!(
                "Number of layers must not be negative, got {}",
                self.n_layer
            )));
        }
        Ok(())
    }
}

impl Config for Gpt2Config {
    fn validate(self) -> Result<Self, TensorParallelError> {
        self.check()?;
        Ok(self)
    }
}

impl Default for Gpt2Config {
    fn default() -> Self {
        Gpt2Config {
            attn_pdrop: Some(0.1),
            embd_pdrop: Some(0.1),
            hidden_dropout_prob: None,
            afn: Some(Activation::gelu_new),
            initializer_range: 0.02,
            layer_norm_epsilon: 1e-5,
            n_ctx: 1024,
            n_embd: 768,
            n_head: 12,
            n_inner: None,
            n_layer: 12,
            n_positions: 1024,
            num_labels: None,
            output_past: None,
            output_attentions: None,
            output_hidden_states: None,
            resid_pdrop: Some(0.1),
            vocab_size: 50257,
            model_type: Some("gpt2".to_string()),
        }
    }
}

/// Number of cached positions, checking that the cache holds one entry per layer.
fn cached_length(layer_past: &[Tensor], num_layers: usize) -> Result<i64, TensorParallelError> {
    if layer_past.len() != num_layers {
        return Err(TensorParallelError::ValueError(format!(
            "Past activations vector must be of length equal to the number of layers ({}), got {}",
            num_layers,
            layer_past.len()
        )));
    }
    Ok(layer_past
        .first()
        .map(|layer_past| layer_past.size()[3])
        .unwrap_or(0))
}

/// # GPT2 Base model
/// Stack of pre-norm transformer blocks over token and position embeddings:
/// - `wte`: token embeddings
/// - `wpe`: position embeddings
/// - `h`: transformer blocks, see `Gpt2Block`
/// - `ln_f`: final layer normalization
///
/// `Gpt2LayerPolicy` addresses module paths relative to this model.
pub struct Gpt2Model {
    pub(crate) wte: nn::Embedding,
    pub(crate) wpe: nn::Embedding,
    drop: Dropout,
    pub(crate) ln_f: nn::LayerNorm,
    pub(crate) h: Vec<Gpt2Block>,
    output_past: bool,
    output_hidden_states: bool,
    output_attentions: bool,
}

impl Gpt2Model {
    /// Build a new `Gpt2Model`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the GPT2 base model
    /// * `config` - `Gpt2Config` object defining the model architecture
    ///
    /// # Errors
    ///
    /// `InvalidConfigurationError` if `n_embd` is not a multiple of a positive `n_head` or if
    /// `n_layer` is negative.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rust_tensor_parallel::gpt2::{Gpt2Config, Gpt2Model};
    /// use rust_tensor_parallel::Config;
    /// use std::path::Path;
    /// use tch::{nn, Device};
    ///
    /// let config_path = Path::new("path/to/config.json");
    /// let p = nn::VarStore::new(Device::Cpu);
    /// let config = Gpt2Config::from_file(config_path).unwrap();
    /// let gpt2: Gpt2Model = Gpt2Model::new(&p.root() / "transformer", &config).unwrap();
    /// ```
    pub fn new<'p, P>(p: P, config: &Gpt2Config) -> Result<Gpt2Model, TensorParallelError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        config.check()?;
        let p = p.borrow();

        let wte = nn::embedding(p / "wte", config.vocab_size, config.n_embd, Default::default());
        let wpe = nn::embedding(p / "wpe", config.n_positions, config.n_embd, Default::default());
        let layer_norm_config = nn::LayerNormConfig {
            eps: config.layer_norm_epsilon,
            ..Default::default()
        };
        let ln_f = nn::layer_norm(p / "ln_f", vec![config.n_embd], layer_norm_config);

        let p_layers = p / "h";
        let h = (0..config.n_layer as usize)
            .map(|layer_index| Gpt2Block::new(&p_layers / layer_index, layer_index, config, true))
            .collect();

        Ok(Gpt2Model {
            wte,
            wpe,
            drop: Dropout::from_config(config.embd_pdrop, 0.1),
            ln_f,
            h,
            output_past: config.output_past.unwrap_or(true),
            output_hidden_states: config.output_hidden_states.unwrap_or(false),
            output_attentions: config.output_attentions.unwrap_or(false),
        })
    }

    /// Transformer blocks, in order
    pub fn blocks(&self) -> &[Gpt2Block] {
        &self.h
    }

    /// Forward pass through the model
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Optional input tensor of shape (*batch size*, *sequence_length*). If None, pre-computed embeddings must be provided (see `input_embeds`)
    /// * `layer_past` - Optional vector of length *n_layer* holding the keys and values of previous steps, each of shape (*2*, *batch size*, *number of heads*, *past_sequence_length*, *head dimension*)
    /// * `attention_mask` - Optional mask of shape (*batch size*, *past_sequence_length + sequence_length*). Padding positions have value 0, attended positions value 1
    /// * `token_type_ids` - Optional token type ids, embedded with the token embedding matrix
    /// * `position_ids` - Optional position ids of shape (*batch size*, *sequence_length*). If None, positions continue from the length of the cache
    /// * `input_embeds` - Optional pre-computed input embeddings of shape (*batch size*, *sequence_length*, *hidden_size*). If None, input ids must be provided (see `input_ids`)
    /// * `train` - boolean flag to turn on/off the dropout layers in the model. Should be set to false for inference.
    ///
    /// # Returns
    ///
    /// * `Gpt2ModelOutput` containing:
    ///   - `output` - `Tensor` of shape (*batch size*, *sequence_length*, *hidden_size*)
    ///   - `cache` - `Option<Vec<Tensor>>` of length *n_layer*, keys and values of every position seen so far, if `output_past` is set
    ///   - `all_hidden_states` - `Option<Vec<Tensor>>` of length *n_layer + 1*, the block inputs followed by the normalized output
    ///   - `all_attentions` - `Option<Vec<Tensor>>` of length *n_layer* holding the attention weights of every layer
    #[allow(clippy::too_many_arguments)]
    pub fn forward_t(
        &self,
        input_ids: Option<&Tensor>,
        layer_past: Option<&Vec<Tensor>>,
        attention_mask: Option<&Tensor>,
        token_type_ids: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        train: bool,
    ) -> Result<Gpt2ModelOutput, TensorParallelError> {
        let inputs = embed_inputs(input_ids, input_embeds, &self.wte)?;

        let past_length = match layer_past {
            Some(layer_past) => cached_length(layer_past, self.h.len())?,
            None => 0,
        };

        let position_embeds = match position_ids {
            Some(position_ids) => position_ids.apply(&self.wpe),
            None => incremental_position_ids(past_length, inputs.sequence_length, inputs.device)
                .apply(&self.wpe),
        };
        let mut hidden_state = inputs.embeddings + position_embeds;
        if let Some(token_type_ids) = token_type_ids {
            hidden_state = hidden_state + token_type_ids.apply(&self.wte);
        }
        let mut hidden_state = hidden_state.apply_t(&self.drop, train);

        let attention_mask = attention_mask.map(|attention_mask| {
            additive_attention_mask(attention_mask, inputs.batch_size, hidden_state.kind())
        });

        let mut all_presents = self.output_past.then(Vec::new);
        let mut all_hidden_states = self.output_hidden_states.then(Vec::new);
        let mut all_attentions = self.output_attentions.then(Vec::new);

        for (layer_index, layer) in self.h.iter().enumerate() {
            if let Some(hidden_states) = all_hidden_states.as_mut() {
                hidden_states.push(hidden_state.shallow_clone());
            }
            let past = layer_past.map(|layer_past| &layer_past[layer_index]);
            let (output, present, attention) =
                layer.forward_t(&hidden_state, past, attention_mask.as_ref(), train)?;
            hidden_state = output;

            if let Some(presents) = all_presents.as_mut() {
                presents.push(present);
            }
            if let (Some(attentions), Some(attention)) = (all_attentions.as_mut(), attention) {
                attentions.push(attention);
            }
        }

        let output = hidden_state.apply(&self.ln_f);
        if let Some(hidden_states) = all_hidden_states.as_mut() {
            hidden_states.push(output.shallow_clone());
        }

        Ok(Gpt2ModelOutput {
            output,
            cache: all_presents,
            all_hidden_states,
            all_attentions,
        })
    }
}

/// # GPT2 Language Modeling head
/// GPT2 model with a vocabulary decoding head tied to the token embeddings.
/// The base model is stored under the `transformer` path of the variable store.
pub struct GPT2LMHeadModel {
    transformer: Gpt2Model,
}

impl GPT2LMHeadModel {
    pub fn new<'p, P>(p: P, config: &Gpt2Config) -> Result<GPT2LMHeadModel, TensorParallelError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let transformer = Gpt2Model::new(p.borrow() / "transformer", config)?;
        Ok(GPT2LMHeadModel { transformer })
    }

    /// Base model the tensor-parallel policy applies to
    pub fn base_model(&self) -> &Gpt2Model {
        &self.transformer
    }

    pub fn base_model_mut(&mut self) -> &mut Gpt2Model {
        &mut self.transformer
    }

    /// Forward pass through the model, see `Gpt2Model::forward_t` for the arguments.
    /// The returned `output` holds the vocabulary logits of shape (*batch size*, *sequence_length*, *vocab_size*).
    #[allow(clippy::too_many_arguments)]
    pub fn forward_t(
        &self,
        input_ids: Option<&Tensor>,
        layer_past: Option<&Vec<Tensor>>,
        attention_mask: Option<&Tensor>,
        token_type_ids: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        train: bool,
    ) -> Result<Gpt2ModelOutput, TensorParallelError> {
        let base_model_output = self.transformer.forward_t(
            input_ids,
            layer_past,
            attention_mask,
            token_type_ids,
            position_ids,
            input_embeds,
            train,
        )?;

        let lm_logits = base_model_output
            .output
            .linear::<Tensor>(&self.transformer.wte.ws, None);
        Ok(Gpt2ModelOutput {
            output: lm_logits,
            ..base_model_output
        })
    }
}

/// Container for the GPT2 model output.
pub struct Gpt2ModelOutput {
    /// Hidden state of the last layer, or vocabulary logits for the language modeling head
    pub output: Tensor,
    /// Keys and values of every layer, each of shape (*2*, *batch size*, *number of heads*, *sequence_length*, *head dimension*)
    pub cache: Option<Vec<Tensor>>,
    /// Hidden states for all intermediate layers
    pub all_hidden_states: Option<Vec<Tensor>>,
    /// Attention weights for all intermediate layers
    pub all_attentions: Option<Vec<Tensor>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn missing_fields_take_defaults() -> Result<(), TensorParallelError> {
        let config: Gpt2Config =
            serde_json::from_str(r#"{"n_embd": 64, "n_head": 4, "n_layer": 2, "n_inner": 96}"#)?;
        let config = config.validate()?;
        assert_eq!(config.n_positions, 1024);
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.intermediate_size(), 96);
        assert_eq!(Gpt2Config::default().intermediate_size(), 3072);
        Ok(())
    }

    #[test]
    fn cache_must_hold_every_layer() {
        let cache = vec![Tensor::zeros([2, 1, 2, 3, 4], (Kind::Float, Device::Cpu))];
        assert!(cached_length(&cache, 2).is_err());
        assert!(matches!(cached_length(&cache, 1), Ok(3)));
    }
}
