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

use crate::common::dropout::Dropout;
use crate::common::embeddings::{embed_inputs, InputEmbeddings};
use crate::common::masks::{additive_attention_mask, incremental_position_ids};
use crate::gpt_neo::attention::LayerState;
use crate::gpt_neo::attention_utils::create_local_attention_mask;
use crate::gpt_neo::decoder::GptNeoBlock;
use crate::{Activation, Config, TensorParallelError};
use serde::{Deserialize, Serialize};
use std::borrow::{Borrow, BorrowMut};
use tch::{nn, Tensor};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// # GPT-Neo attention layer type
pub enum AttentionLayerType {
    /// Causal attention over the full sequence
    Global,
    /// Causal attention restricted to the previous `window_size` positions
    Local,
}

/// Expands `(pattern, count)` groups into the per-layer attention list.
///
/// Each group contributes its pattern repeated `count` times, groups are concatenated
/// left to right.
///
/// # Example
///
/// ```
/// use rust_tensor_parallel::gpt_neo::{expand_attention_types, AttentionLayerType};
/// # fn main() -> Result<(), rust_tensor_parallel::TensorParallelError> {
/// let layers = expand_attention_types(&[(
///     vec![AttentionLayerType::Global, AttentionLayerType::Local],
///     2,
/// )])?;
/// assert_eq!(
///     layers,
///     [
///         AttentionLayerType::Global,
///         AttentionLayerType::Local,
///         AttentionLayerType::Global,
///         AttentionLayerType::Local
///     ]
/// );
/// # Ok(())
/// # }
/// ```
pub fn expand_attention_types(
    attention_types: &[(Vec<AttentionLayerType>, i64)],
) -> Result<Vec<AttentionLayerType>, TensorParallelError> {
    let mut attentions = Vec::new();
    for (pattern, count) in attention_types {
        if *count < 0 {
            return Err(TensorParallelError::InvalidConfigurationError(format!(
                "Attention type repetition count must not be negative, got {}",
                count
            )));
        }
        for _ in 0..*count {
            attentions.extend_from_slice(pattern);
        }
    }
    Ok(attentions)
}

#[derive(Debug, Serialize, Clone)]
#[serde(into = "GptNeoConfigFields")]
/// # GPT-Neo model configuration
/// Defines the GPT-Neo model architecture (e.g. number of layers, hidden layer size, vocab size...).
/// The per-layer attention list is expanded from `attention_types` when the configuration is built
/// or deserialized, and is guaranteed to hold exactly `num_layers` entries.
/// Fields checked at construction (layer structure, head split, window size) are read-only, build
/// the configuration from `GptNeoConfigFields` to set them.
/// Defaults follow the `gpt-neo-1.3B` architecture.
pub struct GptNeoConfig {
    pub vocab_size: i64,
    pub max_position_embeddings: i64,
    hidden_size: i64,
    num_layers: i64,
    attention_types: Vec<(Vec<AttentionLayerType>, i64)>,
    attention_layers: Vec<AttentionLayerType>,
    num_heads: i64,
    /// Size of the MLP hidden layer, `4 * hidden_size` if not set
    pub intermediate_size: Option<i64>,
    window_size: i64,
    pub activation_function: Activation,
    pub resid_dropout: f64,
    pub embed_dropout: f64,
    pub attention_dropout: f64,
    pub layer_norm_epsilon: f64,
    pub initializer_range: f64,
    pub summary_type: Option<String>,
    pub summary_use_proj: Option<bool>,
    pub summary_activation: Option<String>,
    pub summary_proj_to_labels: Option<bool>,
    pub summary_first_dropout: Option<f64>,
    pub use_cache: Option<bool>,
    pub bos_token_id: i64,
    pub eos_token_id: i64,
    pub output_attentions: Option<bool>,
    pub output_hidden_states: Option<bool>,
    pub model_type: Option<String>,
}

impl GptNeoConfig {
    /// Builds a configuration with the given layer structure and default values for every
    /// other field.
    ///
    /// # Errors
    ///
    /// `InvalidConfigurationError` if the expanded attention list does not hold exactly
    /// `num_layers` entries.
    ///
    /// # Example
    ///
    /// ```
    /// use rust_tensor_parallel::gpt_neo::{AttentionLayerType, GptNeoConfig};
    /// # fn main() -> Result<(), rust_tensor_parallel::TensorParallelError> {
    /// let config = GptNeoConfig::new(vec![(vec![AttentionLayerType::Global], 6)], 6)?;
    /// assert_eq!(config.attention_layers().len(), 6);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        attention_types: Vec<(Vec<AttentionLayerType>, i64)>,
        num_layers: i64,
    ) -> Result<GptNeoConfig, TensorParallelError> {
        GptNeoConfig::from_fields(GptNeoConfigFields {
            attention_types,
            num_layers,
            ..Default::default()
        })
    }

    pub fn num_layers(&self) -> i64 {
        self.num_layers
    }

    pub fn hidden_size(&self) -> i64 {
        self.hidden_size
    }

    pub fn num_heads(&self) -> i64 {
        self.num_heads
    }

    /// Number of previous positions visible to local attention layers
    pub fn window_size(&self) -> i64 {
        self.window_size
    }

    pub fn attention_types(&self) -> &[(Vec<AttentionLayerType>, i64)] {
        &self.attention_types
    }

    /// Attention type of every layer, in order
    pub fn attention_layers(&self) -> &[AttentionLayerType] {
        &self.attention_layers
    }

    pub fn intermediate_size(&self) -> i64 {
        self.intermediate_size.unwrap_or(4 * self.hidden_size)
    }

    pub fn head_dim(&self) -> i64 {
        self.hidden_size / self.num_heads
    }

    pub(crate) fn has_local_layers(&self) -> bool {
        self.attention_layers.contains(&AttentionLayerType::Local)
    }
}

impl Default for GptNeoConfig {
    fn default() -> Self {
        let fields = GptNeoConfigFields::default();
        let attention_layers = vec![
            AttentionLayerType::Global,
            AttentionLayerType::Local,
        ]
        .repeat(12);
        fields.into_config(attention_layers)
    }
}

impl Config for GptNeoConfig {}

impl<'de> Deserialize<'de> for GptNeoConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let fields = GptNeoConfigFields::deserialize(deserializer)?;
        GptNeoConfig::from_fields(fields).map_err(serde::de::Error::custom)
    }
}

/// # Unchecked GPT-Neo configuration values
/// Serialized layout of the configuration, following the Transformers `config.json` files.
/// Turned into a `GptNeoConfig` with `GptNeoConfig::from_fields`, which checks the layer
/// structure, the head split and the local attention window.
///
/// ```
/// use rust_tensor_parallel::gpt_neo::{AttentionLayerType, GptNeoConfig, GptNeoConfigFields};
/// # fn main() -> Result<(), rust_tensor_parallel::TensorParallelError> {
/// let config = GptNeoConfig::from_fields(GptNeoConfigFields {
///     hidden_size: 64,
///     num_heads: 8,
///     num_layers: 2,
///     attention_types: vec![(vec![AttentionLayerType::Global, AttentionLayerType::Local], 1)],
///     ..Default::default()
/// })?;
/// assert_eq!(config.head_dim(), 8);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GptNeoConfigFields {
    pub vocab_size: i64,
    pub max_position_embeddings: i64,
    pub hidden_size: i64,
    #[serde(alias = "num_hidden_layers")]
    pub num_layers: i64,
    pub attention_types: Vec<(Vec<AttentionLayerType>, i64)>,
    /// Written when saving a configuration, always recomputed from `attention_types` on load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attention_layers: Option<Vec<AttentionLayerType>>,
    #[serde(alias = "num_attention_heads")]
    pub num_heads: i64,
    pub intermediate_size: Option<i64>,
    pub window_size: i64,
    pub activation_function: Activation,
    pub resid_dropout: f64,
    pub embed_dropout: f64,
    pub attention_dropout: f64,
    pub layer_norm_epsilon: f64,
    pub initializer_range: f64,
    pub summary_type: Option<String>,
    pub summary_use_proj: Option<bool>,
    pub summary_activation: Option<String>,
    pub summary_proj_to_labels: Option<bool>,
    pub summary_first_dropout: Option<f64>,
    pub use_cache: Option<bool>,
    pub bos_token_id: i64,
    pub eos_token_id: i64,
    pub output_attentions: Option<bool>,
    pub output_hidden_states: Option<bool>,
    pub model_type: Option<String>,
}

impl Default for GptNeoConfigFields {
    fn default() -> Self {
        GptNeoConfigFields {
            vocab_size: 50257,
            max_position_embeddings: 2048,
            hidden_size: 2048,
            num_layers: 24,
            attention_types: vec![(
                vec![AttentionLayerType::Global, AttentionLayerType::Local],
                12,
            )],
            attention_layers: None,
            num_heads: 16,
            intermediate_size: None,
            window_size: 256,
            activation_function: Activation::gelu_new,
            resid_dropout: 0.0,
            embed_dropout: 0.0,
            attention_dropout: 0.0,
            layer_norm_epsilon: 1e-5,
            initializer_range: 0.02,
            summary_type: Some("cls_index".to_string()),
            summary_use_proj: Some(true),
            summary_activation: None,
            summary_proj_to_labels: Some(true),
            summary_first_dropout: Some(0.1),
            use_cache: Some(true),
            bos_token_id: 50256,
            eos_token_id: 50256,
            output_attentions: None,
            output_hidden_states: None,
            model_type: Some("gpt_neo".to_string()),
        }
    }
}

impl GptNeoConfigFields {
    fn into_config(self, attention_layers: Vec<AttentionLayerType>) -> GptNeoConfig {
        GptNeoConfig {
            vocab_size: self.vocab_size,
            max_position_embeddings: self.max_position_embeddings,
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            attention_types: self.attention_types,
            attention_layers,
            num_heads: self.num_heads,
            intermediate_size: self.intermediate_size,
            window_size: self.window_size,
            activation_function: self.activation_function,
            resid_dropout: self.resid_dropout,
            embed_dropout: self.embed_dropout,
            attention_dropout: self.attention_dropout,
            layer_norm_epsilon: self.layer_norm_epsilon,
            initializer_range: self.initializer_range,
            summary_type: self.summary_type,
            summary_use_proj: self.summary_use_proj,
            summary_activation: self.summary_activation,
            summary_proj_to_labels: self.summary_proj_to_labels,
            summary_first_dropout: self.summary_first_dropout,
            use_cache: self.use_cache,
            bos_token_id: self.bos_token_id,
            eos_token_id: self.eos_token_id,
            output_attentions: self.output_attentions,
            output_hidden_states: self.output_hidden_states,
            model_type: self.model_type,
        }
    }
}

impl GptNeoConfig {
    /// Builds a configuration from unchecked values, expanding the attention types.
    ///
    /// # Errors
    ///
    /// `InvalidConfigurationError` if the attention types do not expand to `num_layers` layers,
    /// if `hidden_size` is not a multiple of a positive `num_heads`, or if local attention
    /// layers are declared with a window size below 2.
    pub fn from_fields(fields: GptNeoConfigFields) -> Result<GptNeoConfig, TensorParallelError> {
        let attention_layers = expand_attention_types(&fields.attention_types)?;
        if attention_layers.len() as i64 != fields.num_layers {
            return Err(TensorParallelError::InvalidConfigurationError(format!(
                "Attention types expand to {} layers but the model has {} layers",
                attention_layers.len(),
                fields.num_layers
            )));
        }
        if fields.num_heads < 1 || fields.hidden_size % fields.num_heads != 0 {
            return Err(TensorParallelError::InvalidConfigurationError(format!(
                "Hidden size ({}) must be divisible by the number of heads ({})",
                fields.hidden_size, fields.num_heads
            )));
        }
        if attention_layers.contains(&AttentionLayerType::Local) && fields.window_size < 2 {
            return Err(TensorParallelError::InvalidConfigurationError(format!(
                "Local attention layers require a window size of at least 2, got {}",
                fields.window_size
            )));
        }
        Ok(fields.into_config(attention_layers))
    }
}

impl From<GptNeoConfig> for GptNeoConfigFields {
    fn from(config: GptNeoConfig) -> Self {
        GptNeoConfigFields {
            vocab_size: config.vocab_size,
            max_position_embeddings: config.max_position_embeddings,
            hidden_size: config.hidden_size,
            num_layers: config.num_layers,
            attention_types: config.attention_types,
            attention_layers: Some(config.attention_layers),
            num_heads: config.num_heads,
            intermediate_size: config.intermediate_size,
            window_size: config.window_size,
            activation_function: config.activation_function,
            resid_dropout: config.resid_dropout,
            embed_dropout: config.embed_dropout,
            attention_dropout: config.attention_dropout,
            layer_norm_epsilon: config.layer_norm_epsilon,
            initializer_range: config.initializer_range,
            summary_type: config.summary_type,
            summary_use_proj: config.summary_use_proj,
            summary_activation: config.summary_activation,
            summary_proj_to_labels: config.summary_proj_to_labels,
            summary_first_dropout: config.summary_first_dropout,
            use_cache: config.use_cache,
            bos_token_id: config.bos_token_id,
            eos_token_id: config.eos_token_id,
            output_attentions: config.output_attentions,
            output_hidden_states: config.output_hidden_states,
            model_type: config.model_type,
        }
    }
}

/// # GPT-Neo Base model
/// Base architecture for GPT-Neo models. Task-specific models will be built from this common base model
/// It is made of the following blocks:
/// - `wte`: token embeddings
/// - `wpe`: position embeddings
/// - `h`: transformer blocks, alternating global and local attention as defined by the configuration
/// - `ln_f`: final layer normalization
pub struct GptNeoModel {
    pub(crate) wte: nn::Embedding,
    pub(crate) wpe: nn::Embedding,
    dropout: Dropout,
    pub(crate) h: Vec<GptNeoBlock>,
    pub(crate) ln_f: nn::LayerNorm,
    window_size: i64,
    has_local_layers: bool,
    use_cache: bool,
    output_attentions: bool,
    output_hidden_states: bool,
}

impl GptNeoModel {
    /// Build a new `GptNeoModel`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the GPT-Neo model
    /// * `config` - `GptNeoConfig` object defining the model architecture
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rust_tensor_parallel::gpt_neo::{GptNeoConfig, GptNeoModel};
    /// use rust_tensor_parallel::Config;
    /// use std::path::Path;
    /// use tch::{nn, Device};
    ///
    /// let config_path = Path::new("path/to/config.json");
    /// let device = Device::Cpu;
    /// let p = nn::VarStore::new(device);
    /// let config = GptNeoConfig::from_file(config_path).unwrap();
    /// let gpt_neo_model = GptNeoModel::new(&p.root() / "transformer", &config).unwrap();
    /// ```
    pub fn new<'p, P>(p: P, config: &GptNeoConfig) -> Result<GptNeoModel, TensorParallelError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let wte = nn::embedding(
            p / "wte",
            config.vocab_size,
            config.hidden_size,
            Default::default(),
        );

        let wpe = nn::embedding(
            p / "wpe",
            config.max_position_embeddings,
            config.hidden_size,
            Default::default(),
        );

        let dropout = Dropout::new(config.embed_dropout);

        let layer_norm_config = nn::LayerNormConfig {
            eps: config.layer_norm_epsilon,
            ..Default::default()
        };

        let ln_f = nn::layer_norm(p / "ln_f", vec![config.hidden_size], layer_norm_config);

        let mut h: Vec<GptNeoBlock> = Vec::with_capacity(config.num_layers() as usize);
        let p_layers = p / "h";
        for layer_index in 0..config.num_layers() as usize {
            h.push(GptNeoBlock::new(&p_layers / layer_index, layer_index, config)?);
        }

        Ok(GptNeoModel {
            wte,
            wpe,
            dropout,
            h,
            ln_f,
            window_size: config.window_size,
            has_local_layers: config.has_local_layers(),
            use_cache: config.use_cache.unwrap_or(true),
            output_attentions: config.output_attentions.unwrap_or(false),
            output_hidden_states: config.output_hidden_states.unwrap_or(false),
        })
    }

    /// Transformer blocks, in order
    pub fn blocks(&self) -> &[GptNeoBlock] {
        &self.h
    }

    /// Forward pass through the model
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Optional input tensor of shape (*batch size*, *sequence_length*). If None, pre-computed embeddings must be provided (see `input_embeds`)
    /// * `input_embeds` - Optional pre-computed input embeddings of shape (*batch size*, *sequence_length*, *hidden_size*). If None, input ids must be provided (see `input_ids`)
    /// * `layer_states` - Optional vector of length *num_layers* containing the cached keys and values of each layer, as returned by a previous call
    /// * `attention_mask` - Optional mask of shape (*batch size*, *past_sequence_length + sequence_length*). Masked position have value 0, non-masked value 1. If None set to 1
    /// * `token_type_ids` - Optional token type ids, embedded with the token embeddings matrix
    /// * `position_ids` - Optional position ids of shape (*batch size*, *sequence_length*). If None, will be incremented starting from the length of the past input.
    /// * `train` - boolean flag to turn on/off the dropout layers in the model. Should be set to false for inference.
    ///
    /// # Returns
    ///
    /// * `GptNeoModelOutput` containing:
    ///   - `hidden_states` - `Tensor` of shape (*batch size*, *sequence_length*, *hidden_size*)
    ///   - `next_cache` - `Option<Vec<Option<LayerState>>>` of length *num_layers*, if `use_cache` is set in the configuration
    ///   - `all_hidden_states` - `Option<Vec<Tensor>>` of length *num_layers* with shape (*batch size*, *sequence_length*, *hidden_size*)
    ///   - `all_attentions` - `Option<Vec<Tensor>>` of length *num_layers* holding the attention weights of every layer
    ///
    /// Local attention layers without cache attend block-wise to a window of past positions.
    /// When a cache is provided, they attend to the cached keys through a banded causal mask.
    pub fn forward_t(
        &self,
        input_ids: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        layer_states: Option<Vec<Option<LayerState>>>,
        attention_mask: Option<&Tensor>,
        token_type_ids: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<GptNeoModelOutput, TensorParallelError> {
        let InputEmbeddings {
            embeddings: input_embeddings,
            batch_size,
            sequence_length: current_sequence_length,
            device,
        } = embed_inputs(input_ids, input_embeds, &self.wte)?;

        let layer_states = match layer_states {
            Some(layer_states) => {
                if layer_states.len() != self.h.len() {
                    return Err(TensorParallelError::ValueError(format!(
                        "Cache must hold one entry per layer ({}), got {}",
                        self.h.len(),
                        layer_states.len()
                    )));
                }
                layer_states
            }
            None => {
                let mut layer_states = Vec::with_capacity(self.h.len());
                layer_states.resize_with(self.h.len(), || None::<LayerState>);
                layer_states
            }
        };

        let past_length = layer_states
            .iter()
            .flatten()
            .next()
            .map(|layer_state| layer_state.prev_key.size()[2])
            .unwrap_or(0);

        let global_attention_mask = attention_mask.map(|attention_mask| {
            additive_attention_mask(attention_mask, batch_size, input_embeddings.kind())
        });

        let local_attention_mask = if self.has_local_layers && past_length == 0 {
            Some(create_local_attention_mask(
                batch_size,
                current_sequence_length,
                self.window_size,
                device,
                attention_mask,
            )?)
        } else {
            None
        };

        let position_embeds = match position_ids {
            Some(position_ids) => position_ids.apply(&self.wpe),
            None => incremental_position_ids(past_length, current_sequence_length, device)
                .apply(&self.wpe),
        };
        let mut hidden_state = input_embeddings + position_embeds;
        if let Some(token_type_ids) = token_type_ids {
            hidden_state = hidden_state + token_type_ids.apply(&self.wte);
        };
        let mut hidden_state = hidden_state.apply_t(&self.dropout, train);

        let mut next_cache: Option<Vec<Option<LayerState>>> = if self.use_cache {
            Some(Vec::with_capacity(self.h.len()))
        } else {
            None
        };
        let mut all_hidden_states: Option<Vec<Tensor>> = if self.output_hidden_states {
            Some(vec![])
        } else {
            None
        };
        let mut all_attentions: Option<Vec<Tensor>> = if self.output_attentions {
            Some(vec![])
        } else {
            None
        };

        for (layer, layer_state) in self.h.iter().zip(layer_states) {
            if let Some(hidden_states) = all_hidden_states.borrow_mut() {
                hidden_states.push(hidden_state.copy());
            };

            let (temp_hidden_state, temp_attention, temp_layer_state) = layer.forward_t(
                &hidden_state,
                layer_state.as_ref(),
                global_attention_mask.as_ref(),
                local_attention_mask.as_ref(),
                train,
            )?;
            hidden_state = temp_hidden_state;

            if let Some(cache) = next_cache.borrow_mut() {
                cache.push(Some(temp_layer_state));
            };
            if let (Some(attentions), Some(attention)) =
                (all_attentions.borrow_mut(), temp_attention)
            {
                attentions.push(attention);
            };
        }

        let hidden_states = hidden_state.apply(&self.ln_f);
        if let Some(all_hidden_states) = all_hidden_states.borrow_mut() {
            all_hidden_states.push(hidden_states.copy());
        };

        Ok(GptNeoModelOutput {
            hidden_states,
            next_cache,
            all_hidden_states,
            all_attentions,
        })
    }
}

/// # GPT-Neo Model for causal language modeling
/// GPT-Neo model with a vocabulary decoding head. The language model decoding head is tied to the word embedding matrix weights
/// It is made of the following blocks:
/// - `transformer`: `GptNeoModel` Base GPT-Neo model
pub struct GptNeoForCausalLM {
    transformer: GptNeoModel,
}

impl GptNeoForCausalLM {
    /// Build a new `GptNeoForCausalLM`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the GPT-Neo model
    /// * `config` - `GptNeoConfig` object defining the model architecture
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rust_tensor_parallel::gpt_neo::{GptNeoConfig, GptNeoForCausalLM};
    /// use rust_tensor_parallel::Config;
    /// use std::path::Path;
    /// use tch::{nn, Device};
    ///
    /// let config_path = Path::new("path/to/config.json");
    /// let device = Device::Cpu;
    /// let p = nn::VarStore::new(device);
    /// let config = GptNeoConfig::from_file(config_path).unwrap();
    /// let gpt_neo_model = GptNeoForCausalLM::new(&p.root(), &config).unwrap();
    /// ```
    pub fn new<'p, P>(p: P, config: &GptNeoConfig) -> Result<GptNeoForCausalLM, TensorParallelError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let transformer = GptNeoModel::new(p / "transformer", config)?;
        Ok(GptNeoForCausalLM { transformer })
    }

    /// Base model the tensor-parallel policy applies to
    pub fn base_model(&self) -> &GptNeoModel {
        &self.transformer
    }

    pub fn base_model_mut(&mut self) -> &mut GptNeoModel {
        &mut self.transformer
    }

    /// Forward pass through the model, see `GptNeoModel::forward_t` for the arguments.
    ///
    /// # Returns
    ///
    /// * `GptNeoModelOutput` whose `hidden_states` holds the vocabulary logits of shape (*batch size*, *sequence_length*, *vocab_size*)
    pub fn forward_t(
        &self,
        input_ids: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        layer_states: Option<Vec<Option<LayerState>>>,
        attention_mask: Option<&Tensor>,
        token_type_ids: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<GptNeoModelOutput, TensorParallelError> {
        let base_model_output = self.transformer.forward_t(
            input_ids,
            input_embeds,
            layer_states,
            attention_mask,
            token_type_ids,
            position_ids,
            train,
        )?;

        let lm_logits = base_model_output
            .hidden_states
            .linear::<Tensor>(&self.transformer.wte.ws, None);

        Ok(GptNeoModelOutput {
            hidden_states: lm_logits,
            ..base_model_output
        })
    }
}

/// Container for the GPT-Neo model output.
pub struct GptNeoModelOutput {
    /// Last hidden states from the model, or logits for the language modeling head
    pub hidden_states: Tensor,
    /// Cached keys and values for every layer
    pub next_cache: Option<Vec<Option<LayerState>>>,
    /// Hidden states for all intermediate layers
    pub all_hidden_states: Option<Vec<Tensor>>,
    /// Attention weights for all intermediate layers
    pub all_attentions: Option<Vec<Tensor>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_repeats_patterns_in_order() -> Result<(), TensorParallelError> {
        use AttentionLayerType::{Global, Local};
        let layers = expand_attention_types(&[(vec![Global], 1), (vec![Local, Global], 2)])?;
        assert_eq!(layers, vec![Global, Local, Global, Local, Global]);
        assert!(expand_attention_types(&[])?.is_empty());
        assert!(expand_attention_types(&[(vec![Local], 0)])?.is_empty());
        assert!(expand_attention_types(&[(vec![Local], -1)]).is_err());
        Ok(())
    }

    #[test]
    fn default_config_is_consistent() {
        let config = GptNeoConfig::default();
        assert_eq!(config.num_layers(), 24);
        assert_eq!(config.attention_layers().len(), 24);
        assert_eq!(config.intermediate_size(), 8192);
        assert_eq!(config.head_dim(), 128);
    }

    #[test]
    fn mismatched_layer_count_is_rejected() {
        let config = GptNeoConfig::new(vec![(vec![AttentionLayerType::Global], 3)], 4);
        assert!(matches!(
            config,
            Err(TensorParallelError::InvalidConfigurationError(_))
        ));
    }
}
