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
use crate::gpt_neo::attention_utils::{
    get_block_length_and_num_blocks, look_back, split_sequence_length_dim_to,
};
use crate::gpt_neo::{AttentionLayerType, GptNeoConfig};
use crate::TensorParallelError;
use std::borrow::Borrow;
use tch::{nn, Kind, Tensor};

#[derive(Debug)]
/// # Cache for GPT-Neo attention layers
/// Stores the cached value of key and value
pub struct LayerState {
    /// Cached keys, shape (*batch size*, *number of heads*, *past_sequence_length*, *head dimension*)
    pub prev_key: Tensor,
    /// Cached values, shape (*batch size*, *number of heads*, *past_sequence_length*, *head dimension*)
    pub prev_value: Tensor,
}

impl Clone for LayerState {
    fn clone(&self) -> Self {
        LayerState {
            prev_key: self.prev_key.copy(),
            prev_value: self.prev_value.copy(),
        }
    }
}

impl LayerState {
    /// Reorders the cache along the batch dimension (e.g. after a beam search step)
    pub fn reorder_cache(&mut self, new_indices: &Tensor) {
        self.prev_key = self.prev_key.index_select(0, new_indices);
        self.prev_value = self.prev_value.index_select(0, new_indices);
    }
}

fn split_heads(
    input_tensor: &Tensor,
    num_heads: i64,
    attention_head_size: i64,
) -> Result<Tensor, TensorParallelError> {
    let mut new_shape = input_tensor.size();
    let _ = new_shape.pop();
    new_shape.extend_from_slice(&[num_heads, attention_head_size]);

    let reshaped_tensor = input_tensor.reshape(new_shape.as_slice());

    Ok(match reshaped_tensor.size().len() {
        5 => reshaped_tensor.permute([0, 1, 3, 2, 4]),
        4 => reshaped_tensor.permute([0, 2, 1, 3]),
        _ => {
            return Err(TensorParallelError::ValueError(format!(
                "Invalid tensor rank, expected 4 or 5, got {}",
                reshaped_tensor.size().len()
            )));
        }
    })
}

fn merge_heads(
    input_tensor: &Tensor,
    num_heads: i64,
    attention_head_size: i64,
) -> Result<Tensor, TensorParallelError> {
    let output_tensor = match input_tensor.size().len() {
        5 => input_tensor.permute([0, 1, 3, 2, 4]).contiguous(),
        4 => input_tensor.permute([0, 2, 1, 3]).contiguous(),
        _ => {
            return Err(TensorParallelError::ValueError(format!(
                "Invalid tensor rank, expected 4 or 5, got {}",
                input_tensor.size().len()
            )));
        }
    };
    let mut new_shape = output_tensor.size();
    new_shape.truncate(new_shape.len() - 2);
    new_shape.push(num_heads * attention_head_size);
    Ok(output_tensor.view(new_shape.as_slice()))
}

#[allow(clippy::too_many_arguments)]
fn attend(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    causal_mask: &Tensor,
    masked_bias: &Tensor,
    attention_dropout: &Dropout,
    attention_mask: Option<&Tensor>,
    train: bool,
) -> (Tensor, Tensor) {
    let query = query.to_kind(Kind::Float);
    let key = key.to_kind(Kind::Float);

    let mut attention_weights = query
        .matmul(&key.transpose(-1, -2))
        .where_self(causal_mask, &masked_bias.to_kind(Kind::Float));

    if let Some(attention_mask_value) = attention_mask {
        attention_weights = attention_weights + attention_mask_value;
    };

    let attention_weights = attention_weights
        .softmax(-1, Kind::Float)
        .to_kind(value.kind())
        .apply_t(attention_dropout, train);

    let attention_output = attention_weights.matmul(value);
    (attention_output, attention_weights)
}

/// # GPT-Neo self-attention
/// Multi-head causal self-attention, either global (full causal mask) or local (causal mask
/// restricted to a window of past positions). Attention scores are not scaled.
///
/// `num_heads` and `embed_dim` describe the heads held by this rank: they are divided by the
/// world size when the layer is sharded across tensor-parallel ranks, while `head_dim` is fixed.
pub struct GptNeoSelfAttention {
    pub(crate) k_proj: nn::Linear,
    pub(crate) v_proj: nn::Linear,
    pub(crate) q_proj: nn::Linear,
    pub(crate) out_proj: nn::Linear,
    attention_dropout: Dropout,
    resid_dropout: Dropout,
    pub(crate) bias: Tensor,
    pub(crate) masked_bias: Tensor,
    attention_type: AttentionLayerType,
    window_size: i64,
    pub(crate) embed_dim: i64,
    pub(crate) num_heads: i64,
    head_dim: i64,
    output_attentions: bool,
}

impl GptNeoSelfAttention {
    pub fn new<'p, P>(
        p: P,
        config: &GptNeoConfig,
        attention_type: AttentionLayerType,
    ) -> Result<GptNeoSelfAttention, TensorParallelError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let embed_dim = config.hidden_size();
        let num_heads = config.num_heads();
        if num_heads < 1 || embed_dim % num_heads != 0 {
            return Err(TensorParallelError::InvalidConfigurationError(format!(
                "embed_dim must be divisible by num_heads (got `embed_dim`: {} and `num_heads`: {})",
                embed_dim, num_heads
            )));
        }
        let head_dim = embed_dim / num_heads;
        let max_positions = config.max_position_embeddings;

        let causal_mask =
            Tensor::ones([max_positions, max_positions], (Kind::Float, p.device())).tril(0);
        let causal_mask = match attention_type {
            AttentionLayerType::Global => causal_mask,
            AttentionLayerType::Local => &causal_mask - causal_mask.tril(-config.window_size()),
        };
        let mut bias = p.zeros_no_train("bias", &[1, 1, max_positions, max_positions]);
        let mut masked_bias = p.zeros_no_train("masked_bias", &[]);
        tch::no_grad(|| {
            bias.copy_(&causal_mask.view([1, 1, max_positions, max_positions]));
            let _ = masked_bias.fill_(-1e9);
        });

        let linear_config = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };
        let k_proj = nn::linear(p / "k_proj", embed_dim, embed_dim, linear_config);
        let v_proj = nn::linear(p / "v_proj", embed_dim, embed_dim, linear_config);
        let q_proj = nn::linear(p / "q_proj", embed_dim, embed_dim, linear_config);
        let out_proj = nn::linear(p / "out_proj", embed_dim, embed_dim, Default::default());

        Ok(GptNeoSelfAttention {
            k_proj,
            v_proj,
            q_proj,
            out_proj,
            attention_dropout: Dropout::new(config.attention_dropout),
            resid_dropout: Dropout::new(config.resid_dropout),
            bias,
            masked_bias,
            attention_type,
            window_size: config.window_size(),
            embed_dim,
            num_heads,
            head_dim,
            output_attentions: config.output_attentions.unwrap_or(false),
        })
    }

    pub fn attention_type(&self) -> AttentionLayerType {
        self.attention_type
    }

    /// Number of heads held by this rank
    pub fn num_heads(&self) -> i64 {
        self.num_heads
    }

    /// Embedding dimension held by this rank (`num_heads * head_dim`)
    pub fn embed_dim(&self) -> i64 {
        self.embed_dim
    }

    pub fn head_dim(&self) -> i64 {
        self.head_dim
    }

    /// Forward pass through the attention layer
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - input of shape (*batch size*, *sequence_length*, *hidden_size*)
    /// * `layer_state` - optional cached keys and values from previous steps
    /// * `attention_mask` - optional additive mask of shape (*batch size*, 1, 1, *past_sequence_length + sequence_length*)
    /// * `local_attention_mask` - boolean mask built by `create_local_attention_mask`. For local layers without cache, enables the blocked attention computation.
    /// * `train` - boolean flag to turn on/off the dropout layers
    ///
    /// # Returns
    ///
    /// * `Tensor` of shape (*batch size*, *sequence_length*, *hidden_size*)
    /// * `Option<Tensor>` attention weights, if `output_attentions` is set
    /// * `LayerState` holding the keys and values for all positions seen so far
    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        layer_state: Option<&LayerState>,
        attention_mask: Option<&Tensor>,
        local_attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>, LayerState), TensorParallelError> {
        let query = hidden_states.apply(&self.q_proj);
        let key = hidden_states.apply(&self.k_proj);
        let value = hidden_states.apply(&self.v_proj);

        let (attention_output, attention_weights, layer_state) =
            match (self.attention_type, layer_state, local_attention_mask) {
                (AttentionLayerType::Local, None, Some(local_attention_mask)) => {
                    self.blocked_attention(&query, &key, &value, local_attention_mask, train)?
                }
                _ => self.masked_attention(&query, &key, &value, layer_state, attention_mask, train)?,
            };

        let attention_output = attention_output
            .apply(&self.out_proj)
            .apply_t(&self.resid_dropout, train);

        let attention_weights = if self.output_attentions {
            Some(attention_weights)
        } else {
            None
        };

        Ok((attention_output, attention_weights, layer_state))
    }

    /// Attention over the full key sequence, masked by the `bias` buffer (causal for global
    /// layers, causal band for local layers).
    fn masked_attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        layer_state: Option<&LayerState>,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor, LayerState), TensorParallelError> {
        let query = split_heads(query, self.num_heads, self.head_dim)?;
        let key = split_heads(key, self.num_heads, self.head_dim)?;
        let value = split_heads(value, self.num_heads, self.head_dim)?;

        let (key, value) = match layer_state {
            Some(layer_state) => (
                Tensor::cat(&[&layer_state.prev_key, &key], -2),
                Tensor::cat(&[&layer_state.prev_value, &value], -2),
            ),
            None => (key, value),
        };

        let query_length = query.size()[2];
        let key_length = key.size()[2];

        let causal_mask = self
            .bias
            .slice(2, key_length - query_length, key_length, 1)
            .slice(3, 0, key_length, 1)
            .to_kind(Kind::Bool);

        let (attention_output, attention_weights) = attend(
            &query,
            &key,
            &value,
            &causal_mask,
            &self.masked_bias,
            &self.attention_dropout,
            attention_mask,
            train,
        );
        let attention_output = merge_heads(&attention_output, self.num_heads, self.head_dim)?;

        Ok((
            attention_output,
            attention_weights,
            LayerState {
                prev_key: key,
                prev_value: value,
            },
        ))
    }

    /// Local attention computed block-wise: the sequence is split into blocks, each block
    /// attending to itself and to the `window_size` positions preceding it.
    fn blocked_attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        local_attention_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor, LayerState), TensorParallelError> {
        let input_shape = query.size();
        let (batch_size, sequence_length) = (input_shape[0], input_shape[1]);
        let (block_length, num_blocks) =
            get_block_length_and_num_blocks(sequence_length, self.window_size)?;

        let blocked_query =
            split_sequence_length_dim_to(query, num_blocks, block_length, self.embed_dim)?;
        let blocked_key = look_back(key, block_length, self.window_size, true)?;
        let blocked_value = look_back(value, block_length, self.window_size, true)?;

        let blocked_query = split_heads(&blocked_query, self.num_heads, self.head_dim)?;
        let blocked_key = split_heads(&blocked_key, self.num_heads, self.head_dim)?;
        let blocked_value = split_heads(&blocked_value, self.num_heads, self.head_dim)?;

        let (attention_output, attention_weights) = attend(
            &blocked_query,
            &blocked_key,
            &blocked_value,
            local_attention_mask,
            &self.masked_bias,
            &self.attention_dropout,
            None,
            train,
        );
        let attention_output = merge_heads(&attention_output, self.num_heads, self.head_dim)?
            .reshape([batch_size, sequence_length, self.embed_dim]);

        let layer_state = LayerState {
            prev_key: split_heads(key, self.num_heads, self.head_dim)?,
            prev_value: split_heads(value, self.num_heads, self.head_dim)?,
        };

        Ok((attention_output, attention_weights, layer_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt_neo::attention_utils::create_local_attention_mask;
    use crate::gpt_neo::GptNeoConfigFields;
    use tch::{nn::VarStore, Device};

    fn local_config(window_size: i64) -> anyhow::Result<GptNeoConfig> {
        Ok(GptNeoConfig::from_fields(GptNeoConfigFields {
            hidden_size: 16,
            num_heads: 4,
            max_position_embeddings: 32,
            window_size,
            num_layers: 1,
            attention_types: vec![(vec![AttentionLayerType::Local], 1)],
            ..Default::default()
        })?)
    }

    #[test]
    fn blocked_local_attention_matches_band_mask() -> anyhow::Result<()> {
        tch::manual_seed(0);
        let config = local_config(4)?;
        let vs = VarStore::new(Device::Cpu);
        let attention =
            GptNeoSelfAttention::new(vs.root() / "attention", &config, AttentionLayerType::Local)?;

        let (batch_size, sequence_length) = (2, 12);
        let hidden_states = Tensor::randn(
            [batch_size, sequence_length, config.hidden_size()],
            (Kind::Float, Device::Cpu),
        );
        let local_mask = create_local_attention_mask(
            batch_size,
            sequence_length,
            config.window_size(),
            Device::Cpu,
            None,
        )?;

        let (blocked, _, blocked_state) =
            attention.forward_t(&hidden_states, None, None, Some(&local_mask), false)?;
        let (banded, _, banded_state) =
            attention.forward_t(&hidden_states, None, None, None, false)?;

        assert_eq!(blocked.size(), vec![batch_size, sequence_length, config.hidden_size()]);
        assert!(blocked.allclose(&banded, 1e-5, 1e-5, false));
        assert!(blocked_state.prev_key.equal(&banded_state.prev_key));
        assert!(blocked_state.prev_value.equal(&banded_state.prev_value));
        Ok(())
    }

    #[test]
    fn local_bias_is_a_causal_band() -> anyhow::Result<()> {
        let config = local_config(4)?;
        let vs = VarStore::new(Device::Cpu);
        let attention =
            GptNeoSelfAttention::new(vs.root() / "attention", &config, AttentionLayerType::Local)?;
        let bias = attention.bias.get(0).get(0);
        assert_eq!(bias.double_value(&[10, 10]), 1.0);
        assert_eq!(bias.double_value(&[10, 7]), 1.0);
        assert_eq!(bias.double_value(&[10, 6]), 0.0);
        assert_eq!(bias.double_value(&[10, 11]), 0.0);
        assert_eq!(attention.masked_bias.double_value(&[]), -1e9);
        Ok(())
    }

    #[test]
    fn reduced_attention_runs_on_its_shard() -> anyhow::Result<()> {
        tch::manual_seed(0);
        let config = local_config(256)?;
        let world_size = 2;
        let vs = VarStore::new(Device::Cpu);
        let mut attention =
            GptNeoSelfAttention::new(vs.root() / "attention", &config, AttentionLayerType::Global)?;

        // rank 0 keeps the first half of the heads
        let shard = config.hidden_size() / world_size;
        attention.num_heads = config.num_heads() / world_size;
        attention.embed_dim = shard;
        for projection in [
            &mut attention.q_proj,
            &mut attention.k_proj,
            &mut attention.v_proj,
        ] {
            projection.ws = projection.ws.narrow(0, 0, shard);
        }
        attention.out_proj.ws = attention.out_proj.ws.narrow(1, 0, shard);

        let hidden_states =
            Tensor::randn([1, 5, config.hidden_size()], (Kind::Float, Device::Cpu));
        let (output, _, layer_state) =
            attention.forward_t(&hidden_states, None, None, None, false)?;

        assert_eq!(output.size(), vec![1, 5, config.hidden_size()]);
        assert_eq!(
            layer_state.prev_key.size(),
            vec![1, config.num_heads() / world_size, 5, attention.head_dim()]
        );
        Ok(())
    }
}
