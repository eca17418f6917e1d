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

use crate::common::dropout::Dropout;
use crate::gpt2::Gpt2Config;
use crate::TensorParallelError;
use std::borrow::Borrow;
use tch::nn::{Init, Module};
use tch::{nn, Kind, Tensor};

#[derive(Debug)]
/// # GPT2 convolution layer
/// Dense layer with its weight stored transposed, as `[in_features, out_features]`.
pub struct GPTConv1D {
    pub(crate) weight: Tensor,
    pub(crate) bias: Tensor,
}

impl GPTConv1D {
    pub fn new<'p, P>(p: P, nf: i64, nx: i64) -> GPTConv1D
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let weight = p.var(
            "weight",
            &[nx, nf],
            Init::Randn {
                mean: 0.,
                stdev: 0.02,
            },
        );
        let bias = p.var("bias", &[nf], Init::Const(0.));
        GPTConv1D { weight, bias }
    }
}

impl Module for GPTConv1D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.matmul(&self.weight) + &self.bias
    }
}

/// # GPT2 self-attention
/// Query, key and value are computed by a single `c_attn` projection and split along the last
/// dimension in chunks of `split_size`. `num_heads`, `embed_dim` and `split_size` describe the
/// heads held by this rank.
pub struct Gpt2Attention {
    pub(crate) bias: Tensor,
    pub(crate) masked_bias: Tensor,
    pub(crate) c_attn: GPTConv1D,
    pub(crate) c_proj: GPTConv1D,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    pub(crate) embed_dim: i64,
    pub(crate) num_heads: i64,
    pub(crate) split_size: i64,
    head_dim: i64,
    scale: bool,
    output_attentions: bool,
}

impl Gpt2Attention {
    pub fn new<'p, P>(p: P, config: &Gpt2Config, scale: bool) -> Gpt2Attention
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let max_positions = config.n_positions;
        let mut bias = p.zeros_no_train("bias", &[1, 1, max_positions, max_positions]);
        let mut masked_bias = p.zeros_no_train("masked_bias", &[]);
        tch::no_grad(|| {
            bias.copy_(
                &Tensor::ones([max_positions, max_positions], (Kind::Float, p.device()))
                    .tril(0)
                    .view([1, 1, max_positions, max_positions]),
            );
            let _ = masked_bias.fill_(-1e4);
        });

        let c_attn = GPTConv1D::new(p / "c_attn", config.n_embd * 3, config.n_embd);
        let c_proj = GPTConv1D::new(p / "c_proj", config.n_embd, config.n_embd);

        let attn_dropout = Dropout::from_config(config.attn_pdrop, 0.1);
        let resid_dropout = Dropout::from_config(config.resid_pdrop, 0.1);

        Gpt2Attention {
            bias,
            masked_bias,
            c_attn,
            c_proj,
            attn_dropout,
            resid_dropout,
            embed_dim: config.n_embd,
            num_heads: config.n_head,
            split_size: config.n_embd,
            head_dim: config.head_dim(),
            scale,
            output_attentions: config.output_attentions.unwrap_or(false),
        }
    }

    /// Number of heads held by this rank
    pub fn num_heads(&self) -> i64 {
        self.num_heads
    }

    /// Embedding dimension held by this rank
    pub fn embed_dim(&self) -> i64 {
        self.embed_dim
    }

    /// Width of each of the query, key and value chunks of the `c_attn` output
    pub fn split_size(&self) -> i64 {
        self.split_size
    }

    fn split_heads(&self, x: &Tensor) -> Tensor {
        let mut new_shape = x.size();
        let _ = new_shape.pop();
        new_shape.extend_from_slice(&[self.num_heads, self.head_dim]);
        x.view(new_shape.as_slice()).permute([0, 2, 1, 3])
    }

    fn merge_heads(&self, x: &Tensor) -> Tensor {
        let x = x.permute([0, 2, 1, 3]).contiguous();
        let mut new_shape = x.size();
        new_shape.truncate(new_shape.len() - 2);
        new_shape.push(self.num_heads * self.head_dim);
        x.view(new_shape.as_slice())
    }

    /// Forward pass through the attention layer
    ///
    /// # Arguments
    ///
    /// * `x` - input of shape (*batch size*, *sequence_length*, *hidden_size*)
    /// * `layer_past` - optional cache of shape (*2*, *batch size*, *number of heads*, *past_sequence_length*, *head dimension*)
    /// * `attention_mask` - optional additive mask of shape (*batch size*, 1, 1, *past_sequence_length + sequence_length*)
    /// * `train` - boolean flag to turn on/off the dropout layers
    ///
    /// # Returns
    ///
    /// * `Tensor` of shape (*batch size*, *sequence_length*, *hidden_size*)
    /// * `Tensor` present keys and values, of shape (*2*, *batch size*, *number of heads*, *sequence_length*, *head dimension*)
    /// * `Option<Tensor>` attention weights, if `output_attentions` is set
    pub fn forward_t(
        &self,
        x: &Tensor,
        layer_past: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor, Option<Tensor>), TensorParallelError> {
        let qkv = x.apply(&self.c_attn).split(self.split_size, 2);
        if qkv.len() != 3 {
            return Err(TensorParallelError::ValueError(format!(
                "Expected query, key and value chunks of size {}, got {} chunks",
                self.split_size,
                qkv.len()
            )));
        }
        let query = self.split_heads(&qkv[0]);
        let key = self.split_heads(&qkv[1]);
        let value = self.split_heads(&qkv[2]);

        let (key, value) = match layer_past {
            Some(past) => (
                Tensor::cat(&[past.get(0), key], -2),
                Tensor::cat(&[past.get(1), value], -2),
            ),
            None => (key, value),
        };
        let present = Tensor::stack(&[&key, &value], 0);

        let query_length = query.size()[2];
        let key_length = key.size()[2];

        let mut attention_weights = query.matmul(&key.transpose(-1, -2));
        if self.scale {
            attention_weights = attention_weights / (self.head_dim as f64).sqrt();
        }
        let causal_mask = self
            .bias
            .slice(2, key_length - query_length, key_length, 1)
            .slice(3, 0, key_length, 1)
            .to_kind(Kind::Bool);
        let mut attention_weights = attention_weights.where_self(&causal_mask, &self.masked_bias);
        if let Some(mask) = attention_mask {
            attention_weights = attention_weights + mask;
        };
        let attention_weights = attention_weights
            .softmax(-1, attention_weights.kind())
            .apply_t(&self.attn_dropout, train);

        let output = self
            .merge_heads(&attention_weights.matmul(&value))
            .apply(&self.c_proj)
            .apply_t(&self.resid_dropout, train);

        let attention_weights = if self.output_attentions {
            Some(attention_weights)
        } else {
            None
        };
        Ok((output, present, attention_weights))
    }
}
