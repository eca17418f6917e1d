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

use crate::common::activations::{Activation, TensorFunction};
use crate::common::dropout::Dropout;
use crate::gpt2::attention::{GPTConv1D, Gpt2Attention};
use crate::gpt2::Gpt2Config;
use crate::TensorParallelError;
use std::borrow::Borrow;
use tch::{nn, Tensor};

pub struct Gpt2Mlp {
    pub(crate) c_fc: GPTConv1D,
    pub(crate) c_proj: GPTConv1D,
    activation: TensorFunction,
    dropout: Dropout,
}

impl Gpt2Mlp {
    pub fn new<'p, P>(p: P, config: &Gpt2Config) -> Gpt2Mlp
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let intermediate_size = config.intermediate_size();
        let c_fc = GPTConv1D::new(p / "c_fc", intermediate_size, config.n_embd);
        let c_proj = GPTConv1D::new(p / "c_proj", config.n_embd, intermediate_size);
        let activation = config
            .afn
            .unwrap_or(Activation::gelu_new)
            .get_function();
        let dropout = Dropout::from_config(config.resid_pdrop, 0.1);
        Gpt2Mlp {
            c_fc,
            c_proj,
            activation,
            dropout,
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let h = (self.activation.get_fn())(&x.apply(&self.c_fc));
        h.apply(&self.c_proj).apply_t(&self.dropout, train)
    }
}

/// # GPT2 transformer block
/// Pre-norm block made of a self-attention layer and a MLP.
pub struct Gpt2Block {
    pub(crate) layer_id: usize,
    pub(crate) ln_1: nn::LayerNorm,
    pub(crate) attn: Gpt2Attention,
    pub(crate) ln_2: nn::LayerNorm,
    pub(crate) mlp: Gpt2Mlp,
}

impl Gpt2Block {
    pub fn new<'p, P>(p: P, layer_id: usize, config: &Gpt2Config, scale: bool) -> Gpt2Block
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let layer_norm_config = nn::LayerNormConfig {
            eps: config.layer_norm_epsilon,
            ..Default::default()
        };
        let ln_1 = nn::layer_norm(p / "ln_1", vec![config.n_embd], layer_norm_config);
        let ln_2 = nn::layer_norm(p / "ln_2", vec![config.n_embd], layer_norm_config);
        let attn = Gpt2Attention::new(p / "attn", config, scale);
        let mlp = Gpt2Mlp::new(p / "mlp", config);

        Gpt2Block {
            layer_id,
            ln_1,
            attn,
            ln_2,
            mlp,
        }
    }

    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    pub fn attention(&self) -> &Gpt2Attention {
        &self.attn
    }

    pub(crate) fn module_name(&self, suffix: &str) -> String {
        format!("h.{}.{}", self.layer_id, suffix)
    }

    pub fn forward_t(
        &self,
        x: &Tensor,
        layer_past: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor, Option<Tensor>), TensorParallelError> {
        let (output, present, attentions) =
            self.attn
                .forward_t(&x.apply(&self.ln_1), layer_past, attention_mask, train)?;
        let x = x + output;
        let m = self.mlp.forward_t(&x.apply(&self.ln_2), train);
        Ok((x + m, present, attentions))
    }
}
