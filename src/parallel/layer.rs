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

use serde::{Deserialize, Serialize};
use std::fmt;
use tch::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// # Module kinds referenced by layer policies
/// Used as dispatch tags by the parallel runtime: source kinds of replacements, fusion map
/// keys and canonical block classes.
pub enum ModuleKind {
    Linear,
    /// GPT2-style convolution, a dense layer with its weight stored as `[in_features, out_features]`
    Conv1D,
    Embedding,
    LayerNorm,
    /// Non-trainable tensor registered on a module (attention masks, mask fill values)
    Buffer,
    ColumnParallelLinear,
    RowParallelLinear,
    VocabParallelEmbedding,
    GptNeoSelfAttention,
    FusedGptNeoSelfAttention,
    GptNeoMlp,
    FusedGptNeoMlp,
    GptNeoBlock,
    Gpt2Attention,
    FusedGpt2Attention,
    Gpt2Mlp,
    FusedGpt2Mlp,
    Gpt2Block,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// # Substitution rule applied when building the parallel version of a module
pub enum Replacement {
    /// `Linear` split along its output features
    LinearToColumnParallel,
    /// `Linear` split along its input features
    LinearToRowParallel,
    /// `Conv1D` split along its output features
    Conv1DToColumnParallel,
    /// `Conv1D` split along its input features
    Conv1DToRowParallel,
    /// `Embedding` split along the vocabulary
    EmbeddingToVocabParallel,
}

impl Replacement {
    /// Kind of the module found in the original model
    pub fn source(&self) -> ModuleKind {
        match self {
            Replacement::LinearToColumnParallel | Replacement::LinearToRowParallel => {
                ModuleKind::Linear
            }
            Replacement::Conv1DToColumnParallel | Replacement::Conv1DToRowParallel => {
                ModuleKind::Conv1D
            }
            Replacement::EmbeddingToVocabParallel => ModuleKind::Embedding,
        }
    }

    /// Kind of the module the runtime builds in its place
    pub fn target(&self) -> ModuleKind {
        match self {
            Replacement::LinearToColumnParallel | Replacement::Conv1DToColumnParallel => {
                ModuleKind::ColumnParallelLinear
            }
            Replacement::LinearToRowParallel | Replacement::Conv1DToRowParallel => {
                ModuleKind::RowParallelLinear
            }
            Replacement::EmbeddingToVocabParallel => ModuleKind::VocabParallelEmbedding,
        }
    }

    pub fn strategy(&self) -> ShardingStrategy {
        match self.target() {
            ModuleKind::RowParallelLinear => ShardingStrategy::RowParallel,
            ModuleKind::VocabParallelEmbedding => ShardingStrategy::VocabParallel,
            _ => ShardingStrategy::ColumnParallel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// # How a tensor is distributed across tensor-parallel ranks
pub enum ShardingStrategy {
    /// Split along the output features, each rank computes a slice of the outputs
    ColumnParallel,
    /// Split along the input features, partial results are summed across ranks
    RowParallel,
    /// Embedding table split along the vocabulary
    VocabParallel,
    /// Identical copy on every rank
    Replicated,
}

/// # Description of a module (or a bare buffer) handed to the parallel runtime
///
/// Borrows the tensors from the model: the runtime reads (and may later replace) them, the
/// descriptor never owns them.
#[derive(Debug)]
pub struct Layer<'a> {
    /// Variable store path of the module, e.g. `transformer.h.0.attn.attention.q_proj`
    pub name: String,
    /// Kind of the module as found in the original model
    pub module: ModuleKind,
    pub weight: Option<&'a Tensor>,
    pub bias: Option<&'a Tensor>,
    /// Whether the tensors take part in tensor-parallel sharding at all
    pub parallel: bool,
    pub replace: Option<Replacement>,
    /// Query, key and value projections stored in a single weight, split per third
    pub combined_qkv: bool,
    /// Weight stored as `[in_features, out_features]`
    pub reversed: bool,
}

impl<'a> Layer<'a> {
    pub fn new(name: impl Into<String>, module: ModuleKind) -> Layer<'a> {
        Layer {
            name: name.into(),
            module,
            weight: None,
            bias: None,
            parallel: true,
            replace: None,
            combined_qkv: false,
            reversed: false,
        }
    }

    /// Descriptor for a non-trainable buffer, copied verbatim on every rank.
    pub fn buffer(name: impl Into<String>, tensor: &'a Tensor) -> Layer<'a> {
        Layer::new(name, ModuleKind::Buffer).bias(tensor).parallel(false)
    }

    pub fn weight(mut self, weight: &'a Tensor) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn bias(mut self, bias: &'a Tensor) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn maybe_bias(mut self, bias: Option<&'a Tensor>) -> Self {
        self.bias = bias;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn replace(mut self, replacement: Replacement) -> Self {
        self.replace = Some(replacement);
        self
    }

    pub fn combined_qkv(mut self) -> Self {
        self.combined_qkv = true;
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }

    /// Sharding strategy implied by the descriptor flags and replacement rule.
    pub fn strategy(&self) -> ShardingStrategy {
        match (self.parallel, self.replace) {
            (true, Some(replacement)) => replacement.strategy(),
            _ => ShardingStrategy::Replicated,
        }
    }

    /// Tensors referenced by this descriptor, weight first.
    pub fn tensors(&self) -> impl Iterator<Item = &'a Tensor> {
        self.weight.into_iter().chain(self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_kinds() {
        assert_eq!(
            Replacement::Conv1DToRowParallel.source(),
            ModuleKind::Conv1D
        );
        assert_eq!(
            Replacement::Conv1DToRowParallel.target(),
            ModuleKind::RowParallelLinear
        );
        assert_eq!(
            Replacement::EmbeddingToVocabParallel.strategy(),
            ShardingStrategy::VocabParallel
        );
        assert_eq!(
            Replacement::LinearToColumnParallel.strategy(),
            ShardingStrategy::ColumnParallel
        );
    }

    #[test]
    fn non_parallel_layers_are_replicated() {
        let weight = Tensor::ones([4, 4], (tch::Kind::Float, tch::Device::Cpu));
        let layer = Layer::new("dense", ModuleKind::Linear)
            .weight(&weight)
            .replace(Replacement::LinearToColumnParallel)
            .parallel(false);
        assert_eq!(layer.strategy(), ShardingStrategy::Replicated);

        let buffer = Layer::buffer("masked_bias", &weight);
        assert!(!buffer.parallel);
        assert!(buffer.weight.is_none());
        assert_eq!(buffer.tensors().count(), 1);
    }
}
