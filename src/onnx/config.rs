// Copyright 2021 The HuggingFace Team. All rights reserved.
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

use crate::onnx::tokenizer::ExportTokenizer;
use crate::TensorParallelError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tch::{Device, Kind, Tensor};
use tracing::debug;

/// Batch size used for the dummy inputs when no positive batch size is requested
pub const DEFAULT_FIXED_BATCH: i64 = 2;
/// Sequence length used for the dummy inputs when no positive length is requested
pub const DEFAULT_FIXED_SEQUENCE: i64 = 8;
pub const DEFAULT_ONNX_OPSET: i64 = 11;
/// Absolute tolerance when comparing the exported graph outputs with the reference model
pub const ATOL_FOR_VALIDATION: f64 = 1e-5;

/// Dynamic axes of a single input or output: axis index to symbolic axis name
pub type AxisMap = IndexMap<i64, String>;

/// Ordered description of the inputs (or outputs) of an exported graph
pub type AxesDescription = IndexMap<String, AxisMap>;

/// Ordered dummy inputs, keyed by the argument name of the forward call
pub type DummyInputs = IndexMap<String, DummyInput>;

pub(crate) fn axes<const N: usize>(axes: [(i64, &str); N]) -> AxisMap {
    axes.into_iter()
        .map(|(index, name)| (index, name.to_string()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// # Task the exported graph is built for
pub enum OnnxTask {
    /// Base model, outputs the last hidden state
    Default,
    /// Language modeling head, outputs the vocabulary logits
    CausalLm,
    /// Classification head, outputs one row of logits per sequence
    SequenceClassification,
}

impl OnnxTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnnxTask::Default => "default",
            OnnxTask::CausalLm => "causal-lm",
            OnnxTask::SequenceClassification => "sequence-classification",
        }
    }

    /// Outputs common to every model exported for this task
    pub fn common_outputs(&self) -> AxesDescription {
        match self {
            OnnxTask::Default => IndexMap::from([(
                "last_hidden_state".to_string(),
                axes([(0, "batch"), (1, "sequence")]),
            )]),
            OnnxTask::CausalLm => IndexMap::from([(
                "logits".to_string(),
                axes([(0, "batch"), (1, "sequence")]),
            )]),
            OnnxTask::SequenceClassification => {
                IndexMap::from([("logits".to_string(), axes([(0, "batch")]))])
            }
        }
    }
}

impl fmt::Display for OnnxTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnnxTask {
    type Err = TensorParallelError;

    fn from_str(task: &str) -> Result<Self, Self::Err> {
        match task {
            "default" => Ok(OnnxTask::Default),
            "causal-lm" => Ok(OnnxTask::CausalLm),
            "sequence-classification" => Ok(OnnxTask::SequenceClassification),
            _ => Err(TensorParallelError::ValueError(format!(
                "{} is not a supported task, supported tasks: default, causal-lm, sequence-classification",
                task
            ))),
        }
    }
}

#[derive(Debug)]
/// # Dummy input value
pub enum DummyInput {
    /// Token ids or mask values, built without a tensor backend
    Ids(Vec<Vec<i64>>),
    Tensor(Tensor),
    /// One `(key, value)` pair per layer
    PastKeyValues(Vec<(Tensor, Tensor)>),
}

impl DummyInput {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            DummyInput::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_ids(&self) -> Option<&[Vec<i64>]> {
        match self {
            DummyInput::Ids(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn as_past_key_values(&self) -> Option<&[(Tensor, Tensor)]> {
        match self {
            DummyInput::PastKeyValues(past_key_values) => Some(past_key_values),
            _ => None,
        }
    }
}

/// Replaces a non-positive (dynamic) axis dimension by `fixed_dimension`, then removes the
/// tokens the tokenizer adds.
pub fn compute_effective_axis_dimension(
    dimension: i64,
    fixed_dimension: i64,
    num_token_to_add: i64,
) -> i64 {
    let dimension = if dimension <= 0 {
        fixed_dimension
    } else {
        dimension
    };
    dimension - num_token_to_add
}

/// Builds `input_ids` and `attention_mask` for a batch of texts made of repeated unknown tokens.
///
/// With `device` set, both inputs are `Int64` tensors on that device. Without a device, they are
/// returned as nested vectors.
pub fn default_dummy_inputs(
    tokenizer: &dyn ExportTokenizer,
    batch_size: i64,
    seq_length: i64,
    is_pair: bool,
    device: Option<Device>,
) -> Result<DummyInputs, TensorParallelError> {
    let batch_size = compute_effective_axis_dimension(batch_size, DEFAULT_FIXED_BATCH, 0);
    let token_to_add = tokenizer.num_special_tokens_to_add(is_pair);
    let seq_length =
        compute_effective_axis_dimension(seq_length, DEFAULT_FIXED_SEQUENCE, token_to_add);
    if batch_size < 1 || seq_length < 0 {
        return Err(TensorParallelError::ValueError(format!(
            "Invalid dummy input dimensions: batch size {}, sequence length {}",
            batch_size, seq_length
        )));
    }

    let dummy_input = vec![tokenizer.unk_token().repeat(seq_length as usize); batch_size as usize];
    let token_ids = tokenizer.encode_batch(&dummy_input);

    let max_len = token_ids.iter().map(Vec::len).max().unwrap_or(0);
    let (input_ids, attention_mask): (Vec<Vec<i64>>, Vec<Vec<i64>>) = token_ids
        .into_iter()
        .map(|mut ids| {
            let mut mask = vec![1; ids.len()];
            mask.resize(max_len, 0);
            ids.resize(max_len, 0);
            (ids, mask)
        })
        .unzip();
    debug!(
        batch_size,
        seq_length,
        encoded_length = max_len,
        "built dummy export inputs"
    );

    let to_input = |values: Vec<Vec<i64>>| match device {
        Some(device) => {
            let flat = values.concat();
            DummyInput::Tensor(
                Tensor::from_slice(&flat)
                    .view([batch_size, max_len as i64])
                    .to_kind(Kind::Int64)
                    .to(device),
            )
        }
        None => DummyInput::Ids(values),
    };

    Ok(IndexMap::from([
        ("input_ids".to_string(), to_input(input_ids)),
        ("attention_mask".to_string(), to_input(attention_mask)),
    ]))
}

/// Flattens a nested output field into `{name}.{index}` entries, indexing the inner values
/// consecutively.
pub fn flatten_nested_field(name: &str, field: &[Vec<Tensor>]) -> IndexMap<String, Tensor> {
    field
        .iter()
        .flatten()
        .enumerate()
        .map(|(index, value)| (format!("{}.{}", name, index), value.shallow_clone()))
        .collect()
}

/// # Export description of a model
/// Describes the dynamic axes of the graph inputs and outputs and builds example inputs to trace
/// the model with. Implementations supporting incremental decoding also expose the cached keys
/// and values of each layer when `use_past` is set.
pub trait OnnxConfig {
    fn task(&self) -> OnnxTask;

    /// Whether the graph takes and returns the cached keys and values of every layer
    fn use_past(&self) -> bool {
        false
    }

    fn inputs(&self) -> AxesDescription;

    fn outputs(&self) -> AxesDescription {
        self.task().common_outputs()
    }

    /// Configuration values to override on the model before exporting
    fn values_override(&self) -> Option<IndexMap<String, serde_json::Value>> {
        None
    }

    fn default_onnx_opset(&self) -> i64 {
        DEFAULT_ONNX_OPSET
    }

    fn atol_for_validation(&self) -> f64 {
        ATOL_FOR_VALIDATION
    }

    /// Builds example inputs for tracing, ordered as the forward call expects them.
    ///
    /// # Arguments
    ///
    /// * `tokenizer` - tokenizer used to encode the dummy text
    /// * `batch_size` - batch size, `-1` for the default dynamic size
    /// * `seq_length` - sequence length, `-1` for the default dynamic size
    /// * `is_pair` - whether the inputs are sequence pairs
    /// * `device` - tensor backend device, `None` to build plain vectors
    fn generate_dummy_inputs(
        &self,
        tokenizer: &dyn ExportTokenizer,
        batch_size: i64,
        seq_length: i64,
        is_pair: bool,
        device: Option<Device>,
    ) -> Result<DummyInputs, TensorParallelError> {
        default_dummy_inputs(tokenizer, batch_size, seq_length, is_pair, device)
    }

    /// Flattens a nested output (e.g. the per-layer cache) into named graph outputs.
    fn flatten_output_collection_property(
        &self,
        name: &str,
        field: &[Vec<Tensor>],
    ) -> Result<IndexMap<String, Tensor>, TensorParallelError> {
        Ok(flatten_nested_field(name, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_axis_dimension() {
        assert_eq!(compute_effective_axis_dimension(-1, 8, 2), 6);
        assert_eq!(compute_effective_axis_dimension(0, 2, 0), 2);
        assert_eq!(compute_effective_axis_dimension(5, 8, 1), 4);
    }

    #[test]
    fn task_names() -> Result<(), TensorParallelError> {
        for task in [
            OnnxTask::Default,
            OnnxTask::CausalLm,
            OnnxTask::SequenceClassification,
        ] {
            assert_eq!(task.as_str().parse::<OnnxTask>()?, task);
        }
        assert!("seq2seq-lm".parse::<OnnxTask>().is_err());
        assert_eq!(
            OnnxTask::SequenceClassification.common_outputs()["logits"],
            axes([(0, "batch")])
        );
        Ok(())
    }

    #[test]
    fn nested_fields_are_indexed_consecutively() {
        let tensor = Tensor::zeros([1], (Kind::Float, Device::Cpu));
        let field = vec![
            vec![tensor.shallow_clone(), tensor.shallow_clone()],
            vec![tensor.shallow_clone()],
        ];
        let flattened = flatten_nested_field("logits", &field);
        assert_eq!(
            flattened.keys().collect::<Vec<_>>(),
            ["logits.0", "logits.1", "logits.2"]
        );
    }
}
