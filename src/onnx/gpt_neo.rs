// Copyright 2021 The EleutherAI and HuggingFace Teams. All rights reserved.
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

use crate::gpt_neo::GptNeoConfig;
use crate::onnx::config::{
    axes, default_dummy_inputs, flatten_nested_field, AxesDescription, DummyInput, DummyInputs,
    OnnxConfig, OnnxTask,
};
use crate::onnx::tokenizer::ExportTokenizer;
use crate::TensorParallelError;
use indexmap::IndexMap;
use tch::{Device, Kind, Tensor};
use tracing::debug;

/// # ONNX export description of GPT-Neo
/// With `use_past` set, the graph takes the cached keys and values of every layer as inputs
/// (`past_key_values.{i}.key|value`) and returns the updated cache (`present.{i}.key|value`).
///
/// ```
/// use rust_tensor_parallel::gpt_neo::GptNeoConfig;
/// use rust_tensor_parallel::onnx::{GptNeoOnnxConfig, OnnxConfig, OnnxTask};
///
/// let onnx_config = GptNeoOnnxConfig::with_past(GptNeoConfig::default(), OnnxTask::CausalLm);
/// let inputs = onnx_config.inputs();
/// assert_eq!(inputs.get_index(0).map(|(name, _)| name.as_str()), Some("input_ids"));
/// assert_eq!(inputs.last().map(|(name, _)| name.as_str()), Some("attention_mask"));
/// ```
#[derive(Debug, Clone)]
pub struct GptNeoOnnxConfig {
    config: GptNeoConfig,
    task: OnnxTask,
    use_past: bool,
}

impl GptNeoOnnxConfig {
    pub fn new(config: GptNeoConfig, task: OnnxTask) -> GptNeoOnnxConfig {
        GptNeoOnnxConfig {
            config,
            task,
            use_past: false,
        }
    }

    /// Export description including the key/value cache inputs and outputs
    pub fn with_past(config: GptNeoConfig, task: OnnxTask) -> GptNeoOnnxConfig {
        GptNeoOnnxConfig {
            config,
            task,
            use_past: true,
        }
    }

    pub fn config(&self) -> &GptNeoConfig {
        &self.config
    }

    pub fn num_layers(&self) -> i64 {
        self.config.num_layers()
    }

    pub fn num_attention_heads(&self) -> i64 {
        self.config.num_heads()
    }

    fn cache_axes(&self, prefix: &str, sequence_axis: &str) -> AxesDescription {
        (0..self.num_layers())
            .flat_map(|layer| {
                ["key", "value"].map(|part| {
                    (
                        format!("{}.{}.{}", prefix, layer, part),
                        axes([(0, "batch"), (2, sequence_axis)]),
                    )
                })
            })
            .collect()
    }
}

impl OnnxConfig for GptNeoOnnxConfig {
    fn task(&self) -> OnnxTask {
        self.task
    }

    fn use_past(&self) -> bool {
        self.use_past
    }

    fn inputs(&self) -> AxesDescription {
        let mut inputs =
            IndexMap::from([("input_ids".to_string(), axes([(0, "batch"), (1, "sequence")]))]);
        if self.use_past {
            inputs.extend(self.cache_axes("past_key_values", "past_sequence"));
            inputs.insert(
                "attention_mask".to_string(),
                axes([(0, "batch"), (1, "past_sequence + sequence")]),
            );
        } else {
            inputs.insert(
                "attention_mask".to_string(),
                axes([(0, "batch"), (1, "sequence")]),
            );
        }
        inputs
    }

    fn outputs(&self) -> AxesDescription {
        let mut outputs = self.task.common_outputs();
        if self.use_past {
            outputs.extend(self.cache_axes("present", "past_sequence + sequence"));
        }
        outputs
    }

    fn values_override(&self) -> Option<IndexMap<String, serde_json::Value>> {
        Some(IndexMap::from([(
            "use_cache".to_string(),
            serde_json::Value::Bool(self.use_past),
        )]))
    }

    fn generate_dummy_inputs(
        &self,
        tokenizer: &dyn ExportTokenizer,
        batch_size: i64,
        seq_length: i64,
        is_pair: bool,
        device: Option<Device>,
    ) -> Result<DummyInputs, TensorParallelError> {
        let mut common_inputs =
            default_dummy_inputs(tokenizer, batch_size, seq_length, is_pair, device)?;

        let mut ordered_inputs = IndexMap::new();
        if let Some(input_ids) = common_inputs.shift_remove("input_ids") {
            ordered_inputs.insert("input_ids".to_string(), input_ids);
        }
        let attention_mask = common_inputs.shift_remove("attention_mask");

        if !self.use_past {
            if let Some(attention_mask) = attention_mask {
                ordered_inputs.insert("attention_mask".to_string(), attention_mask);
            }
            return Ok(ordered_inputs);
        }

        let device = device.ok_or_else(|| {
            TensorParallelError::MissingBackendError(
                "generating past key values requires a tensor backend device".to_string(),
            )
        })?;
        let batch = match ordered_inputs.get("input_ids").and_then(DummyInput::as_tensor) {
            Some(input_ids) => input_ids.size()[0],
            None => {
                return Err(TensorParallelError::ValueError(
                    "dummy input ids were not generated".to_string(),
                ))
            }
        };
        let past_shape = [
            batch,
            self.num_attention_heads(),
            1,
            self.config.hidden_size() / self.num_attention_heads(),
        ];
        let past_key_values = (0..self.num_layers())
            .map(|_| {
                (
                    Tensor::zeros(past_shape, (Kind::Float, device)),
                    Tensor::zeros(past_shape, (Kind::Float, device)),
                )
            })
            .collect::<Vec<_>>();
        debug!(
            num_layers = past_key_values.len(),
            ?past_shape,
            "generated dummy past key values"
        );
        ordered_inputs.insert(
            "past_key_values".to_string(),
            DummyInput::PastKeyValues(past_key_values),
        );

        let attention_mask = match attention_mask.as_ref().and_then(DummyInput::as_tensor) {
            Some(attention_mask) => Tensor::cat(
                &[
                    attention_mask.shallow_clone(),
                    Tensor::ones([batch, 1], (attention_mask.kind(), device)),
                ],
                1,
            ),
            None => {
                return Err(TensorParallelError::ValueError(
                    "dummy attention mask was not generated".to_string(),
                ))
            }
        };
        ordered_inputs.insert(
            "attention_mask".to_string(),
            DummyInput::Tensor(attention_mask),
        );
        Ok(ordered_inputs)
    }

    fn flatten_output_collection_property(
        &self,
        name: &str,
        field: &[Vec<Tensor>],
    ) -> Result<IndexMap<String, Tensor>, TensorParallelError> {
        if !matches!(name, "present" | "past_key_values") {
            return Ok(flatten_nested_field(name, field));
        }
        let mut flattened = IndexMap::new();
        for (layer, pair) in field.iter().enumerate() {
            match pair.as_slice() {
                [key, value] => {
                    flattened.insert(format!("{}.{}.key", name, layer), key.shallow_clone());
                    flattened.insert(format!("{}.{}.value", name, layer), value.shallow_clone());
                }
                _ => {
                    return Err(TensorParallelError::ValueError(format!(
                        "{}.{} holds {} tensors, expected a key and a value",
                        name,
                        layer,
                        pair.len()
                    )))
                }
            }
        }
        Ok(flattened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt_neo::{AttentionLayerType, GptNeoConfigFields};

    struct RepeatTokenizer;

    impl ExportTokenizer for RepeatTokenizer {
        fn unk_token(&self) -> &str {
            "?"
        }

        fn num_special_tokens_to_add(&self, _is_pair: bool) -> i64 {
            0
        }

        fn encode_batch(&self, texts: &[String]) -> Vec<Vec<i64>> {
            texts
                .iter()
                .map(|text| text.chars().map(|_| 3).collect())
                .collect()
        }
    }

    fn small_config() -> Result<GptNeoConfig, TensorParallelError> {
        GptNeoConfig::from_fields(GptNeoConfigFields {
            hidden_size: 32,
            num_heads: 4,
            window_size: 4,
            num_layers: 2,
            attention_types: vec![(
                vec![AttentionLayerType::Global, AttentionLayerType::Local],
                1,
            )],
            ..Default::default()
        })
    }

    #[test]
    fn cache_axes_follow_layers() -> Result<(), TensorParallelError> {
        let onnx_config = GptNeoOnnxConfig::with_past(small_config()?, OnnxTask::CausalLm);
        let inputs = onnx_config.inputs();
        assert_eq!(
            inputs.keys().collect::<Vec<_>>(),
            [
                "input_ids",
                "past_key_values.0.key",
                "past_key_values.0.value",
                "past_key_values.1.key",
                "past_key_values.1.value",
                "attention_mask"
            ]
        );
        assert_eq!(
            inputs["attention_mask"].get(&1i64).map(String::as_str),
            Some("past_sequence + sequence")
        );

        let outputs = onnx_config.outputs();
        assert_eq!(outputs.get_index(0).map(|(k, _)| k.as_str()), Some("logits"));
        assert_eq!(outputs.len(), 5);
        assert_eq!(
            outputs["present.1.value"].get(&2i64).map(String::as_str),
            Some("past_sequence + sequence")
        );
        assert_eq!(
            onnx_config.values_override().and_then(|v| v.get("use_cache").cloned()),
            Some(serde_json::Value::Bool(true))
        );
        Ok(())
    }

    #[test]
    fn without_past_only_ids_and_mask() -> Result<(), TensorParallelError> {
        let onnx_config = GptNeoOnnxConfig::new(small_config()?, OnnxTask::Default);
        assert_eq!(
            onnx_config.inputs().keys().collect::<Vec<_>>(),
            ["input_ids", "attention_mask"]
        );
        assert_eq!(
            onnx_config.outputs().keys().collect::<Vec<_>>(),
            ["last_hidden_state"]
        );

        let dummy_inputs = onnx_config.generate_dummy_inputs(&RepeatTokenizer, -1, -1, false, None)?;
        let input_ids = dummy_inputs["input_ids"].as_ids().unwrap();
        assert_eq!(input_ids.len(), 2);
        assert!(input_ids.iter().all(|ids| ids.len() == 8));
        Ok(())
    }

    #[test]
    fn past_key_values_need_a_backend() -> Result<(), TensorParallelError> {
        let onnx_config = GptNeoOnnxConfig::with_past(small_config()?, OnnxTask::CausalLm);
        let result = onnx_config.generate_dummy_inputs(&RepeatTokenizer, 2, 5, false, None);
        assert!(matches!(
            result,
            Err(TensorParallelError::MissingBackendError(_))
        ));
        Ok(())
    }

    #[test]
    fn cache_outputs_are_flattened_per_layer() -> Result<(), TensorParallelError> {
        let onnx_config = GptNeoOnnxConfig::with_past(small_config()?, OnnxTask::CausalLm);
        let tensor = Tensor::zeros([1], (Kind::Float, Device::Cpu));
        let field = vec![
            vec![tensor.shallow_clone(), tensor.shallow_clone()],
            vec![tensor.shallow_clone(), tensor.shallow_clone()],
        ];
        let flattened = onnx_config.flatten_output_collection_property("present", &field)?;
        assert_eq!(
            flattened.keys().collect::<Vec<_>>(),
            [
                "present.0.key",
                "present.0.value",
                "present.1.key",
                "present.1.value"
            ]
        );

        let flattened = onnx_config.flatten_output_collection_property("hidden_states", &field)?;
        assert_eq!(flattened.len(), 4);
        assert!(flattened.contains_key("hidden_states.3"));

        let malformed = vec![vec![tensor.shallow_clone()]];
        assert!(onnx_config
            .flatten_output_collection_property("past_key_values", &malformed)
            .is_err());
        Ok(())
    }
}
