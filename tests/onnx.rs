use rust_tensor_parallel::gpt_neo::{AttentionLayerType, GptNeoConfig, GptNeoConfigFields};
use rust_tensor_parallel::onnx::{
    default_dummy_inputs, ExportTokenizer, GptNeoOnnxConfig, OnnxConfig, OnnxTask,
    ATOL_FOR_VALIDATION, DEFAULT_ONNX_OPSET,
};
use rust_tensor_parallel::TensorParallelError;
use tch::{Device, Kind};

/// Encodes every `<unk>` occurrence as one token, prefixed by `num_special_tokens` markers
struct UnkTokenizer {
    num_special_tokens: i64,
}

impl ExportTokenizer for UnkTokenizer {
    fn unk_token(&self) -> &str {
        "<unk>"
    }

    fn num_special_tokens_to_add(&self, _is_pair: bool) -> i64 {
        self.num_special_tokens
    }

    fn encode_batch(&self, texts: &[String]) -> Vec<Vec<i64>> {
        texts
            .iter()
            .map(|text| {
                let mut ids = vec![1; self.num_special_tokens as usize];
                ids.extend(text.split_inclusive('>').map(|_| 3));
                ids
            })
            .collect()
    }
}

fn gpt_neo_config() -> anyhow::Result<GptNeoConfig> {
    Ok(GptNeoConfig::from_fields(GptNeoConfigFields {
        hidden_size: 64,
        num_heads: 8,
        attention_types: vec![(
            vec![AttentionLayerType::Global, AttentionLayerType::Local],
            2,
        )],
        num_layers: 4,
        ..Default::default()
    })?)
}

#[test]
fn onnx_dummy_inputs_with_past_are_ordered() -> anyhow::Result<()> {
    let onnx_config = GptNeoOnnxConfig::with_past(gpt_neo_config()?, OnnxTask::CausalLm);
    let tokenizer = UnkTokenizer {
        num_special_tokens: 0,
    };

    let dummy_inputs =
        onnx_config.generate_dummy_inputs(&tokenizer, 3, 5, false, Some(Device::Cpu))?;
    assert_eq!(
        dummy_inputs.keys().collect::<Vec<_>>(),
        ["input_ids", "past_key_values", "attention_mask"]
    );

    let input_ids = dummy_inputs["input_ids"]
        .as_tensor()
        .expect("input ids tensor");
    assert_eq!(input_ids.size(), [3, 5]);
    assert_eq!(input_ids.kind(), Kind::Int64);

    let past_key_values = dummy_inputs["past_key_values"]
        .as_past_key_values()
        .expect("past key values");
    assert_eq!(past_key_values.len(), 4);
    for (key, value) in past_key_values {
        assert_eq!(key.size(), [3, 8, 1, 8]);
        assert_eq!(value.size(), [3, 8, 1, 8]);
        assert_eq!(key.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    let attention_mask = dummy_inputs["attention_mask"]
        .as_tensor()
        .expect("attention mask tensor");
    assert_eq!(attention_mask.size(), [3, 6]);
    assert_eq!(attention_mask.sum(Kind::Int64).int64_value(&[]), 18);
    Ok(())
}

#[test]
fn onnx_dummy_inputs_default_dimensions() -> anyhow::Result<()> {
    let tokenizer = UnkTokenizer {
        num_special_tokens: 2,
    };
    let dummy_inputs = default_dummy_inputs(&tokenizer, -1, -1, false, None)?;

    let input_ids = dummy_inputs["input_ids"].as_ids().expect("input ids");
    assert_eq!(input_ids.len(), 2);
    assert!(input_ids.iter().all(|ids| ids.len() == 8));

    let attention_mask = dummy_inputs["attention_mask"]
        .as_ids()
        .expect("attention mask");
    assert!(attention_mask.iter().flatten().all(|value| *value == 1));
    Ok(())
}

#[test]
fn onnx_past_key_values_require_backend() -> anyhow::Result<()> {
    let tokenizer = UnkTokenizer {
        num_special_tokens: 0,
    };
    let with_past = GptNeoOnnxConfig::with_past(gpt_neo_config()?, OnnxTask::Default);
    assert!(matches!(
        with_past.generate_dummy_inputs(&tokenizer, -1, -1, false, None),
        Err(TensorParallelError::MissingBackendError(_))
    ));

    let without_past = GptNeoOnnxConfig::new(gpt_neo_config()?, OnnxTask::Default);
    let dummy_inputs = without_past.generate_dummy_inputs(&tokenizer, -1, -1, false, None)?;
    assert_eq!(
        dummy_inputs.keys().collect::<Vec<_>>(),
        ["input_ids", "attention_mask"]
    );
    Ok(())
}

#[test]
fn onnx_export_settings() -> anyhow::Result<()> {
    let onnx_config = GptNeoOnnxConfig::new(gpt_neo_config()?, OnnxTask::SequenceClassification);
    assert!(!onnx_config.use_past());
    assert_eq!(onnx_config.default_onnx_opset(), DEFAULT_ONNX_OPSET);
    assert_eq!(onnx_config.atol_for_validation(), ATOL_FOR_VALIDATION);
    assert_eq!(
        onnx_config
            .values_override()
            .and_then(|values| values.get("use_cache").cloned()),
        Some(serde_json::Value::Bool(false))
    );

    let outputs = onnx_config.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs["logits"].len(), 1);
    assert_eq!(outputs["logits"].get(&0i64).map(String::as_str), Some("batch"));

    let task: OnnxTask = serde_json::from_str("\"causal-lm\"")?;
    assert_eq!(task, OnnxTask::CausalLm);
    assert_eq!(task.to_string(), "causal-lm");
    Ok(())
}
