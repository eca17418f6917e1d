use rust_tensor_parallel::gpt_neo::attention_utils::unfold;
use rust_tensor_parallel::gpt_neo::{
    expand_attention_types, get_block_length_and_num_blocks, AttentionLayerType, GptNeoConfig,
    GptNeoConfigFields, GptNeoForCausalLM, GptNeoModel,
};
use rust_tensor_parallel::{Config, TensorParallelError};
use std::io::Write;
use tch::{nn, Device, Kind, Tensor};

fn small_config(
    attention_types: Vec<(Vec<AttentionLayerType>, i64)>,
    num_layers: i64,
) -> anyhow::Result<GptNeoConfig> {
    Ok(GptNeoConfig::from_fields(GptNeoConfigFields {
        vocab_size: 64,
        max_position_embeddings: 32,
        hidden_size: 32,
        num_heads: 4,
        window_size: 4,
        attention_types,
        num_layers,
        ..Default::default()
    })?)
}

#[test]
fn gpt_neo_attention_types_expansion() -> anyhow::Result<()> {
    use AttentionLayerType::{Global, Local};

    let groups = vec![(vec![Global, Local], 2), (vec![Local], 3), (vec![Global], 0)];
    let expanded = expand_attention_types(&groups)?;
    assert_eq!(
        expanded.len() as i64,
        groups.iter().map(|(_, count)| count).sum::<i64>()
    );
    assert_eq!(
        expanded,
        vec![Global, Local, Global, Local, Local, Local, Local]
    );

    assert!(expand_attention_types(&[(vec![Global], -1)]).is_err());
    Ok(())
}

#[test]
fn gpt_neo_config_layer_count_mismatch() -> anyhow::Result<()> {
    use AttentionLayerType::{Global, Local};

    let result = GptNeoConfig::new(vec![(vec![Global, Local], 1), (vec![Global], 1)], 4);
    assert!(matches!(
        result,
        Err(TensorParallelError::InvalidConfigurationError(_))
    ));

    let config = GptNeoConfig::new(vec![(vec![Global, Local], 1), (vec![Global], 2)], 4)?;
    assert_eq!(config.num_layers(), 4);
    assert_eq!(config.attention_layers(), [Global, Local, Global, Global]);
    Ok(())
}

#[test]
fn gpt_neo_config_rejects_invalid_heads_and_window() -> anyhow::Result<()> {
    use AttentionLayerType::{Global, Local};

    let fields = GptNeoConfigFields {
        hidden_size: 32,
        num_heads: 4,
        window_size: 4,
        attention_types: vec![(vec![Global, Local], 1)],
        num_layers: 2,
        ..Default::default()
    };
    let config = GptNeoConfig::from_fields(fields.clone())?;
    assert_eq!(
        (config.hidden_size(), config.num_heads(), config.window_size()),
        (32, 4, 4)
    );

    for invalid in [
        GptNeoConfigFields {
            num_heads: 0,
            ..fields.clone()
        },
        GptNeoConfigFields {
            num_heads: 5,
            ..fields.clone()
        },
        GptNeoConfigFields {
            window_size: 1,
            ..fields.clone()
        },
    ] {
        assert!(matches!(
            GptNeoConfig::from_fields(invalid),
            Err(TensorParallelError::InvalidConfigurationError(_))
        ));
    }

    let global_only = GptNeoConfig::from_fields(GptNeoConfigFields {
        window_size: 1,
        attention_types: vec![(vec![Global], 2)],
        ..fields
    })?;
    assert_eq!(global_only.window_size(), 1);
    Ok(())
}

#[test]
fn gpt_neo_config_file_round_trip() -> anyhow::Result<()> {
    let mut config_file = tempfile::NamedTempFile::new()?;
    write!(
        config_file,
        r#"{{
            "activation_function": "gelu_new",
            "attention_types": [[["global", "local"], 2]],
            "hidden_size": 64,
            "max_position_embeddings": 128,
            "model_type": "gpt_neo",
            "num_attention_heads": 8,
            "num_hidden_layers": 4,
            "vocab_size": 100,
            "window_size": 16
        }}"#
    )?;
    let config = GptNeoConfig::from_file(config_file.path())?;
    assert_eq!(config.num_layers(), 4);
    assert_eq!(config.num_heads(), 8);
    assert_eq!(config.head_dim(), 8);
    assert_eq!(config.intermediate_size(), 256);
    assert_eq!(config.attention_layers()[3], AttentionLayerType::Local);

    let output_dir = tempfile::tempdir()?;
    let output_path = output_dir.path().join("config.json");
    config.to_file(&output_path)?;
    let reloaded = GptNeoConfig::from_file(&output_path)?;
    assert_eq!(reloaded.attention_layers(), config.attention_layers());
    assert_eq!(reloaded.attention_types(), config.attention_types());
    assert_eq!(reloaded.window_size(), 16);

    let mut invalid_file = tempfile::NamedTempFile::new()?;
    write!(
        invalid_file,
        r#"{{"attention_types": [[["global"], 3]], "num_layers": 2}}"#
    )?;
    assert!(GptNeoConfig::from_file(invalid_file.path()).is_err());
    Ok(())
}

#[test]
fn gpt_neo_block_resolution() -> anyhow::Result<()> {
    assert_eq!(get_block_length_and_num_blocks(12, 10)?, (6, 2));
    assert_eq!(get_block_length_and_num_blocks(7, 5)?, (1, 7));
    assert_eq!(get_block_length_and_num_blocks(256, 256)?, (128, 2));
    assert!(matches!(
        get_block_length_and_num_blocks(12, 1),
        Err(TensorParallelError::NoValidWindowError { .. })
    ));
    Ok(())
}

#[test]
fn gpt_neo_unfold_windows_cover_input() -> anyhow::Result<()> {
    let (extent, size, step) = (11, 4, 3);
    let input = Tensor::arange(2 * extent, (Kind::Float, Device::Cpu)).view([2, extent]);
    let windows = unfold(&input, 1, size, step)?;
    let num_windows = (extent - size) / step + 1;
    assert_eq!(windows.size(), [2, num_windows, size]);

    // Writing every window back at its offset reproduces the covered positions
    let reconstructed = Tensor::zeros([2, extent], (Kind::Float, Device::Cpu));
    for window in 0..num_windows {
        reconstructed
            .narrow(1, window * step, size)
            .copy_(&windows.select(1, window));
    }
    let covered = (num_windows - 1) * step + size;
    assert!(reconstructed
        .narrow(1, 0, covered)
        .equal(&input.narrow(1, 0, covered)));
    Ok(())
}

#[test]
fn gpt_neo_model_forward_with_padding() -> anyhow::Result<()> {
    tch::manual_seed(0);
    let mut config = small_config(
        vec![(vec![AttentionLayerType::Global, AttentionLayerType::Local], 1)],
        2,
    )?;
    config.output_attentions = Some(true);
    config.output_hidden_states = Some(true);

    let vs = nn::VarStore::new(Device::Cpu);
    let model = GptNeoModel::new(vs.root() / "transformer", &config)?;

    let input_ids = Tensor::from_slice(&[5i64, 6, 7, 8, 9, 10, 11, 12, 1, 2, 3, 0]).view([2, 6]);
    let attention_mask = Tensor::from_slice(&[1i64, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0]).view([2, 6]);
    let output = tch::no_grad(|| {
        model.forward_t(
            Some(&input_ids),
            None,
            None,
            Some(&attention_mask),
            None,
            None,
            false,
        )
    })?;

    assert_eq!(output.hidden_states.size(), [2, 6, 32]);
    assert_eq!(output.all_hidden_states.as_ref().map(Vec::len), Some(3));
    let attentions = output.all_attentions.as_ref().map(Vec::len);
    assert_eq!(attentions, Some(2));
    let cache = output.next_cache.as_ref().map(Vec::len);
    assert_eq!(cache, Some(2));
    assert_eq!(output.hidden_states.isnan().any().int64_value(&[]), 0);
    Ok(())
}

#[test]
fn gpt_neo_incremental_decoding_matches_full_forward() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let config = small_config(
        vec![(vec![AttentionLayerType::Global, AttentionLayerType::Local], 1)],
        2,
    )?;
    let vs = nn::VarStore::new(Device::Cpu);
    let model = GptNeoForCausalLM::new(vs.root(), &config)?;

    let input_ids = Tensor::from_slice(&[3i64, 14, 15, 9, 26, 53, 5]).view([1, -1]);
    let prefix = input_ids.narrow(1, 0, 6);
    let next_token = input_ids.narrow(1, 6, 1);

    let full_output =
        tch::no_grad(|| model.forward_t(Some(&input_ids), None, None, None, None, None, false))?;
    let prefix_output =
        tch::no_grad(|| model.forward_t(Some(&prefix), None, None, None, None, None, false))?;
    let prefix_cache = prefix_output.next_cache;
    let step_output = tch::no_grad(|| {
        model.forward_t(
            Some(&next_token),
            None,
            prefix_cache,
            None,
            None,
            None,
            false,
        )
    })?;

    assert_eq!(full_output.hidden_states.size(), [1, 7, 64]);
    assert_eq!(step_output.hidden_states.size(), [1, 1, 64]);
    assert!(prefix_output
        .hidden_states
        .allclose(&full_output.hidden_states.narrow(1, 0, 6), 1e-4, 1e-4, false));
    assert!(step_output
        .hidden_states
        .allclose(&full_output.hidden_states.narrow(1, 6, 1), 1e-4, 1e-4, false));

    let cache = step_output.next_cache.unwrap_or_default();
    let first_layer = cache.first().and_then(Option::as_ref);
    assert_eq!(
        first_layer.map(|layer_state| layer_state.prev_key.size()),
        Some(vec![1, 4, 7, 8])
    );
    Ok(())
}
