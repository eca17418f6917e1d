use rust_tensor_parallel::gpt2::{GPT2LMHeadModel, Gpt2Config, Gpt2LayerPolicy, Gpt2Model};
use rust_tensor_parallel::parallel::LayerPolicy;
use rust_tensor_parallel::{Activation, Config, TensorParallelError};
use std::io::Write;
use tch::{nn, Device, Tensor};

fn small_config() -> Gpt2Config {
    Gpt2Config {
        attn_pdrop: Some(0.0),
        embd_pdrop: Some(0.0),
        resid_pdrop: Some(0.0),
        n_ctx: 32,
        n_embd: 32,
        n_head: 4,
        n_layer: 2,
        n_positions: 32,
        vocab_size: 64,
        ..Default::default()
    }
}

#[test]
fn gpt2_config_from_file() -> anyhow::Result<()> {
    let mut config_file = tempfile::NamedTempFile::new()?;
    write!(
        config_file,
        r#"{{
            "activation_function": "gelu_new",
            "initializer_range": 0.02,
            "layer_norm_epsilon": 1e-05,
            "n_ctx": 1024,
            "n_embd": 768,
            "n_head": 12,
            "n_layer": 12,
            "n_positions": 1024,
            "vocab_size": 50257
        }}"#
    )?;
    let config = Gpt2Config::from_file(config_file.path())?;
    assert_eq!(config.afn, Some(Activation::gelu_new));
    assert_eq!(config.n_head, 12);

    let mut invalid_file = tempfile::NamedTempFile::new()?;
    write!(
        invalid_file,
        r#"{{
            "initializer_range": 0.02,
            "layer_norm_epsilon": 1e-05,
            "n_ctx": 1024,
            "n_embd": 100,
            "n_head": 12,
            "n_layer": 12,
            "n_positions": 1024,
            "vocab_size": 50257
        }}"#
    )?;
    assert!(matches!(
        Gpt2Config::from_file(invalid_file.path()),
        Err(TensorParallelError::InvalidConfigurationError(_))
    ));
    Ok(())
}

#[test]
fn gpt2_incremental_decoding_matches_full_forward() -> anyhow::Result<()> {
    tch::manual_seed(7);
    let config = small_config();
    let vs = nn::VarStore::new(Device::Cpu);
    let model = GPT2LMHeadModel::new(vs.root(), &config)?;

    let input_ids = Tensor::from_slice(&[2i64, 7, 1, 8, 28, 18]).view([1, -1]);
    let prefix = input_ids.narrow(1, 0, 5);
    let next_token = input_ids.narrow(1, 5, 1);

    let full_output =
        tch::no_grad(|| model.forward_t(Some(&input_ids), None, None, None, None, None, false))?;
    let prefix_output =
        tch::no_grad(|| model.forward_t(Some(&prefix), None, None, None, None, None, false))?;
    let cache = prefix_output.cache.unwrap_or_default();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache[0].size(), [2, 1, 4, 5, 8]);

    let step_output = tch::no_grad(|| {
        model.forward_t(Some(&next_token), Some(&cache), None, None, None, None, false)
    })?;

    assert_eq!(full_output.output.size(), [1, 6, 64]);
    assert!(step_output
        .output
        .allclose(&full_output.output.narrow(1, 5, 1), 1e-4, 1e-4, false));
    Ok(())
}

#[test]
fn gpt2_reduced_arguments_are_not_cumulative() -> anyhow::Result<()> {
    let config = Gpt2Config {
        n_embd: 64,
        n_head: 8,
        n_layer: 1,
        ..small_config()
    };
    let vs = nn::VarStore::new(Device::Cpu);
    let mut model = Gpt2Model::new(vs.root() / "transformer", &config)?;
    let blocks = Gpt2LayerPolicy::block_layers_mut(&mut model, &config);

    Gpt2LayerPolicy::reduce_arguments(&mut blocks[0], 4, &config)?;
    Gpt2LayerPolicy::reduce_arguments(&mut blocks[0], 4, &config)?;
    let attention = blocks[0].attention();
    assert_eq!(attention.num_heads(), 2);
    assert_eq!(attention.embed_dim(), 16);
    assert_eq!(attention.split_size(), 16);

    assert!(matches!(
        Gpt2LayerPolicy::reduce_arguments(&mut blocks[0], 3, &config),
        Err(TensorParallelError::ShardingPreconditionError(_))
    ));
    assert_eq!(blocks[0].attention().num_heads(), 2);
    Ok(())
}

#[test]
fn gpt2_model_rejects_invalid_head_split() -> anyhow::Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    for config in [
        Gpt2Config {
            n_head: 0,
            n_layer: 1,
            ..small_config()
        },
        Gpt2Config {
            n_head: 5,
            n_layer: 1,
            ..small_config()
        },
        Gpt2Config {
            n_layer: -1,
            ..small_config()
        },
    ] {
        assert!(matches!(
            Gpt2Model::new(vs.root() / "transformer", &config),
            Err(TensorParallelError::InvalidConfigurationError(_))
        ));
        assert!(matches!(
            GPT2LMHeadModel::new(vs.root(), &config),
            Err(TensorParallelError::InvalidConfigurationError(_))
        ));
    }
    Ok(())
}
