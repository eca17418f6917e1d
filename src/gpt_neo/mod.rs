//! # GPT-Neo
//!
//! Implementation of the GPT-Neo language model ([The Pile: An 800GB Dataset of Diverse Text for Language Modeling](https://arxiv.org/abs/2101.00027) Gao, Leo and Biderman, Stella and Black, Sid and Golding, Laurence and Hoppe, Travis and Foster, Charles and Phang, Jason and He, Horace and Thite, Anish and Nabeshima, Noa and others, 2020).
//! The base model is implemented in the `gpt_neo_model::GptNeoModel` struct. A causal language modeling head is implemented in `gpt_neo_model::GptNeoForCausalLM`.
//! Layers alternate between global and local attention following the `attention_types` groups of the configuration.
//! Local attention is computed block-wise with the graph-traceable helpers of [`attention_utils`].
//!
//! [`GptNeoLayerPolicy`] describes how the model is split across tensor-parallel ranks.
//!
//! # Model set-up
//!
//! - Configuration file expected to have a structure following the [Transformers library](https://github.com/huggingface/transformers)
//! - Model weights are expected to have a structure and parameter names following the [Transformers library](https://github.com/huggingface/transformers). A conversion using the Python utility scripts is required to convert the `.bin` weights to the `.ot` format.
//!
//! ```no_run
//! use rust_tensor_parallel::gpt_neo::{GptNeoConfig, GptNeoForCausalLM};
//! use rust_tensor_parallel::Config;
//! use tch::{nn, Device, Tensor};
//!
//! fn main() -> anyhow::Result<()> {
//!     let device = Device::cuda_if_available();
//!     let config = GptNeoConfig::from_file("path/to/config.json")?;
//!     let mut vs = nn::VarStore::new(device);
//!     let model = GptNeoForCausalLM::new(vs.root(), &config)?;
//!     vs.load("path/to/rust_model.ot")?;
//!
//!     let input_ids = Tensor::from_slice(&[464i64, 2068, 7586, 21831]).view([1, -1]);
//!     let output = tch::no_grad(|| {
//!         model.forward_t(Some(&input_ids.to(device)), None, None, None, None, None, false)
//!     })?;
//!     let next_token = output.hidden_states.get(0).get(-1).argmax(-1, false);
//!     println!("{}", next_token.int64_value(&[]));
//!     Ok(())
//! }
//! ```

mod attention;
pub mod attention_utils;
mod decoder;
mod gpt_neo_model;
mod policy;

pub use attention::{GptNeoSelfAttention, LayerState};
pub use attention_utils::get_block_length_and_num_blocks;
pub use decoder::{GptNeoBlock, GptNeoMlp};
pub use gpt_neo_model::{
    expand_attention_types, AttentionLayerType, GptNeoConfig, GptNeoConfigFields,
    GptNeoForCausalLM, GptNeoModel, GptNeoModelOutput,
};
pub use policy::GptNeoLayerPolicy;
