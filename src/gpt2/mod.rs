//! # GPT2 (Radford et al.)
//!
//! Implementation of the GPT2 language model ([Language Models are Unsupervised Multitask Learners](https://d4mucfpksywv.cloudfront.net/better-language-models/language_models_are_unsupervised_multitask_learners.pdf) Radford, Wu, Child, Luan, Amodei, Sutskever 2019).
//! The base model is implemented in the `gpt2_model::Gpt2Model` struct. The model also includes a language model head: `gpt2_model::GPT2LMHeadModel`.
//! [`Gpt2LayerPolicy`] describes how the model is split across tensor-parallel ranks.
//!
//! # Model set-up
//!
//! - Configuration file expected to have a structure following the [Transformers library](https://github.com/huggingface/transformers)
//! - Model weights are expected to have a structure and parameter names following the [Transformers library](https://github.com/huggingface/transformers). A conversion using the Python utility scripts is required to convert the `.bin` weights to the `.ot` format.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use rust_tensor_parallel::gpt2::{GPT2LMHeadModel, Gpt2Config};
//! use rust_tensor_parallel::Config;
//! use tch::{nn, Device};
//!
//! let device = Device::cuda_if_available();
//! let mut vs = nn::VarStore::new(device);
//! let config = Gpt2Config::from_file("path/to/config.json")?;
//! let gpt2_model = GPT2LMHeadModel::new(vs.root(), &config)?;
//! vs.load("path/to/model.ot")?;
//! # Ok(())
//! # }
//! ```

mod attention;
mod gpt2_model;
mod policy;
mod transformer;

pub use attention::{GPTConv1D, Gpt2Attention};
pub use gpt2_model::{GPT2LMHeadModel, Gpt2Config, Gpt2Model, Gpt2ModelOutput};
pub use policy::Gpt2LayerPolicy;
pub use transformer::{Gpt2Block, Gpt2Mlp};
