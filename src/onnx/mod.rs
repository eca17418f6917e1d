//! # ONNX export descriptions
//!
//! Describes the graph inputs and outputs (with their dynamic axes) of a model to export, and
//! builds the example inputs the model is traced with.
//! - [`OnnxConfig`]: export description shared by every model, parameterized by an [`OnnxTask`]
//! - [`GptNeoOnnxConfig`]: GPT-Neo description, optionally exposing the per-layer key/value cache
//! - [`ExportTokenizer`]: tokenizer capabilities needed to build dummy inputs, implemented for the
//! GPT2 tokenizer shipped with `rust_tokenizers`
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use rust_tensor_parallel::gpt_neo::GptNeoConfig;
//! use rust_tensor_parallel::onnx::{GptNeoOnnxConfig, OnnxConfig, OnnxTask};
//! use rust_tensor_parallel::Config;
//! use rust_tokenizers::tokenizer::Gpt2Tokenizer;
//! use tch::Device;
//!
//! let config = GptNeoConfig::from_file("path/to/config.json")?;
//! let tokenizer = Gpt2Tokenizer::from_file("path/to/vocab.json", "path/to/merges.txt", false)?;
//! let onnx_config = GptNeoOnnxConfig::with_past(config, OnnxTask::CausalLm);
//! let dummy_inputs = onnx_config.generate_dummy_inputs(&tokenizer, -1, -1, false, Some(Device::Cpu))?;
//! # Ok(())
//! # }
//! ```

mod config;
mod gpt_neo;
mod tokenizer;

pub use config::{
    compute_effective_axis_dimension, default_dummy_inputs, flatten_nested_field,
    AxesDescription, AxisMap, DummyInput, DummyInputs, OnnxConfig, OnnxTask, ATOL_FOR_VALIDATION,
    DEFAULT_FIXED_BATCH, DEFAULT_FIXED_SEQUENCE, DEFAULT_ONNX_OPSET,
};
pub use gpt_neo::GptNeoOnnxConfig;
pub use tokenizer::ExportTokenizer;
