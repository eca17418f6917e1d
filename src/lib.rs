//! # Tensor-parallel layer policies for transformer language models
//!
//! Rust-native descriptions of how GPT-Neo and GPT2 models built on `tch-rs` are split across
//! tensor-parallel ranks, together with the model implementations they address.
//!
//! - [`parallel`]: the [`LayerPolicy`](parallel::LayerPolicy) capability set, layer descriptors
//! and the [`ShardingPlan`](parallel::ShardingPlan) consumed by a parallel runtime
//! - [`gpt_neo`]: GPT-Neo model with global and local (windowed) attention layers, its
//! configuration and policy. Local attention relies on graph-traceable helpers
//! ([`gpt_neo::attention_utils`]).
//! - [`gpt2`]: GPT2 model and policy
//! - [`onnx`]: export descriptions (dynamic axes, dummy inputs) for ONNX graph export
//!
//! Model configurations follow the layout of the HuggingFace `config.json` files and are loaded
//! with [`Config::from_file`]. Every fallible operation returns a [`TensorParallelError`].
//!
//! The crate emits `tracing` events (hyperparameter reduction and plan construction at `debug`
//! level, block resolution at `trace` level) and does not install a subscriber.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use rust_tensor_parallel::gpt2::{Gpt2Config, Gpt2Model};
//! use rust_tensor_parallel::parallel::ParallelModel;
//! use tch::{nn, Device};
//!
//! let config = Gpt2Config::default();
//! let vs = nn::VarStore::new(Device::Cpu);
//! let mut model = Gpt2Model::new(vs.root() / "transformer", &config)?;
//! let plan = ParallelModel::Gpt2(&mut model, &config).parallelize(2)?;
//! for spec in plan.iter_specs() {
//!     println!("{}: {:?} -> {:?}", spec.name, spec.weight_shape, spec.weight_shard_shape);
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod gpt2;
pub mod gpt_neo;
pub mod onnx;
pub mod parallel;

pub use common::error::TensorParallelError;
pub use common::{Activation, Config};
